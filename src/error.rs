use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

use crate::frame;

/// Errors surfaced to callers of the client.
///
/// The type is `Clone` so that a single close reason can be handed to every request that was
/// still waiting when the connection went down.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// Transport failure: the sockets could not be opened, the handshake failed, or a read/write
    /// on an established connection failed.
    #[error("connection error: {0}")]
    Connection(Arc<io::Error>),
    /// Malformed frame, unknown type tag or oversized payload. Raised for a single call when the
    /// request is refused before it is sent, or its response does not fit the operation.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("correlation id {0} is already in flight")]
    DuplicateId(u32),
    #[error("connection is not open")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("request {0} timed out")]
    Timeout(u32),
}

impl Error {
    /// Whether this error takes the whole connection down when the connection itself runs into it,
    /// as opposed to failing a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::DuplicateId(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Connection(Arc::new(err))
    }
}

impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Error {
        match err {
            frame::Error::Io(err) => Error::Connection(Arc::new(err)),
            err => Error::Protocol(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_map_to_protocol_errors() {
        let err: Error = frame::Error::InvalidResponseType(9).into();
        assert!(matches!(err, Error::Protocol(ref msg) if msg.contains('9')));
        assert!(err.is_fatal());
    }

    #[test]
    fn per_call_errors_are_not_fatal() {
        assert!(!Error::Timeout(3).is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(!Error::TypeMismatch {
            expected: "string",
            actual: "null".to_string()
        }
        .is_fatal());
    }
}
