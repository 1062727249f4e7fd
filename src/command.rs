use std::fmt;

use crate::frame::Error;

/// Wire tag identifying the kind of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    /// Handshake sent once, on the reserved correlation id, when the connection starts.
    Connect = 0,
    GetString = 1,
    SetString = 2,
}

impl TryFrom<u32> for RequestType {
    type Error = Error;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Connect),
            1 => Ok(Self::GetString),
            2 => Ok(Self::SetString),
            _ => Err(Error::InvalidRequestType(tag)),
        }
    }
}

impl From<RequestType> for u32 {
    fn from(value: RequestType) -> Self {
        value as u32
    }
}

/// The operation carried by a request frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Connect(Connect),
    Get(Get),
    Set(Set),
}

impl Command {
    pub fn request_type(&self) -> RequestType {
        match self {
            Command::Connect(_) => RequestType::Connect,
            Command::Get(_) => RequestType::GetString,
            Command::Set(_) => RequestType::SetString,
        }
    }

    /// Size of the payload this command is encoded to.
    pub fn payload_length(&self) -> usize {
        match self {
            Command::Connect(cmd) => cmd.address.len(),
            Command::Get(cmd) => cmd.key.len(),
            // Key and value lengths, then the data.
            Command::Set(cmd) => 8 + cmd.key.len() + cmd.value.len(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect(cmd) => write!(f, "CONNECT {}", cmd.address),
            Command::Get(cmd) => write!(f, "GET {}", cmd.key),
            // Values may be large; only their size is interesting in logs.
            Command::Set(cmd) => write!(f, "SET {} <{} bytes>", cmd.key, cmd.value.len()),
        }
    }
}

/// Opens a logical connection to the peer identified by `address`.
#[derive(Clone, Debug, PartialEq)]
pub struct Connect {
    pub address: String,
}

/// Get the value of `key`. The peer answers with a null response if the key does not exist.
#[derive(Clone, Debug, PartialEq)]
pub struct Get {
    pub key: String,
}

/// Set `key` to hold `value`. The peer acknowledges with a null response.
#[derive(Clone, Debug, PartialEq)]
pub struct Set {
    pub key: String,
    pub value: String,
}

impl From<Get> for Command {
    fn from(cmd: Get) -> Self {
        Command::Get(cmd)
    }
}

impl From<Set> for Command {
    fn from(cmd: Set) -> Self {
        Command::Set(cmd)
    }
}

impl From<Connect> for Command {
    fn from(cmd: Connect) -> Self {
        Command::Connect(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_tags() {
        assert_eq!(u32::from(RequestType::GetString), 1);
        assert_eq!(u32::from(RequestType::SetString), 2);
        assert_eq!(RequestType::try_from(2).unwrap(), RequestType::SetString);
        assert!(matches!(
            RequestType::try_from(7),
            Err(Error::InvalidRequestType(7))
        ));
    }

    #[test]
    fn display_hides_values() {
        let cmd = Command::from(Set {
            key: "k".to_string(),
            value: "secret".to_string(),
        });
        assert_eq!(cmd.to_string(), "SET k <6 bytes>");
    }

    #[test]
    fn payload_length_counts_set_prefixes() {
        let set = Command::from(Set {
            key: "key".to_string(),
            value: "value".to_string(),
        });
        assert_eq!(set.payload_length(), 16);
        assert_eq!(Command::from(Get { key: "key".into() }).payload_length(), 3);
    }
}
