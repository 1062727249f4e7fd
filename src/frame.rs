// Frame layout, all integers little-endian:
//
//   [id u32][type u32][payload length u32][payload]
//
// Requests and responses share the header shape. A `SetString` payload is
// `[key length u32][value length u32][key][value]`, `GetString` and `Connect` payloads are the raw
// key/address bytes. A `String` response carries UTF-8 bytes, a `Null` response nothing.

use std::fmt;
use std::io::{self, Cursor};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error as ThisError;

use crate::command::{Command, Connect, Get, RequestType, Set};

/// Size of the fixed frame header: correlation id, type tag and payload length.
pub const HEADER_LENGTH_IN_BYTES: usize = 12;

/// Correlation id reserved for the connection handshake.
pub const HANDSHAKE_ID: u32 = 0;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid request type: {0}")]
    InvalidRequestType(u32),
    #[error("invalid response type: {0}")]
    InvalidResponseType(u32),
    #[error("payload of {length} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { length: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Wire tag identifying the kind of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    Null = 0,
    String = 1,
}

impl TryFrom<u32> for ResponseType {
    type Error = Error;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Null),
            1 => Ok(Self::String),
            _ => Err(Error::InvalidResponseType(tag)),
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Null => write!(f, "null"),
            ResponseType::String => write!(f, "string"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub id: u32,
    pub tag: u32,
    pub payload_length: usize,
}

impl Header {
    /// Reads a header and checks that the whole frame it announces is buffered.
    fn parse(src: &mut Cursor<&[u8]>, max_payload: usize) -> Result<Self, Error> {
        if src.remaining() < HEADER_LENGTH_IN_BYTES {
            return Err(Error::Incomplete);
        }

        let id = src.get_u32_le();
        let tag = src.get_u32_le();
        let payload_length = src.get_u32_le() as usize;

        // Checked before the payload is buffered.
        if payload_length > max_payload {
            return Err(Error::PayloadTooLarge {
                length: payload_length,
                max: max_payload,
            });
        }

        if src.remaining() < payload_length {
            return Err(Error::Incomplete);
        }

        Ok(Header {
            id,
            tag,
            payload_length,
        })
    }

    fn write(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let payload_length = wire_length(self.payload_length)?;
        dst.reserve(HEADER_LENGTH_IN_BYTES + self.payload_length);
        dst.put_u32_le(self.id);
        dst.put_u32_le(self.tag);
        dst.put_u32_le(payload_length);
        Ok(())
    }
}

/// A request frame: a command tagged with its correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: u32,
    pub command: Command,
}

impl Request {
    pub fn new(id: u32, command: impl Into<Command>) -> Request {
        Request {
            id,
            command: command.into(),
        }
    }

    pub fn parse(src: &mut Cursor<&[u8]>, max_payload: usize) -> Result<Self, Error> {
        let header = Header::parse(src, max_payload)?;
        let request_type = RequestType::try_from(header.tag)?;
        let mut payload = take(src, header.payload_length);

        let command = match request_type {
            RequestType::Connect => Command::Connect(Connect {
                address: utf8(payload)?,
            }),
            RequestType::GetString => Command::Get(Get { key: utf8(payload)? }),
            RequestType::SetString => {
                if payload.remaining() < 8 {
                    return Err(Error::Malformed(
                        "set payload is missing its length prefixes".to_string(),
                    ));
                }
                let key_length = payload.get_u32_le() as usize;
                let value_length = payload.get_u32_le() as usize;
                if key_length.checked_add(value_length) != Some(payload.remaining()) {
                    return Err(Error::Malformed(format!(
                        "set payload announces {} + {} bytes but carries {}",
                        key_length,
                        value_length,
                        payload.remaining()
                    )));
                }
                let key = utf8(payload.split_to(key_length))?;
                let value = utf8(payload)?;
                Command::Set(Set { key, value })
            }
        };

        Ok(Request {
            id: header.id,
            command,
        })
    }

    /// Appends the encoded frame to `dst`. Nothing is written if a length does not fit the header.
    pub fn write(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let header = Header {
            id: self.id,
            tag: u32::from(self.command.request_type()),
            payload_length: self.command.payload_length(),
        };

        match &self.command {
            Command::Connect(Connect { address: data }) | Command::Get(Get { key: data }) => {
                header.write(dst)?;
                dst.put_slice(data.as_bytes());
            }
            Command::Set(Set { key, value }) => {
                let key_length = wire_length(key.len())?;
                let value_length = wire_length(value.len())?;
                header.write(dst)?;
                dst.put_u32_le(key_length);
                dst.put_u32_le(value_length);
                dst.put_slice(key.as_bytes());
                dst.put_slice(value.as_bytes());
            }
        }

        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = BytesMut::new();
        self.write(&mut bytes)?;
        Ok(bytes.to_vec())
    }
}

/// The body of a response.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    /// Raw payload of a `String` response. Decoding it as UTF-8 is left to the caller, which
    /// knows whether it asked for text.
    String(Bytes),
}

impl Value {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Value::Null => ResponseType::Null,
            Value::String(_) => ResponseType::String,
        }
    }

    pub fn payload_length(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::String(bytes) => bytes.len(),
        }
    }
}

/// A response frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: u32,
    pub value: Value,
}

impl Response {
    pub fn null(id: u32) -> Response {
        Response {
            id,
            value: Value::Null,
        }
    }

    pub fn string(id: u32, data: impl Into<Bytes>) -> Response {
        Response {
            id,
            value: Value::String(data.into()),
        }
    }

    pub fn parse(src: &mut Cursor<&[u8]>, max_payload: usize) -> Result<Self, Error> {
        let header = Header::parse(src, max_payload)?;
        let response_type = ResponseType::try_from(header.tag)?;
        let payload = take(src, header.payload_length);

        let value = match response_type {
            ResponseType::Null if !payload.is_empty() => {
                return Err(Error::Malformed(format!(
                    "null response {} carries {} payload bytes",
                    header.id,
                    payload.len()
                )))
            }
            ResponseType::Null => Value::Null,
            ResponseType::String => Value::String(payload),
        };

        Ok(Response {
            id: header.id,
            value,
        })
    }

    pub fn write(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let payload: &[u8] = match &self.value {
            Value::Null => &[],
            Value::String(bytes) => &bytes[..],
        };

        Header {
            id: self.id,
            tag: self.value.response_type() as u32,
            payload_length: payload.len(),
        }
        .write(dst)?;
        dst.put_slice(payload);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = BytesMut::new();
        self.write(&mut bytes)?;
        Ok(bytes.to_vec())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Null => write!(f, "#{} null", self.id),
            Value::String(bytes) => write!(f, "#{} string <{} bytes>", self.id, bytes.len()),
        }
    }
}

/// Converts a length to its header field.
fn wire_length(length: usize) -> Result<u32, Error> {
    u32::try_from(length).map_err(|_| Error::PayloadTooLarge {
        length,
        max: u32::MAX as usize,
    })
}

fn take(src: &mut Cursor<&[u8]>, length: usize) -> Bytes {
    let start = src.position() as usize;
    let bytes = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
    src.advance(length);
    bytes
}

fn utf8(bytes: Bytes) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Malformed("invalid utf-8 string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn parse_get_request() {
        let data = b"\x07\x00\x00\x00\x01\x00\x00\x00\x03\x00\x00\x00foo";
        let mut cursor = Cursor::new(&data[..]);

        let request = Request::parse(&mut cursor, MAX).unwrap();

        assert_eq!(
            request,
            Request::new(
                7,
                Get {
                    key: "foo".to_string()
                }
            )
        );
        assert_eq!(cursor.position() as usize, data.len());
    }

    #[test]
    fn serialize_set_request() {
        let request = Request::new(
            1,
            Set {
                key: "k".to_string(),
                value: "vv".to_string(),
            },
        );

        let bytes = request.serialize().unwrap();

        let expected: &[u8] = b"\x01\x00\x00\x00\x02\x00\x00\x00\x0b\x00\x00\x00\
            \x01\x00\x00\x00\x02\x00\x00\x00kvv";
        assert_eq!(bytes, expected);
    }

    #[test]
    fn round_trip_get_request_with_null_response() {
        let request = Request::new(
            42,
            Get {
                key: "missing".to_string(),
            },
        );
        let bytes = request.serialize().unwrap();
        assert_eq!(
            Request::parse(&mut Cursor::new(&bytes[..]), MAX).unwrap(),
            request
        );

        let response = Response::null(42);
        let bytes = response.serialize().unwrap();
        assert_eq!(bytes.len(), HEADER_LENGTH_IN_BYTES);
        assert_eq!(
            Response::parse(&mut Cursor::new(&bytes[..]), MAX).unwrap(),
            response
        );
    }

    #[test]
    fn round_trip_set_request_with_string_response() {
        let request = Request::new(
            u32::MAX,
            Set {
                key: "ключ".to_string(),
                value: "".to_string(),
            },
        );
        let bytes = request.serialize().unwrap();
        assert_eq!(
            Request::parse(&mut Cursor::new(&bytes[..]), MAX).unwrap(),
            request
        );

        let response = Response::string(u32::MAX, "value");
        let bytes = response.serialize().unwrap();
        assert_eq!(
            Response::parse(&mut Cursor::new(&bytes[..]), MAX).unwrap(),
            response
        );
    }

    #[test]
    fn parse_incomplete_header() {
        let data = b"\x01\x00\x00\x00\x01\x00";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Response::parse(&mut cursor, MAX),
            Err(Error::Incomplete)
        ));
    }

    #[test]
    fn parse_incomplete_payload() {
        let data = b"\x01\x00\x00\x00\x01\x00\x00\x00\x05\x00\x00\x00abc";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Response::parse(&mut cursor, MAX),
            Err(Error::Incomplete)
        ));
    }

    #[test]
    fn parse_unknown_response_type() {
        let data = b"\x01\x00\x00\x00\x09\x00\x00\x00\x00\x00\x00\x00";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Response::parse(&mut cursor, MAX),
            Err(Error::InvalidResponseType(9))
        ));
    }

    #[test]
    fn parse_oversized_payload_without_waiting_for_it() {
        let data = b"\x01\x00\x00\x00\x01\x00\x00\x00\xff\xff\x00\x00";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Response::parse(&mut cursor, MAX),
            Err(Error::PayloadTooLarge {
                length: 0xffff,
                max: MAX
            })
        ));
    }

    #[test]
    fn parse_null_response_with_payload() {
        let data = b"\x01\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00x";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Response::parse(&mut cursor, MAX),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn parse_set_request_with_inconsistent_lengths() {
        let data = b"\x01\x00\x00\x00\x02\x00\x00\x00\x09\x00\x00\x00\
            \x05\x00\x00\x00\x05\x00\x00\x00k";
        let mut cursor = Cursor::new(&data[..]);

        assert!(matches!(
            Request::parse(&mut cursor, MAX),
            Err(Error::Malformed(_))
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn lengths_beyond_the_header_field_are_rejected() {
        assert_eq!(wire_length(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            wire_length(u32::MAX as usize + 1),
            Err(Error::PayloadTooLarge { .. })
        ));
    }
}
