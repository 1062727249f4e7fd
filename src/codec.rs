use std::convert::TryInto;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_PAYLOAD_LENGTH;
use crate::frame::{self, Request, Response};

/// Client side of the wire protocol: encodes requests, decodes responses.
///
/// Decoding is resumable. Partial frames stay in the buffer and `decode` returns `Ok(None)` until
/// the whole frame has arrived, so it does not matter how the stream is chunked.
#[derive(Clone, Debug)]
pub struct ClientCodec {
    max_payload_length: usize,
}

/// Peer side of the wire protocol: decodes requests, encodes responses.
#[derive(Clone, Debug)]
pub struct PeerCodec {
    max_payload_length: usize,
}

impl ClientCodec {
    pub fn new(max_payload_length: usize) -> ClientCodec {
        ClientCodec { max_payload_length }
    }
}

impl PeerCodec {
    pub fn new(max_payload_length: usize) -> PeerCodec {
        PeerCodec { max_payload_length }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LENGTH)
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LENGTH)
    }
}

/// Refuses to encode a frame the other side would reject for its size.
fn check_payload_length(length: usize, max: usize) -> Result<(), frame::Error> {
    if length > max {
        return Err(frame::Error::PayloadTooLarge { length, max });
    }
    Ok(())
}

/// Runs `parse` over the buffered bytes and, on success, drops the consumed frame from `src`.
fn decode_with<T>(
    src: &mut BytesMut,
    parse: impl FnOnce(&mut Cursor<&[u8]>) -> Result<T, frame::Error>,
) -> Result<Option<T>, frame::Error> {
    let mut cursor = Cursor::new(&src[..]);
    let item = match parse(&mut cursor) {
        Ok(item) => item,
        Err(frame::Error::Incomplete) => return Ok(None), // Not enough data to parse a frame.
        Err(err) => return Err(err),
    };

    let position: usize = cursor
        .position()
        .try_into()
        .map_err(|_| frame::Error::Malformed("cursor position is too large".to_string()))?;

    // Remove the parsed frame from the buffer.
    src.advance(position);

    Ok(Some(item))
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = frame::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_payload_length;
        decode_with(src, |cursor| Response::parse(cursor, max))
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = frame::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_payload_length(request.command.payload_length(), self.max_payload_length)?;
        request.write(dst)
    }
}

impl Decoder for PeerCodec {
    type Item = Request;
    type Error = frame::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_payload_length;
        decode_with(src, |cursor| Request::parse(cursor, max))
    }
}

impl Encoder<Response> for PeerCodec {
    type Error = frame::Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_payload_length(response.value.payload_length(), self.max_payload_length)?;
        response.write(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Get, Set};

    fn decode_in_two_parts(bytes: &[u8], split: usize) -> Option<Response> {
        let mut codec = ClientCodec::default();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(&bytes[..split]);
        if split < bytes.len() {
            assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        }
        buffer.extend_from_slice(&bytes[split..]);

        let response = codec.decode(&mut buffer).unwrap();
        assert!(buffer.is_empty());
        response
    }

    #[test]
    fn decode_split_at_every_boundary() {
        for response in [Response::null(3), Response::string(4, "hello world")] {
            let bytes = response.serialize().unwrap();
            for split in 0..=bytes.len() {
                assert_eq!(
                    decode_in_two_parts(&bytes, split),
                    Some(response.clone()),
                    "split at byte {}",
                    split
                );
            }
        }
    }

    #[test]
    fn decode_one_byte_at_a_time() {
        let expected = Response::string(9, "chunked");
        let bytes = expected.serialize().unwrap();
        let mut codec = ClientCodec::default();
        let mut buffer = BytesMut::new();

        let mut decoded = Vec::new();
        for byte in bytes {
            buffer.extend_from_slice(&[byte]);
            if let Some(response) = codec.decode(&mut buffer).unwrap() {
                decoded.push(response);
            }
        }

        assert_eq!(decoded, vec![expected]);
    }

    #[test]
    fn decode_several_frames_from_one_buffer() {
        let mut codec = ClientCodec::default();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&Response::string(2, "b").serialize().unwrap());
        buffer.extend_from_slice(&Response::null(1).serialize().unwrap());

        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Response::string(2, "b"))
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Response::null(1)));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn decode_rejects_payload_over_limit() {
        let mut codec = ClientCodec::new(4);
        let bytes = Response::string(1, "too long").serialize().unwrap();
        let mut buffer = BytesMut::from(&bytes[..]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(frame::Error::PayloadTooLarge { length: 8, max: 4 })
        ));
    }

    #[test]
    fn peer_codec_decodes_what_client_codec_encodes() {
        let mut client = ClientCodec::default();
        let mut peer = PeerCodec::default();
        let mut buffer = BytesMut::new();

        let get = Request::new(1, Get { key: "a".into() });
        let set = Request::new(
            2,
            Set {
                key: "a".into(),
                value: "b".into(),
            },
        );
        client.encode(get.clone(), &mut buffer).unwrap();
        client.encode(set.clone(), &mut buffer).unwrap();

        assert_eq!(peer.decode(&mut buffer).unwrap(), Some(get));
        assert_eq!(peer.decode(&mut buffer).unwrap(), Some(set));
        assert!(buffer.is_empty());
    }

    #[test]
    fn encode_rejects_payload_over_limit() {
        let mut client = ClientCodec::new(8);
        let mut buffer = BytesMut::new();

        let set = Request::new(
            1,
            Set {
                key: "k".into(),
                value: "v".into(),
            },
        );

        assert!(matches!(
            client.encode(set, &mut buffer),
            Err(frame::Error::PayloadTooLarge { length: 10, max: 8 })
        ));
        assert!(buffer.is_empty());

        let mut peer = PeerCodec::new(2);
        assert!(peer.encode(Response::string(1, "abc"), &mut buffer).is_err());
        assert!(buffer.is_empty());
    }
}
