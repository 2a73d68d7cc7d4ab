//! Response decoder and encoder, mirroring the request pair.

use bytes::{BufMut, BytesMut};
use http::header;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::head;
use crate::protocol::{Body, ParseError, SendError};
use crate::Response;

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// A decoder producing whole HTTP/1.1 responses.
#[derive(Default)]
pub struct ResponseDecoder {
    pending: Option<(http::Response<()>, u64)>,
}

impl ResponseDecoder {
    /// Creates a new `ResponseDecoder` instance
    pub fn new() -> Self {
        Default::default()
    }
}

impl Decoder for ResponseDecoder {
    type Item = Response;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (head, body_len) = match self.pending.take() {
            Some(pending) => pending,
            None => match head::decode_response_head(src)? {
                Some(parsed) => parsed,
                None => return Ok(None),
            },
        };

        if (src.len() as u64) < body_len {
            src.reserve(body_len as usize - src.len());
            self.pending = Some((head, body_len));
            return Ok(None);
        }

        let body = src.split_to(body_len as usize).freeze();
        let (parts, ()) = head.into_parts();
        Ok(Some(Response::from_parts(parts, Body::Full(body))))
    }
}

/// An encoder writing whole HTTP/1.1 responses.
#[derive(Default)]
pub struct ResponseEncoder;

impl ResponseEncoder {
    /// Creates a new `ResponseEncoder` instance
    pub fn new() -> Self {
        Default::default()
    }
}

impl Encoder<Response> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (parts, body) = response.into_parts();

        let body = match body {
            Body::Full(bytes) => bytes,
            Body::Stream(_) => {
                return Err(SendError::invalid_body("streamed response bodies can't be written"))
            }
        };

        if parts.version != http::Version::HTTP_11 {
            return Err(SendError::unsupported_version(parts.version));
        }

        dst.reserve(INIT_HEADER_SIZE + body.len());

        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(parts.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(parts.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.put_slice(b"\r\n");

        for (name, value) in parts.headers.iter() {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }

        dst.put_slice(b"Content-Length: ");
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_slice(b"\r\n\r\n");

        dst.put_slice(&body);
        Ok(())
    }
}
