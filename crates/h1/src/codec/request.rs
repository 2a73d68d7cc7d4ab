//! Request decoder and encoder.
//!
//! The decoder works in two phases: parse the head, then wait for the
//! full length-delimited body, emitting one complete request per decode.
//! The encoder writes the request line, headers, an explicit
//! `Content-Length` and the payload in one piece.

use bytes::{BufMut, BytesMut};
use http::header;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::head;
use crate::protocol::{Body, ParseError, SendError};
use crate::Request;

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// A decoder producing whole HTTP/1.1 requests.
#[derive(Default)]
pub struct RequestDecoder {
    /// Parsed head waiting for its body, with the body length.
    pending: Option<(http::Request<()>, u64)>,
}

impl RequestDecoder {
    /// Creates a new `RequestDecoder` instance
    pub fn new() -> Self {
        Default::default()
    }
}

impl Decoder for RequestDecoder {
    type Item = Request;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (head, body_len) = match self.pending.take() {
            Some(pending) => pending,
            None => match head::decode_request_head(src)? {
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
        Ok(Some(Request::from_parts(parts, Body::Full(body))))
    }
}

/// An encoder writing whole HTTP/1.1 requests.
#[derive(Default)]
pub struct RequestEncoder;

impl RequestEncoder {
    /// Creates a new `RequestEncoder` instance
    pub fn new() -> Self {
        Default::default()
    }
}

impl Encoder<Request> for RequestEncoder {
    type Error = SendError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (parts, body) = request.into_parts();

        let body = match body {
            Body::Full(bytes) => bytes,
            Body::Stream(_) => {
                return Err(SendError::invalid_body("streamed request bodies can't be written"))
            }
        };

        if parts.version != http::Version::HTTP_11 {
            return Err(SendError::unsupported_version(parts.version));
        }

        dst.reserve(INIT_HEADER_SIZE + body.len());

        dst.put_slice(parts.method.as_str().as_bytes());
        dst.put_u8(b' ');
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        dst.put_slice(path.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");

        // a request without an explicit Host gets one from the uri authority
        if !parts.headers.contains_key(header::HOST) {
            if let Some(authority) = parts.uri.authority() {
                dst.put_slice(b"Host: ");
                dst.put_slice(authority.as_str().as_bytes());
                dst.put_slice(b"\r\n");
            }
        }

        for (name, value) in parts.headers.iter() {
            // the payload is length-delimited below, whatever the caller set
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

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn encode_then_decode() {
        let request = http::Request::builder()
            .method(Method::POST)
            .uri("http://foobar.com/aaa?x=1")
            .header("x-custom", "yes")
            .body(Body::from("body number 7"))
            .unwrap();

        let mut buf = BytesMut::new();
        RequestEncoder::new().encode(request, &mut buf).unwrap();

        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("POST /aaa?x=1 HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("Host: foobar.com\r\n"), "{text}");
        assert!(text.contains("Content-Length: 13\r\n"), "{text}");

        let decoded = RequestDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.method(), Method::POST);
        assert_eq!(decoded.uri().path(), "/aaa");
        assert_eq!(decoded.headers().get(header::HOST).unwrap(), "foobar.com");
        assert_eq!(decoded.headers().get("x-custom").unwrap(), "yes");
        assert_eq!(decoded.body().as_bytes().unwrap().as_ref(), b"body number 7");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_across_partial_reads() {
        let request = http::Request::builder()
            .uri("http://a.b/c")
            .body(Body::from("0123456789"))
            .unwrap();

        let mut wire = BytesMut::new();
        RequestEncoder::new().encode(request, &mut wire).unwrap();

        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(request) = decoder.decode(&mut buf).unwrap() {
                decoded = Some(request);
            }
        }

        let decoded = decoded.expect("request should decode once all bytes arrived");
        assert_eq!(decoded.body().as_bytes().unwrap().as_ref(), b"0123456789");
    }

    #[test]
    fn two_requests_back_to_back() {
        let mut wire = BytesMut::new();
        for i in 0..2 {
            let request = http::Request::builder()
                .uri(format!("http://foobar{i}.com/aaa"))
                .body(Body::empty())
                .unwrap();
            RequestEncoder::new().encode(request, &mut wire).unwrap();
        }

        let mut decoder = RequestDecoder::new();
        let first = decoder.decode(&mut wire).unwrap().unwrap();
        let second = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first.headers().get(header::HOST).unwrap(), "foobar0.com");
        assert_eq!(second.headers().get(header::HOST).unwrap(), "foobar1.com");
        assert!(wire.is_empty());
    }

    #[test]
    fn streamed_body_is_refused() {
        use bytes::Bytes;
        use http_body_util::{BodyExt, Full};

        let stream = Full::new(Bytes::from_static(b"xx")).map_err(|never| match never {});
        let request = http::Request::builder().uri("/").body(Body::stream(stream)).unwrap();

        let err = RequestEncoder::new().encode(request, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, SendError::InvalidBody { .. }));
    }
}
