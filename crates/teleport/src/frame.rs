//! Wire framing: a 4-byte little-endian correlation id followed by one
//! HTTP message from the injected codec.
//!
//! There is no length prefix; the codec's messages are self-delimiting.
//! The id is the only thing linking a response back to its request, which
//! is what lets the server answer out of order.
//!
//! The four frame codecs here are thin [`tokio_util::codec`] wrappers
//! pairing the id with the codec's message, one per direction and message
//! kind: the client encodes request frames and decodes response frames,
//! the server does the opposite.

use bytes::{Buf, BufMut, BytesMut};
use futures::{Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

use teleport_h1::{codec, ParseError, SendError};
use teleport_h1::{Request, Response};

use crate::error::ConnError;

/// Serialization of whole HTTP messages, injected into the engine.
///
/// Decoders are incremental: they consume exactly one complete message
/// per `Some` result and leave the buffer positioned at the next one, so
/// implementations keep their own partial-parse state. The engine never
/// looks inside the messages.
pub trait MessageCodec: Default + Send + 'static {
    /// Decodes one request, or returns `None` for more input.
    fn decode_request(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ParseError>;

    /// Encodes one request as a self-delimited message.
    fn encode_request(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), SendError>;

    /// Decodes one response, or returns `None` for more input.
    fn decode_response(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ParseError>;

    /// Encodes one response as a self-delimited message.
    fn encode_response(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), SendError>;
}

/// The default codec: HTTP/1.1 via [`teleport_h1`].
#[derive(Default)]
pub struct H1 {
    request_decoder: codec::RequestDecoder,
    request_encoder: codec::RequestEncoder,
    response_decoder: codec::ResponseDecoder,
    response_encoder: codec::ResponseEncoder,
}

impl MessageCodec for H1 {
    fn decode_request(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        self.request_decoder.decode(src)
    }

    fn encode_request(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), SendError> {
        self.request_encoder.encode(request, dst)
    }

    fn decode_response(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ParseError> {
        self.response_decoder.decode(src)
    }

    fn encode_response(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), SendError> {
        self.response_encoder.encode(response, dst)
    }
}

const ID_LEN: usize = 4;

macro_rules! frame_decoder {
    ($(#[$doc:meta])* $name:ident, $decode:ident, $item:ty) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name<C> {
            codec: C,
            current: Option<u32>,
        }

        impl<C: MessageCodec> $name<C> {
            /// Creates a decoder with a fresh codec.
            pub fn new() -> Self {
                Self { codec: C::default(), current: None }
            }

            /// The id of the message currently being decoded, if the id
            /// bytes have arrived but the message hasn't finished.
            pub fn in_flight(&self) -> Option<u32> {
                self.current
            }
        }

        impl<C: MessageCodec> Decoder for $name<C> {
            type Item = (u32, $item);
            type Error = ParseError;

            fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
                let id = match self.current {
                    Some(id) => id,
                    None => {
                        if src.len() < ID_LEN {
                            return Ok(None);
                        }
                        let id = src.get_u32_le();
                        self.current = Some(id);
                        id
                    }
                };

                match self.codec.$decode(src)? {
                    Some(message) => {
                        self.current = None;
                        Ok(Some((id, message)))
                    }
                    None => Ok(None),
                }
            }

            fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
                if let Some(message) = self.decode(src)? {
                    return Ok(Some(message));
                }
                if self.current.is_none() && src.is_empty() {
                    // end of stream on an id boundary: a clean close
                    return Ok(None);
                }
                Err(ParseError::io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a message",
                )))
            }
        }
    };
}

macro_rules! frame_encoder {
    ($(#[$doc:meta])* $name:ident, $encode:ident, $item:ty) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name<C> {
            codec: C,
        }

        impl<C: MessageCodec> $name<C> {
            /// Creates an encoder with a fresh codec.
            pub fn new() -> Self {
                Self { codec: C::default() }
            }
        }

        impl<C: MessageCodec> Encoder<(u32, $item)> for $name<C> {
            type Error = SendError;

            fn encode(&mut self, item: (u32, $item), dst: &mut BytesMut) -> Result<(), Self::Error> {
                let (id, message) = item;
                dst.reserve(ID_LEN);
                dst.put_u32_le(id);
                self.codec.$encode(message, dst)
            }
        }
    };
}

frame_decoder!(
    /// Decodes `(id, request)` frames: the server's read side.
    RequestFrameDecoder,
    decode_request,
    Request
);

frame_decoder!(
    /// Decodes `(id, response)` frames: the client's read side.
    ResponseFrameDecoder,
    decode_response,
    Response
);

frame_encoder!(
    /// Encodes `(id, request)` frames: the client's write side.
    RequestFrameEncoder,
    encode_request,
    Request
);

frame_encoder!(
    /// Encodes `(id, response)` frames: the server's write side.
    ResponseFrameEncoder,
    encode_response,
    Response
);

/// Reads the next frame off a framed stream, honoring an optional read
/// timeout. `Ok(None)` is a clean end of stream.
pub(crate) async fn next_frame<S, T, E>(
    timeout: Option<Duration>,
    stream: &mut S,
) -> Result<Option<T>, ConnError>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    ConnError: From<E>,
{
    let next = stream.next();
    match timeout {
        None => next.await.transpose().map_err(ConnError::from),
        Some(limit) => match tokio::time::timeout(limit, next).await {
            Ok(item) => item.transpose().map_err(ConnError::from),
            Err(_elapsed) => Err(ConnError::timed_out("read timed out")),
        },
    }
}

/// Runs a write-side future (feed or flush), honoring an optional write
/// timeout.
pub(crate) async fn write_op<F, E>(timeout: Option<Duration>, op: F) -> Result<(), ConnError>
where
    F: std::future::Future<Output = Result<(), E>>,
    ConnError: From<E>,
{
    match timeout {
        None => op.await.map_err(ConnError::from),
        Some(limit) => match tokio::time::timeout(limit, op).await {
            Ok(result) => result.map_err(ConnError::from),
            Err(_elapsed) => Err(ConnError::timed_out("write timed out")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleport_h1::Body;

    fn request(host: &str, body: &'static str) -> Request {
        http::Request::builder()
            .uri(format!("http://{host}/aaa"))
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn request_frame_roundtrip() {
        let mut wire = BytesMut::new();
        let mut encoder = RequestFrameEncoder::<H1>::new();
        encoder.encode((7, request("foobar.com", "hello")), &mut wire).unwrap();
        encoder.encode((8, request("foobar8.com", "")), &mut wire).unwrap();

        let mut decoder = RequestFrameDecoder::<H1>::new();
        let (id, decoded) = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded.body().as_bytes().unwrap().as_ref(), b"hello");

        let (id, decoded) = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(id, 8);
        assert_eq!(decoded.headers().get(http::header::HOST).unwrap(), "foobar8.com");
        assert!(wire.is_empty());
    }

    #[test]
    fn response_frame_decodes_byte_by_byte() {
        let response = http::Response::builder().body(Body::from("payload")).unwrap();
        let mut wire = BytesMut::new();
        ResponseFrameEncoder::<H1>::new().encode((42, response), &mut wire).unwrap();

        let mut decoder = ResponseFrameDecoder::<H1>::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for i in 0..wire.len() {
            buf.extend_from_slice(&wire[i..=i]);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                decoded = Some(frame);
            }
        }

        let (id, response) = decoded.expect("frame should decode after the last byte");
        assert_eq!(id, 42);
        assert_eq!(response.body().as_bytes().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn eof_on_id_boundary_is_clean() {
        let mut decoder = ResponseFrameDecoder::<H1>::new();
        let mut empty = BytesMut::new();
        assert!(decoder.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn eof_mid_message_is_an_error() {
        let response = http::Response::builder().body(Body::from("payload")).unwrap();
        let mut wire = BytesMut::new();
        ResponseFrameEncoder::<H1>::new().encode((1, response), &mut wire).unwrap();
        wire.truncate(wire.len() - 1);

        let mut decoder = ResponseFrameDecoder::<H1>::new();
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        assert_eq!(decoder.in_flight(), Some(1));
        let err = decoder.decode_eof(&mut wire).unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }

    #[test]
    fn eof_with_partial_id_is_an_error() {
        let mut decoder = ResponseFrameDecoder::<H1>::new();
        let mut buf = BytesMut::from(&[0x01, 0x02][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.decode_eof(&mut buf).is_err());
    }
}
