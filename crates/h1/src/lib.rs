//! HTTP/1.1 message types and codecs.
//!
//! This crate provides the message model and the wire codecs used by the
//! `teleport` engine: requests and responses are `http` crate messages
//! carrying a [`Body`], and the codecs read/write exactly one complete,
//! self-delimited message at a time.
//!
//! Messages are whole: a body is either fully buffered bytes or a stream,
//! and the codecs refuse to write streams. Chunked transfer coding is
//! refused on read for the same reason. A message without a
//! `Content-Length` header has an empty body, so the decoders never need
//! connection-close delimiting.

pub mod codec;
pub mod protocol;

pub use protocol::{Body, ParseError, SendError};

/// An HTTP request with a fully-buffered (or refused streaming) body.
pub type Request = http::Request<Body>;

/// An HTTP response with a fully-buffered (or refused streaming) body.
pub type Response = http::Response<Body>;

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}
