use std::fmt;
use std::io;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;

/// The body of a request or response.
///
/// Bodies are normally fully buffered: the codecs read the whole payload
/// before handing the message out, and write it in one piece. The
/// [`Stream`](Body::Stream) variant exists so callers *can* hand over a
/// streaming body, which the engine then refuses up front instead of
/// stalling the wire.
pub enum Body {
    /// A complete, in-memory payload.
    Full(Bytes),
    /// A streaming payload. Never written to the wire; the engine rejects
    /// messages carrying one.
    Stream(BoxBody<Bytes, io::Error>),
}

impl Body {
    /// Creates an empty body.
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    /// Wraps a streaming body.
    pub fn stream<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes, Error = io::Error> + Send + Sync + 'static,
    {
        Body::Stream(BoxBody::new(body))
    }

    /// Returns true if this body is a stream.
    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Returns the buffered payload, or `None` for a stream.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    /// Returns the buffered payload length. A stream reports zero; callers
    /// must check [`is_stream`](Body::is_stream) before trusting this.
    pub fn len(&self) -> usize {
        match self {
            Body::Full(bytes) => bytes.len(),
            Body::Stream(_) => 0,
        }
    }

    /// Returns true if the buffered payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Full(Bytes::from(s))
    }
}
