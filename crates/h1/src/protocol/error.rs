//! Error types for HTTP message decoding and encoding.
//!
//! [`ParseError`] covers everything that can go wrong while reading a
//! message from the wire; [`SendError`] covers writing one. Both keep
//! their `io::Error` sources so transport failures stay distinguishable
//! from malformed input.

use std::io;
use thiserror::Error;

/// Errors that occur while parsing an HTTP message.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Header section exceeds the maximum allowed size
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    /// Number of headers exceeds the maximum allowed
    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Invalid header format or content
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Unsupported HTTP version
    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    /// Invalid or unsupported HTTP method
    #[error("invalid http method")]
    InvalidMethod,

    /// Invalid URI format
    #[error("invalid http uri")]
    InvalidUri,

    /// Invalid response status code
    #[error("invalid http status code: {0:?}")]
    InvalidStatus(Option<u16>),

    /// Invalid Content-Length header
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// Transfer codings are not supported; bodies must be length-delimited
    #[error("unsupported transfer-encoding: {value}")]
    UnsupportedTransferEncoding { value: String },

    /// Invalid message body
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// I/O error during parsing
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    /// Creates a new TooLargeHeader error
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    /// Creates a new TooManyHeaders error
    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    /// Creates a new InvalidHeader error
    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    /// Creates a new InvalidContentLength error
    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    /// Creates a new UnsupportedTransferEncoding error
    pub fn unsupported_transfer_encoding<S: ToString>(value: S) -> Self {
        Self::UnsupportedTransferEncoding { value: value.to_string() }
    }

    /// Creates a new InvalidBody error
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    /// Creates a new I/O error
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Errors that occur while writing an HTTP message.
#[derive(Error, Debug)]
pub enum SendError {
    /// Invalid message body
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// Unsupported HTTP version; only HTTP/1.1 is written
    #[error("unsupported http version: {version:?}")]
    UnsupportedVersion { version: http::Version },

    /// I/O error during sending
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    /// Creates a new InvalidBody error
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    /// Creates a new UnsupportedVersion error
    pub fn unsupported_version(version: http::Version) -> Self {
        Self::UnsupportedVersion { version }
    }

    /// Creates a new I/O error
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
