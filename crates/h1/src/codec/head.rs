//! Message-head parsing shared by the request and response decoders.
//!
//! Heads are parsed with `httparse` and materialized into `http` crate
//! types. The body length is derived here as well: a `Content-Length`
//! header bounds the payload, no header means an empty payload, and any
//! `Transfer-Encoding` is refused so that every message stays
//! self-delimited.

use bytes::{Buf, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use httparse::Status;
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

const MAX_HEADER_NUM: usize = 64;
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Parses a request head, returning the head and its body length.
///
/// Returns `Ok(None)` when more input is needed; on success the consumed
/// bytes are removed from `src`.
pub(crate) fn decode_request_head(
    src: &mut BytesMut,
) -> Result<Option<(http::Request<()>, u64)>, ParseError> {
    let (head, amt) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Request::new(&mut headers);

        match parse_status(parsed.parse(src))? {
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
            Status::Complete(amt) => {
                ensure!(amt <= MAX_HEADER_BYTES, ParseError::too_large_header(amt, MAX_HEADER_BYTES));

                let mut builder = http::Request::builder()
                    .method(parsed.method.ok_or(ParseError::InvalidMethod)?)
                    .uri(parsed.path.ok_or(ParseError::InvalidUri)?)
                    .version(parse_version(parsed.version)?);

                // builder.headers_mut() is only None after a builder error,
                // which surfaces below through builder.body()
                if let Some(header_map) = builder.headers_mut() {
                    collect_headers(parsed.headers, header_map)?;
                }

                let head = builder
                    .body(())
                    .map_err(|e| invalid_head(parsed.method, parsed.path, e))?;
                (head, amt)
            }
        }
    };

    src.advance(amt);
    let body_len = body_length(head.headers())?;
    trace!(head_size = amt, body_len, "parsed request head");
    Ok(Some((head, body_len)))
}

/// Parses a response head, returning the head and its body length.
pub(crate) fn decode_response_head(
    src: &mut BytesMut,
) -> Result<Option<(http::Response<()>, u64)>, ParseError> {
    let (head, amt) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Response::new(&mut headers);

        match parse_status(parsed.parse(src))? {
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
            Status::Complete(amt) => {
                ensure!(amt <= MAX_HEADER_BYTES, ParseError::too_large_header(amt, MAX_HEADER_BYTES));

                let code = parsed.code.ok_or(ParseError::InvalidStatus(None))?;
                let status = http::StatusCode::from_u16(code)
                    .map_err(|_| ParseError::InvalidStatus(Some(code)))?;

                let mut builder = http::Response::builder()
                    .status(status)
                    .version(parse_version(parsed.version)?);

                if let Some(header_map) = builder.headers_mut() {
                    collect_headers(parsed.headers, header_map)?;
                }

                let head = builder
                    .body(())
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                (head, amt)
            }
        }
    };

    src.advance(amt);
    let body_len = body_length(head.headers())?;
    Ok(Some((head, body_len)))
}

fn parse_status<T>(result: Result<Status<T>, httparse::Error>) -> Result<Status<T>, ParseError> {
    result.map_err(|e| match e {
        httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        e => ParseError::invalid_header(e.to_string()),
    })
}

fn parse_version(version: Option<u8>) -> Result<http::Version, ParseError> {
    match version {
        Some(0) => Ok(http::Version::HTTP_10),
        Some(1) => Ok(http::Version::HTTP_11),
        v => Err(ParseError::InvalidVersion(v)),
    }
}

fn collect_headers(
    parsed: &[httparse::Header<'_>],
    header_map: &mut HeaderMap,
) -> Result<(), ParseError> {
    header_map.reserve(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ParseError::invalid_header(header.name))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ParseError::invalid_header(header.name))?;
        header_map.append(name, value);
    }
    Ok(())
}

/// Picks the most specific error for a head the `http` builder refused.
fn invalid_head(method: Option<&str>, path: Option<&str>, e: http::Error) -> ParseError {
    if let Some(method) = method {
        if http::Method::from_bytes(method.as_bytes()).is_err() {
            return ParseError::InvalidMethod;
        }
    }
    if let Some(path) = path {
        if path.parse::<http::Uri>().is_err() {
            return ParseError::InvalidUri;
        }
    }
    ParseError::invalid_header(e.to_string())
}

/// Derives the body length from the headers.
///
/// See [RFC 7230 section 3.3](https://www.rfc-editor.org/rfc/rfc7230#section-3.3):
/// `Transfer-Encoding` is refused outright, `Content-Length` bounds the
/// payload, and neither means an empty payload.
fn body_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    if let Some(te_value) = headers.get(header::TRANSFER_ENCODING) {
        let value = te_value.to_str().unwrap_or("<non-ascii>");
        return Err(ParseError::unsupported_transfer_encoding(value));
    }

    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(0),
        Some(cl_value) => {
            let cl_str =
                cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use indoc::indoc;

    fn crlf(text: &str) -> BytesMut {
        BytesMut::from(text.replace('\n', "\r\n").as_str())
    }

    #[test]
    fn request_head_with_content_length() {
        let mut buf = crlf(indoc! {"
            POST /aaa HTTP/1.1
            Host: foobar.com
            Content-Length: 11

            hello world"});

        let (head, body_len) = decode_request_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.method(), Method::POST);
        assert_eq!(head.uri().path(), "/aaa");
        assert_eq!(head.version(), http::Version::HTTP_11);
        assert_eq!(head.headers().get(header::HOST).unwrap(), "foobar.com");
        assert_eq!(body_len, 11);
        assert_eq!(&buf[..], b"hello world");
    }

    #[test]
    fn request_head_partial() {
        let mut buf = BytesMut::from("GET /aaa HTTP/1.1\r\nHost: foo");
        assert!(decode_request_head(&mut buf).unwrap().is_none());
        // nothing consumed while partial
        assert!(buf.starts_with(b"GET /aaa"));
    }

    #[test]
    fn response_head_basic() {
        let mut buf = crlf(indoc! {"
            HTTP/1.1 429 Too Many Requests
            Content-Length: 4

            nope"});

        let (head, body_len) = decode_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_len, 4);
    }

    #[test]
    fn chunked_is_refused() {
        let mut buf = crlf(indoc! {"
            POST /aaa HTTP/1.1
            Transfer-Encoding: chunked

            "});

        let err = decode_request_head(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedTransferEncoding { .. }));
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let mut buf = crlf(indoc! {"
            GET / HTTP/1.1
            Host: a.b

            "});

        let (_, body_len) = decode_request_head(&mut buf).unwrap().unwrap();
        assert_eq!(body_len, 0);
    }

    #[test]
    fn bad_content_length() {
        let mut buf = crlf(indoc! {"
            POST / HTTP/1.1
            Content-Length: banana

            "});

        let err = decode_request_head(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength { .. }));
    }
}
