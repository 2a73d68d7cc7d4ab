//! Codecs turning byte streams into whole HTTP/1.1 messages and back.
//!
//! Each decoder consumes exactly one complete message (head plus
//! length-delimited body) per successful `decode`, leaving the buffer
//! positioned at the next message. Each encoder emits one self-delimited
//! message with an explicit `Content-Length`.

mod head;
mod request;
mod response;

pub use request::{RequestDecoder, RequestEncoder};
pub use response::{ResponseDecoder, ResponseEncoder};
