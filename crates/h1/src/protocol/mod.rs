//! Protocol-level types shared by the codecs: message bodies and errors.

mod body;
mod error;

pub use body::Body;
pub use error::{ParseError, SendError};
