//! Teleports whole HTTP requests and responses between two peers over a
//! single persistent, optionally-compressed, optionally-encrypted
//! connection.
//!
//! A [`Client`] accepts requests and returns responses; a [`Server`] feeds
//! requests to a [`Handler`] and ships the responses back. Everything is
//! multiplexed on one connection: each message is a 4-byte correlation id
//! followed by one HTTP message, responses may come back in any order, and
//! writes are batched for up to `max_batch_delay` so a high rate of small
//! exchanges shares network flushes.
//!
//! ```no_run
//! use std::time::Duration;
//! use teleport::{make_handler, Body, ClientConfig, ServerConfig};
//! use teleport::{Client, Request, Response, Server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = make_handler(|_req: Request| async move {
//!     Ok::<_, std::convert::Infallible>(Response::new(Body::from("hello")))
//! });
//! let server = Server::new(ServerConfig::default(), handler);
//! tokio::spawn(async move { server.listen_and_serve("127.0.0.1:8043").await });
//!
//! let client = Client::new(ClientConfig::new("127.0.0.1:8043"));
//! let req = http::Request::builder().uri("http://foobar.com/aaa").body(Body::empty())?;
//! let resp = client.do_timeout(req, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The HTTP wire format itself comes from an injected [`MessageCodec`];
//! the [`teleport_h1`] codec is the default.

pub mod client;
pub mod compress;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod server;
pub mod transport;

pub use client::Client;
pub use compress::Compression;
pub use config::{ClientConfig, ClientTls, ServerConfig};
pub use error::{ConnError, Error, HandshakeError};
pub use frame::{MessageCodec, H1};
pub use server::{make_handler, Handler, HandlerFn, Server};
pub use transport::{dial_fn, Connection, DialFn, InmemoryAddr, InmemoryListener, Listener};

pub use teleport_h1::{Body, Request, Response};
