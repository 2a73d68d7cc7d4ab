//! Helpers shared by the integration suites: an in-process server guard
//! and the handlers the scenarios use.

#![allow(dead_code)]

use std::convert::Infallible;
use std::time::Duration;

use teleport::{
    make_handler, Body, Client, ClientConfig, Handler, InmemoryAddr, Request, Response, Server,
    ServerConfig,
};
use tokio::task::JoinHandle;

/// Makes engine logs visible under `--nocapture` while debugging a test.
pub fn init_tracing() {
    let subscriber =
        tracing_subscriber::FmtSubscriber::builder().with_max_level(tracing::Level::DEBUG).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A server running on an in-memory address.
pub struct TestServer {
    pub addr: InmemoryAddr,
    handle: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    /// Starts `handler` behind a fresh in-memory address.
    pub fn start<H: Handler>(config: ServerConfig, handler: H) -> Self {
        let addr = InmemoryAddr::new();
        let listener = addr.bind();
        let server = Server::new(config, handler);
        let handle = tokio::spawn(async move { server.serve(listener).await });
        TestServer { addr, handle }
    }

    /// A client dialing this server, with default config.
    pub fn client(&self) -> Client {
        self.client_with(|_| {})
    }

    /// A client dialing this server, with config tweaks applied.
    pub fn client_with(&self, tweak: impl FnOnce(&mut ClientConfig)) -> Client {
        let mut config = ClientConfig::new("inmemory");
        config.dial = Some(self.addr.dial_fn());
        tweak(&mut config);
        Client::new(config)
    }

    /// Kills the server and every connection it accepted.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// A GET-shaped request for `http://{host}/aaa`.
pub fn get_request(host: &str) -> Request {
    http::Request::builder()
        .uri(format!("http://{host}/aaa"))
        .body(Body::empty())
        .expect("test request must build")
}

/// A POST-shaped request carrying `body`.
pub fn post_request(body: impl Into<Body>) -> Request {
    http::Request::builder()
        .method(http::Method::POST)
        .uri("http://foobar.com/aaa")
        .body(body.into())
        .expect("test request must build")
}

/// The response body as text.
pub fn body_text(response: &Response) -> &str {
    std::str::from_utf8(response.body().as_bytes().expect("response body should be full"))
        .expect("response body should be utf-8")
}

/// Echoes the request's Host header as the response body.
pub fn echo_host_handler() -> impl Handler {
    make_handler(|req: Request| async move {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok::<_, Infallible>(Response::new(Body::from(host)))
    })
}

/// Echoes the request body back.
pub fn echo_body_handler() -> impl Handler {
    make_handler(|req: Request| async move {
        let body = req.into_body();
        Ok::<_, Infallible>(Response::new(body))
    })
}

/// Sleeps 0-29ms, answering `slept for {duration}`.
pub fn sleep_handler() -> impl Handler {
    make_handler(|_req: Request| async move {
        let duration = Duration::from_millis(rand::random::<u64>() % 30);
        tokio::time::sleep(duration).await;
        Ok::<_, Infallible>(Response::new(Body::from(format!("slept for {duration:?}"))))
    })
}
