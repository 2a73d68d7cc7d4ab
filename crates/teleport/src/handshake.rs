//! Connection handshake: protocol sniffing, version and compression
//! agreement, and TLS engagement.
//!
//! Each side writes a fixed preamble and reads the peer's, in an order
//! that can't deadlock: the client writes first, the server reads first.
//! The preamble is the sniff tag, one version byte, one compression byte
//! (the compression *this side* will write) and one TLS-intent byte. When
//! both sides want TLS, the TLS handshake runs on the raw socket right
//! after the preamble exchange and all framing then flows over it.
//!
//! The whole exchange is guarded by a fixed 3-second deadline in both
//! directions; once it succeeds the deadline is gone and framing begins.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::compress::Compression;
use crate::config::ClientTls;
use crate::error::HandshakeError;
use crate::transport::Connection;

/// The protocol sniff tag opening every connection.
pub const SNIFF_HEADER: [u8; 12] = *b"httpteleport";

/// The protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 0;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs the client side of the handshake.
///
/// Returns the compression the *server* will use for its responses, and
/// the connection to keep using (TLS-wrapped when negotiated).
pub async fn client(
    conn: Connection,
    compress: Compression,
    tls: Option<&ClientTls>,
) -> Result<(Compression, Connection), HandshakeError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, client_exchange(conn, compress, tls)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(HandshakeError::Timeout),
    }
}

/// Runs the server side of the handshake.
///
/// Returns the compression the *client* will use for its requests, and
/// the connection to keep using (TLS-wrapped when negotiated).
pub async fn server(
    conn: Connection,
    compress: Compression,
    tls: Option<&Arc<rustls::ServerConfig>>,
) -> Result<(Compression, Connection), HandshakeError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, server_exchange(conn, compress, tls)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(HandshakeError::Timeout),
    }
}

async fn client_exchange(
    mut conn: Connection,
    compress: Compression,
    tls: Option<&ClientTls>,
) -> Result<(Compression, Connection), HandshakeError> {
    write_header(&mut conn, compress, tls.is_some()).await?;
    let (read_compress, peer_tls) = read_header(&mut conn).await?;

    if let Some(tls) = tls {
        if !peer_tls {
            return Err(HandshakeError::TlsUnsupported(
                "server doesn't support encrypted connections; configure TLS on the server",
            ));
        }
        let server_name = ServerName::try_from(tls.server_name.as_str())
            .map_err(|_| HandshakeError::Tls {
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid tls server name {:?}", tls.server_name),
                ),
            })?
            .to_owned();
        let connector = TlsConnector::from(tls.config.clone());
        let stream = connector
            .connect(server_name, conn)
            .await
            .map_err(|source| HandshakeError::Tls { source })?;
        conn = Box::new(stream);
        debug!("client tls established");
    }

    Ok((read_compress, conn))
}

async fn server_exchange(
    mut conn: Connection,
    compress: Compression,
    tls: Option<&Arc<rustls::ServerConfig>>,
) -> Result<(Compression, Connection), HandshakeError> {
    let (read_compress, peer_tls) = read_header(&mut conn).await?;

    if peer_tls && tls.is_none() {
        // answer with our own plaintext header before bailing so the peer
        // observes a clean mismatch instead of a hang
        let _ = write_header(&mut conn, compress, false).await;
        return Err(HandshakeError::TlsUnsupported(
            "cannot serve an encrypted client connection; configure TLS on the server",
        ));
    }

    write_header(&mut conn, compress, peer_tls).await?;

    if peer_tls {
        if let Some(config) = tls {
            let acceptor = TlsAcceptor::from(config.clone());
            let stream = acceptor
                .accept(conn)
                .await
                .map_err(|source| HandshakeError::Tls { source })?;
            conn = Box::new(stream);
            debug!("server tls established");
        }
    }

    Ok((read_compress, conn))
}

async fn write_header(
    conn: &mut Connection,
    compress: Compression,
    is_tls: bool,
) -> Result<(), HandshakeError> {
    conn.write_all(&SNIFF_HEADER).await?;
    conn.write_all(&[PROTOCOL_VERSION, compress.to_wire(), u8::from(is_tls)]).await?;
    conn.flush().await?;
    Ok(())
}

async fn read_header(conn: &mut Connection) -> Result<(Compression, bool), HandshakeError> {
    let mut sniff = [0u8; SNIFF_HEADER.len()];
    conn.read_exact(&mut sniff).await?;
    if sniff != SNIFF_HEADER {
        return Err(HandshakeError::BadSniff { got: sniff });
    }

    let mut header = [0u8; 3];
    conn.read_exact(&mut header).await?;
    if header[0] != PROTOCOL_VERSION {
        return Err(HandshakeError::BadVersion(header[0]));
    }
    let compress =
        Compression::from_wire(header[1]).ok_or(HandshakeError::BadCompression(header[1]))?;
    let is_tls = header[2] != 0;

    Ok((compress, is_tls))
}
