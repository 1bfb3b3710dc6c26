//! # QUIC Transport
//!
//! One QUIC endpoint per node serves both directions: it accepts inbound
//! connections and dials peers found by discovery. Each established connection
//! carries exactly one long-lived bidirectional stream, framed as
//!
//! ```text
//! [ len: u32 big-endian | body: len bytes ]
//! ```
//!
//! Transport failures are reported as [`TransportError`]; callers retry with
//! backoff and never treat them as fatal.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{Connection, Endpoint};
use tracing::info;

use crate::crypto::{
    create_client_config, create_server_config, generate_transport_cert, TransportKey,
    TLS_SERVER_NAME,
};

/// Upper bound on dial + TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Connect(String),
    Timeout,
    /// The peer finished the stream or the connection went away.
    Closed,
    FrameTooLarge { size: usize, max: usize },
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect failed: {e}"),
            TransportError::Timeout => write!(f, "transport operation timed out"),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {size} bytes (max {max})")
            }
            TransportError::Io(e) => write!(f, "transport I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<quinn::ReadExactError> for TransportError {
    fn from(e: quinn::ReadExactError) -> Self {
        match e {
            quinn::ReadExactError::FinishedEarly(_) => TransportError::Closed,
            quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(_)) => {
                TransportError::Closed
            }
            quinn::ReadExactError::ReadError(e) => TransportError::Io(e.to_string()),
        }
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(e: quinn::WriteError) -> Self {
        match e {
            quinn::WriteError::ConnectionLost(_) | quinn::WriteError::ClosedStream => {
                TransportError::Closed
            }
            e => TransportError::Io(e.to_string()),
        }
    }
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(e: quinn::ConnectionError) -> Self {
        TransportError::Connect(e.to_string())
    }
}

/// Bind a QUIC endpoint that both accepts and dials with `key`'s certificate.
pub fn bind_endpoint(addr: SocketAddr, key: &TransportKey) -> Result<Endpoint> {
    let (certs, private_key) = generate_transport_cert(key)?;
    let server_config = create_server_config(certs.clone(), private_key.clone_key())?;
    let client_config = create_client_config(certs, private_key)?;

    let mut endpoint = Endpoint::server(server_config, addr)
        .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;
    endpoint.set_default_client_config(client_config);

    info!(addr = %endpoint.local_addr()?, "QUIC endpoint bound");
    Ok(endpoint)
}

pub async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Connection, TransportError> {
    let connecting = endpoint
        .connect(addr, TLS_SERVER_NAME)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    match tokio::time::timeout(CONNECT_TIMEOUT, connecting).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout),
    }
}

pub async fn write_frame(send: &mut quinn::SendStream, body: &[u8]) -> Result<(), TransportError> {
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(body).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer finished the stream cleanly.
pub async fn read_frame(
    recv: &mut quinn::RecvStream,
    max: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len];
    recv.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn frames_cross_a_connection() {
        let server = bind_endpoint(loopback(), &TransportKey::generate()).unwrap();
        let client = bind_endpoint(loopback(), &TransportKey::generate()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let connection = server.accept().await.unwrap().await.unwrap();
            let (mut send, mut recv) = connection.accept_bi().await.unwrap();
            let first = read_frame(&mut recv, 1024).await.unwrap().unwrap();
            write_frame(&mut send, &first).await.unwrap();
            let oversized = read_frame(&mut recv, 1024).await;
            (first, oversized)
        });

        let connection = connect(&client, server_addr).await.unwrap();
        let (mut send, mut recv) = connection.open_bi().await.unwrap();
        write_frame(&mut send, b"hello frame").await.unwrap();
        let echoed = read_frame(&mut recv, 1024).await.unwrap().unwrap();
        assert_eq!(echoed, b"hello frame");

        write_frame(&mut send, &[0u8; 2048]).await.unwrap();
        let (first, oversized) = accept.await.unwrap();
        assert_eq!(first, b"hello frame");
        assert_eq!(
            oversized,
            Err(TransportError::FrameTooLarge { size: 2048, max: 1024 })
        );
    }

    #[tokio::test]
    async fn finished_stream_reads_as_none() {
        let server = bind_endpoint(loopback(), &TransportKey::generate()).unwrap();
        let client = bind_endpoint(loopback(), &TransportKey::generate()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let connection = server.accept().await.unwrap().await.unwrap();
            let (_send, mut recv) = connection.accept_bi().await.unwrap();
            let first = read_frame(&mut recv, 64).await.unwrap();
            let second = read_frame(&mut recv, 64).await.unwrap();
            (first, second, connection)
        });

        let connection = connect(&client, server_addr).await.unwrap();
        let (mut send, _recv) = connection.open_bi().await.unwrap();
        write_frame(&mut send, b"only").await.unwrap();
        send.finish().unwrap();

        let (first, second, _conn) = accept.await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"only"[..]));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn dial_to_dead_port_fails() {
        let client = bind_endpoint(loopback(), &TransportKey::generate()).unwrap();
        let dead = {
            let socket = std::net::UdpSocket::bind(loopback()).unwrap();
            socket.local_addr().unwrap()
        };
        assert!(connect(&client, dead).await.is_err());
    }
}
