//! A single TCP session with the backend endpoint.
//!
//! `Connection` owns the socket, the identity generated for it and the
//! deadline applied to every blocking operation. It never retries: every
//! socket failure (refused, reset, broken pipe, timeout) is returned to the
//! owner as `Error::Connection`, and the owner decides what to do.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::framing::{encode, read_packet};
use crate::protocol::identity::{self, Role};

/// An open connection to the backend endpoint.
pub struct Connection {
    /// Buffered reader for incoming packets.
    reader: BufReader<OwnedReadHalf>,
    /// Writer for outgoing packets.
    writer: OwnedWriteHalf,
    /// Identity generated for this physical connection.
    identity: String,
    /// Deadline for connect, write and default reads.
    deadline: Duration,
    closed: bool,
}

impl Connection {
    /// Connect to `addr` and generate a fresh identity for `role`.
    ///
    /// The connect itself is bounded by `deadline`, which then becomes the
    /// default bound for every write and read on this connection. Nagle's
    /// algorithm is disabled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the connection is refused, the
    /// deadline elapses, or the socket cannot be configured.
    pub async fn open(
        addr: SocketAddr,
        role: Role,
        endpoint: &Endpoint,
        deadline: Duration,
    ) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timed_out("connect"))??;
        stream.set_nodelay(true)?;

        let identity = identity::generate(role, endpoint);
        debug!(%addr, %identity, "Connected");

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            identity,
            deadline,
            closed: false,
        })
    }

    /// Identity of this connection.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encode `fields` and write them as one packet.
    ///
    /// With `with_identity` the connection identity and an empty separator
    /// are prepended.
    pub async fn send<S: AsRef<str>>(&mut self, fields: &[S], with_identity: bool) -> Result<()> {
        let identity = with_identity.then_some(self.identity.as_str());
        let packet = encode(fields, identity);
        self.write(&packet).await
    }

    /// Write raw bytes, bounded by the connection deadline.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Connection already closed",
            )));
        }

        let writer = &mut self.writer;
        timeout(self.deadline, async move {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| Error::timed_out("write"))??;

        Ok(())
    }

    /// Read one packet, bounded by the connection deadline.
    pub async fn read_packet(&mut self) -> Result<Vec<String>> {
        self.read_packet_within(self.deadline).await
    }

    /// Read one packet, bounded by `deadline` instead of the default.
    pub async fn read_packet_within(&mut self, deadline: Duration) -> Result<Vec<String>> {
        if self.closed {
            return Err(Error::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Connection already closed",
            )));
        }

        timeout(deadline, read_packet(&mut self.reader))
            .await
            .map_err(|_| Error::timed_out("read"))?
    }

    /// Shut the connection down.
    ///
    /// Closing twice, or closing a socket the peer already dropped, is not
    /// an error.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.writer.shutdown().await {
            debug!(identity = %self.identity, "Ignoring error on close: {}", e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("deadline", &self.deadline)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    const DEADLINE: Duration = Duration::from_secs(2);

    fn endpoint_for(addr: SocketAddr) -> Endpoint {
        Endpoint::parse(&format!("wr://secret@{}/test", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::open(addr, Role::Requester, &endpoint_for(addr), DEADLINE)
            .await
            .unwrap_err();
        assert!(err.is_connection(), "Expected connection error, got {:?}", err);
    }

    #[tokio::test]
    async fn test_send_and_read_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let fields = read_packet(&mut reader).await.unwrap();
            reader
                .get_mut()
                .write_all(&encode(&["OK"], None))
                .await
                .unwrap();
            fields
        });

        let mut conn = Connection::open(addr, Role::Requester, &endpoint_for(addr), DEADLINE)
            .await
            .unwrap();
        assert!(conn.identity().starts_with("req:/test:secret:"));

        conn.send(&["CC", "foo"], true).await.unwrap();
        let reply = conn.read_packet().await.unwrap();
        assert_eq!(reply, vec!["OK"]);

        let received = server.await.unwrap();
        assert_eq!(received, vec![conn.identity(), "", "CC", "foo"]);
    }

    #[tokio::test]
    async fn test_read_deadline_elapses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and keep the socket open without writing anything
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let mut conn = Connection::open(addr, Role::Dealer, &endpoint_for(addr), DEADLINE)
            .await
            .unwrap();
        let err = conn
            .read_packet_within(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);

        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Peer goes away first
            drop(stream);
        });

        let mut conn = Connection::open(addr, Role::Dealer, &endpoint_for(addr), DEADLINE)
            .await
            .unwrap();
        server.await.unwrap();

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());

        let err = conn.send(&["HB"], false).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_as_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            // Half a packet, then hang up
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            reader.get_mut().write_all(b"OK\n").await.unwrap();
        });

        let mut conn = Connection::open(addr, Role::Dealer, &endpoint_for(addr), DEADLINE)
            .await
            .unwrap();
        conn.send(&["RD"], true).await.unwrap();

        let err = conn.read_packet().await.unwrap_err();
        assert!(err.is_connection(), "Expected connection error, got {:?}", err);
        assert!(!err.is_timeout());

        server.await.unwrap();
    }
}
