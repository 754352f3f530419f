//! In-process stub of the Backend Protocol server used by the integration
//! tests.
//!
//! Each test binds its own listener on `127.0.0.1:0` and scripts the server
//! side of the conversation with the helpers below.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use kosmonaut::protocol::{encode, read_packet};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Test timeout to prevent hanging tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Vhost secret used in every endpoint URL.
pub const SECRET: &str = "secret";

/// Server side of one accepted connection.
pub struct Peer {
    reader: BufReader<TcpStream>,
}

impl Peer {
    /// Read one packet, or `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Vec<String>> {
        read_packet(&mut self.reader).await.ok()
    }

    /// Write one packet without identity.
    pub async fn send<S: AsRef<str>>(&mut self, fields: &[S]) {
        let packet = encode(fields, None);
        // The client may already be gone; tests assert on what they receive
        let _ = self.reader.get_mut().write_all(&packet).await;
    }

    /// Read packets until the client hangs up, returning all of them.
    pub async fn drain(&mut self) -> Vec<Vec<String>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.recv().await {
            packets.push(packet);
        }
        packets
    }
}

/// Bind a listener and return it with the endpoint URL pointing at it.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub server");
    let url = url_for(listener.local_addr().unwrap());
    (listener, url)
}

pub fn url_for(addr: SocketAddr) -> String {
    format!("wr://{}@{}/test", SECRET, addr)
}

/// Accept the next connection.
pub async fn accept(listener: &TcpListener) -> Peer {
    let (stream, _) = tokio::time::timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("Timed out waiting for a connection")
        .expect("Accept failed");
    Peer {
        reader: BufReader::new(stream),
    }
}

/// Split a packet sent with identity into `(identity, payload)`.
pub fn split_identity(packet: &[String]) -> (&str, &[String]) {
    assert!(packet.len() >= 3, "Packet too short for identity: {:?}", packet);
    assert_eq!(packet[1], "", "Missing identity separator in {:?}", packet);
    (packet[0].as_str(), &packet[2..])
}

/// A well-formed single access token.
pub fn token() -> String {
    "x".repeat(128)
}
