//! Packet framing for the Backend Protocol.
//!
//! Packets are newline-joined text fields followed by a terminator made of
//! two blank `\r\n` lines.
//!
//! # Wire Format
//!
//! ```text
//! identity\n
//! \n
//! command\n
//! payload\n
//! \r\n
//! \r\n
//! ```
//!
//! Fields must not contain `\n`. The codec knows nothing about commands.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// Packet terminator appended after the last field.
pub const TERMINATOR: &str = "\n\r\n\r\n";

/// Maximum packet size (16MB) to prevent OOM from a misbehaving server.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Encode fields into a single packet.
///
/// When `identity` is given, the identity and an empty separator field are
/// prepended, as required on client requests and worker ready frames.
///
/// # Example
///
/// ```
/// use kosmonaut::protocol::encode;
///
/// assert_eq!(encode(&["HB"], None), b"HB\n\r\n\r\n".to_vec());
/// assert_eq!(encode(&["RD"], Some("dlr:/v:s:1")), b"dlr:/v:s:1\n\nRD\n\r\n\r\n".to_vec());
/// ```
pub fn encode<S: AsRef<str>>(fields: &[S], identity: Option<&str>) -> Vec<u8> {
    let mut parts: Vec<&str> = Vec::with_capacity(fields.len() + 2);
    if let Some(identity) = identity {
        parts.push(identity);
        parts.push("");
    }
    parts.extend(fields.iter().map(|f| f.as_ref()));

    let mut packet = parts.join("\n");
    packet.push_str(TERMINATOR);
    packet.into_bytes()
}

/// Read one packet from the stream.
///
/// # Protocol
///
/// 1. Read line by line
/// 2. A line equal to `\r\n` marks a possible end of message; a second one
///    right after it ends the packet
/// 3. Every other line is a field, with trailing whitespace removed
///
/// A lone blank line followed by more data is therefore not an end of
/// message, which tolerates an empty field just before the terminator.
///
/// # Errors
///
/// Returns an error if:
/// - The stream ends before the terminator (`Error::Connection`)
/// - The packet exceeds `MAX_PACKET_SIZE` (`Error::Protocol`)
/// - A line is not valid UTF-8 (`Error::Protocol`)
pub async fn read_packet<R>(reader: &mut R) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut fields = Vec::new();
    let mut possible_eom = false;
    let mut total = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        // Never buffer more than the remaining budget plus one byte
        let budget = (MAX_PACKET_SIZE - total + 1) as u64;
        let bytes_read = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut line)
            .await?;

        // EOF - connection closed mid-packet or before one started
        if bytes_read == 0 {
            return Err(Error::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Connection closed by server",
            )));
        }

        total += bytes_read;
        if total > MAX_PACKET_SIZE {
            return Err(Error::Protocol(format!(
                "Packet size exceeds maximum {} bytes",
                MAX_PACKET_SIZE
            )));
        }

        if line == b"\r\n" {
            if possible_eom {
                break;
            }
            possible_eom = true;
            continue;
        }

        possible_eom = false;
        let text = std::str::from_utf8(&line)
            .map_err(|e| Error::Protocol(format!("Packet is not valid UTF-8: {}", e)))?;
        fields.push(text.trim_end().to_string());
    }

    Ok(fields)
}
