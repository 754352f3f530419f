//! Backend Protocol wire layer.
//!
//! The protocol is text based and newline delimited. A packet is an ordered
//! list of fields terminated by a blank-line pair:
//!
//! ```text
//! [identity \n]          present on worker RD frames and client requests
//! [(empty)  \n]
//! command   \n
//! [payload  \n]*
//! \r\n\r\n
//! ```
//!
//! This module only knows how to move field lists on and off the wire
//! ([`framing`]), how sessions are named ([`identity`]) and which commands
//! exist ([`command`]). What the commands mean is decided by
//! [`crate::client`] and [`crate::worker`].

pub mod command;
pub mod framing;
pub mod identity;

pub use command::Command;
pub use framing::{encode, read_packet, MAX_PACKET_SIZE, TERMINATOR};
pub use identity::Role;
