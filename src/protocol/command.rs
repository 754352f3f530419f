//! Command vocabulary of the Backend Protocol.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// First field of every packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `OC` - open a channel (client request).
    OpenChannel,
    /// `CC` - close a channel (client request).
    CloseChannel,
    /// `BC` - broadcast an event (client request).
    Broadcast,
    /// `AT` - single access token request, and its reply.
    AccessToken,
    /// `RD` - worker is ready to receive events.
    Ready,
    /// `HB` - heartbeat, both directions.
    Heartbeat,
    /// `QT` - quit; from the server it asks the worker to reconnect.
    Quit,
    /// `TR` - event transfer to a worker.
    Transfer,
    /// `ER` - error reply.
    Error,
    /// `OK` - success reply.
    Ok,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::OpenChannel => "OC",
            Command::CloseChannel => "CC",
            Command::Broadcast => "BC",
            Command::AccessToken => "AT",
            Command::Ready => "RD",
            Command::Heartbeat => "HB",
            Command::Quit => "QT",
            Command::Transfer => "TR",
            Command::Error => "ER",
            Command::Ok => "OK",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a packet starts with something outside the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OC" => Ok(Command::OpenChannel),
            "CC" => Ok(Command::CloseChannel),
            "BC" => Ok(Command::Broadcast),
            "AT" => Ok(Command::AccessToken),
            "RD" => Ok(Command::Ready),
            "HB" => Ok(Command::Heartbeat),
            "QT" => Ok(Command::Quit),
            "TR" => Ok(Command::Transfer),
            "ER" => Ok(Command::Error),
            "OK" => Ok(Command::Ok),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}
