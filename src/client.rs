//! Request/response client for the Backend Protocol.
//!
//! `Client` is used to synchronously request operations from the server:
//! opening and closing channels, broadcasting events and minting single
//! access tokens. Every request runs on its own short-lived connection and
//! requests issued through one `Client` never overlap on the wire.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, Instrument, Span};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Result, ServerError};
use crate::protocol::{Command, Role};

/// Length of a valid single access token.
pub const ACCESS_TOKEN_LENGTH: usize = 128;

/// Channel flavours understood by the server.
///
/// The server also infers the flavour from the `private-` and `presence-`
/// name prefixes; [`ChannelType::from_name`] follows the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelType {
    #[default]
    Public,
    Private,
    Presence,
}

impl ChannelType {
    /// Decimal value sent in `OC` requests.
    pub fn wire_value(&self) -> u8 {
        match self {
            ChannelType::Public => 0,
            ChannelType::Private => 1,
            ChannelType::Presence => 2,
        }
    }

    /// Infer the channel type from its name.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("presence-") {
            ChannelType::Presence
        } else if name.starts_with("private-") {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK`
    Ok,
    /// `AT <token>` with a well-formed token.
    Token(String),
}

/// Decode a reply packet.
///
/// - `OK` succeeds with [`Reply::Ok`]
/// - `ER <code>` fails with the mapped [`ServerError`]
/// - `AT <token>` succeeds only if the token is 128 characters long
/// - anything else fails with [`ServerError::UnknownServerError`]
pub fn parse_reply(fields: &[String]) -> Result<Reply> {
    let command = fields.first().and_then(|c| c.parse::<Command>().ok());

    match command {
        Some(Command::Ok) => return Ok(Reply::Ok),
        Some(Command::Error) => {
            let code = fields.get(1).map(String::as_str).unwrap_or_default();
            return Err(ServerError::from_field(code).into());
        }
        Some(Command::AccessToken) => {
            if let Some(token) = fields.get(1) {
                if token.chars().count() == ACCESS_TOKEN_LENGTH {
                    return Ok(Reply::Token(token.clone()));
                }
            }
        }
        _ => {}
    }

    Err(ServerError::UnknownServerError.into())
}

/// Backend Protocol request client.
///
/// A `Client` can be shared between tasks (for instance behind an `Arc`);
/// concurrent callers queue on an internal lock so only one request is in
/// flight at a time.
///
/// # Example
///
/// ```ignore
/// use kosmonaut::{ChannelType, Client};
/// use serde_json::json;
///
/// let client = Client::new("wr://token@127.0.0.1:8081/vhost")?;
/// client.open_channel("comments", ChannelType::Public).await?;
/// client.broadcast("comments", "comment_added", &json!({"id": 42})).await?;
/// let token = client.request_single_access_token(".*").await?;
/// ```
pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    /// Resolved once, on first request.
    addr: OnceCell<SocketAddr>,
    /// Serializes requests from concurrent callers.
    lock: Mutex<()>,
    span: Span,
}

impl Client {
    /// Create a client for the endpoint URL with default settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpoint` if the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self::from_endpoint(Endpoint::parse(url)?, config))
    }

    pub fn from_endpoint(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self {
            endpoint,
            config,
            addr: OnceCell::new(),
            lock: Mutex::new(()),
            span: Span::none(),
        }
    }

    /// Emit this client's log events inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Broadcast `event` with `data` attached on `channel`.
    ///
    /// `data` is JSON encoded before it goes on the wire.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ChannelNotFound` if the channel does not exist,
    /// `Error::Connection` on transport failure, or `Error::Protocol` if
    /// `data` cannot be encoded.
    pub async fn broadcast<T>(&self, channel: &str, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(data)?;
        self.perform_request(&[Command::Broadcast.as_str(), channel, event, payload.as_str()])
            .await
            .map(|_| ())
    }

    /// Open a channel. Opening an existing channel succeeds.
    pub async fn open_channel(&self, name: &str, channel_type: ChannelType) -> Result<()> {
        let kind = channel_type.wire_value().to_string();
        self.perform_request(&[Command::OpenChannel.as_str(), name, kind.as_str()])
            .await
            .map(|_| ())
    }

    /// Close a channel.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ChannelNotFound` if the channel does not exist.
    pub async fn close_channel(&self, name: &str) -> Result<()> {
        self.perform_request(&[Command::CloseChannel.as_str(), name])
            .await
            .map(|_| ())
    }

    /// Request a single access token whose permissions are given by the
    /// `permission` regexp, matched by the server against channel names.
    ///
    /// Returns the 128-character token.
    pub async fn request_single_access_token(&self, permission: &str) -> Result<String> {
        match self
            .perform_request(&[Command::AccessToken.as_str(), permission])
            .await?
        {
            Reply::Token(token) => Ok(token),
            Reply::Ok => Err(ServerError::UnknownServerError.into()),
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// This method:
    /// 1. Takes the client lock
    /// 2. Opens a fresh connection bounded by the request timeout
    /// 3. Sends `fields` prefixed with the connection identity
    /// 4. Reads exactly one reply packet and closes the connection
    /// 5. Decodes the reply with [`parse_reply`]
    ///
    /// Transport failures are returned as `Error::Connection`; nothing is
    /// retried.
    pub async fn perform_request<S: AsRef<str>>(&self, fields: &[S]) -> Result<Reply> {
        let reply = async {
            let _guard = self.lock.lock().await;
            let addr = self.resolve().await?;

            let mut conn = Connection::open(
                addr,
                Role::Requester,
                &self.endpoint,
                self.config.request_timeout(),
            )
            .await?;

            let result = Self::exchange(&mut conn, fields).await;
            conn.close().await;
            result
        }
        .instrument(self.span.clone())
        .await?;

        parse_reply(&reply)
    }

    async fn exchange<S: AsRef<str>>(conn: &mut Connection, fields: &[S]) -> Result<Vec<String>> {
        debug!(
            "Client/REQ : {:?}",
            fields.iter().map(|f| f.as_ref()).collect::<Vec<_>>()
        );
        conn.send(fields, true).await?;

        let reply = conn.read_packet().await?;
        debug!("Client/RES : {:?}", reply);
        Ok(reply)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        self.addr
            .get_or_try_init(|| self.endpoint.resolve())
            .await
            .copied()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
