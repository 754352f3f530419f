//! Inbound event wrapper used by [`crate::application::Application`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::client::Client;
use crate::error::{Error, Result};

/// An event delivered to a worker, optionally bound to a [`Client`] so the
/// handler can broadcast replies.
///
/// # Example
///
/// ```ignore
/// async fn save_to_history(&self, msg: &Message) -> anyhow::Result<()> {
///     let room = msg.get("room").and_then(|r| r.as_str()).unwrap_or("lobby");
///     msg.broadcast_copy(&format!("presence-{}", room)).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    event: String,
    data: Value,
    client: Option<Arc<Client>>,
}

impl Message {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            client: None,
        }
    }

    /// Attach the client used by the reply helpers.
    pub fn with_client(mut self, client: Arc<Client>) -> Self {
        self.client = Some(client);
        self
    }

    /// Full event name, e.g. `chat/save_to_history`.
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// Field of an object payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Broadcast a reply event on `channel`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` when no client is attached, otherwise any
    /// error from [`Client::broadcast`].
    pub async fn broadcast_reply<T>(&self, channel: &str, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Protocol("No client attached to message".to_string()))?;
        client.broadcast(channel, event, data).await
    }

    /// Broadcast this message, unchanged, on `channel`.
    pub async fn broadcast_copy(&self, channel: &str) -> Result<()> {
        self.broadcast_reply(channel, &self.event, &self.data).await
    }
}
