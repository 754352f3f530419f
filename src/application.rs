//! Conventional worker that routes events to named backends.
//!
//! Event names have the form `backend/method`. The part before the slash
//! selects a mounted [`Backend`]; the part after it is passed to the backend
//! to pick the operation.
//!
//! ```ignore
//! struct ChatBackend;
//!
//! #[async_trait]
//! impl Backend for ChatBackend {
//!     async fn handle(&self, method: &str, msg: &Message) -> anyhow::Result<()> {
//!         match method {
//!             "save_to_history" => save(msg).await,
//!             other => Err(RouteError::UndefinedHandler(other.to_string()).into()),
//!         }
//!     }
//! }
//!
//! let mut app = Application::new("wr://token@127.0.0.1:8081/vhost")?;
//! app.mount("chat", ChatBackend);
//! app.run().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::client::Client;
use crate::config::{ClientConfig, WorkerConfig};
use crate::endpoint::Endpoint;
use crate::error::{Result, ServerError};
use crate::message::Message;
use crate::worker::{Handler, Worker};

/// Routing failures, reported through the worker's exception path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The event name has no `backend/method` shape.
    #[error("Invalid backend event: {0}")]
    InvalidEvent(String),

    /// No backend or method is registered for the event.
    #[error("Undefined handler: {0}")]
    UndefinedHandler(String),
}

/// A group of event handlers mounted under one name.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Handle `method` for `message`.
    ///
    /// Return `RouteError::UndefinedHandler` for methods the backend does
    /// not provide.
    async fn handle(&self, method: &str, message: &Message) -> anyhow::Result<()>;
}

/// Worker handler that dispatches `backend/method` events to mounted
/// backends and logs server errors and handler failures.
pub struct Application {
    worker: Arc<Worker>,
    client: Arc<Client>,
    backends: HashMap<String, Box<dyn Backend>>,
}

impl Application {
    /// Build an application for the endpoint URL with default settings.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, WorkerConfig::default(), ClientConfig::default())
    }

    /// Build an application with explicit worker and reply-client settings.
    pub fn with_config(
        url: &str,
        worker_config: WorkerConfig,
        client_config: ClientConfig,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        Ok(Self {
            worker: Arc::new(Worker::from_endpoint(endpoint.clone(), worker_config)),
            client: Arc::new(Client::from_endpoint(endpoint, client_config)),
            backends: HashMap::new(),
        })
    }

    /// Register `backend` under `name`. A later mount under the same name
    /// replaces the earlier one.
    pub fn mount<B>(&mut self, name: impl Into<String>, backend: B) -> &mut Self
    where
        B: Backend + 'static,
    {
        self.backends.insert(name.into(), Box::new(backend));
        self
    }

    /// The underlying worker, e.g. to call [`Worker::stop`] from elsewhere.
    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.worker)
    }

    /// Client used by [`Message`] reply helpers.
    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    /// Listen for events until the worker is stopped.
    pub async fn run(&mut self) -> Result<()> {
        let worker = Arc::clone(&self.worker);
        worker.listen(self).await
    }

    /// Route one event to its backend.
    pub async fn route(&self, event: &str, data: Value) -> anyhow::Result<()> {
        let (name, method) = split_event(event)?;
        let backend = self
            .backends
            .get(name)
            .ok_or_else(|| RouteError::UndefinedHandler(event.to_string()))?;

        let message = Message::new(event, data).with_client(Arc::clone(&self.client));
        info!("{}, {:?}", event, message.data());
        backend.handle(method, &message).await
    }
}

/// Split `backend/method` at the first slash.
fn split_event(event: &str) -> Result<(&str, &str), RouteError> {
    match event.split_once('/') {
        Some((name, method)) if !name.is_empty() && !method.is_empty() => Ok((name, method)),
        _ => Err(RouteError::InvalidEvent(event.to_string())),
    }
}

#[async_trait]
impl Handler for Application {
    async fn on_message(&mut self, event: &str, data: Value) -> anyhow::Result<()> {
        self.route(event, data).await
    }

    async fn on_error(&mut self, error: ServerError) -> anyhow::Result<()> {
        error!("{}", error);
        Ok(())
    }

    async fn on_exception(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        error!("Unhandled exception: {:#}", error);
        Ok(())
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("Application")
            .field("worker", &self.worker)
            .field("backends", &names)
            .finish_non_exhaustive()
    }
}
