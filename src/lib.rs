//! Kosmonaut - Backend Protocol client library
//!
//! This library talks to a message-broadcasting server over the line-framed
//! Backend Protocol:
//!
//! - `client` - synchronous request/response operations (open/close channels,
//!   broadcast events, mint access tokens)
//! - `worker` - a long-lived, heartbeating, reconnecting event receiver
//! - `application` - a worker handler that routes `backend/method` events
//! - `protocol` - packet framing, session identities and commands
//!
//! # Usage
//!
//! ```ignore
//! use kosmonaut::{ChannelType, Client};
//! use serde_json::json;
//!
//! let client = Client::new("wr://token@127.0.0.1:8081/vhost")?;
//! client.open_channel("room", ChannelType::Public).await?;
//! client.broadcast("room", "message", &json!({"content": "Hello World!"})).await?;
//! ```

pub mod application;
pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod worker;

pub use application::{Application, Backend, RouteError};
pub use client::{ChannelType, Client, Reply};
pub use config::{ClientConfig, WorkerConfig};
pub use endpoint::Endpoint;
pub use error::{Error, Result, ServerError};
pub use message::Message;
pub use worker::{Handler, Worker};

/// Re-exported so handler implementations do not need their own dependency.
pub use async_trait::async_trait;
