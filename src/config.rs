//! Timing configuration for clients and workers.
//!
//! Both structs deserialize with `#[serde(default)]`, so an embedding
//! application can keep only the values it wants to override in its own
//! config file:
//!
//! ```
//! use kosmonaut::config::WorkerConfig;
//!
//! let config: WorkerConfig = serde_json::from_str(r#"{"heartbeat_interval_ms": 2000}"#).unwrap();
//! assert_eq!(config.heartbeat_interval().as_millis(), 2000);
//! assert_eq!(config.liveness, 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default client request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default interval between worker heartbeats in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Default pause before a worker reconnects, in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

/// Default number of silent read cycles before a worker reconnects.
pub const DEFAULT_LIVENESS: u32 = 3;

/// Default slack added to the worker read deadline, in milliseconds.
pub const DEFAULT_READ_GRACE_MS: u64 = 1_000;

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for connect, write and read of a single request.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Missed read cycles tolerated before reconnecting. Clamped to at least 1.
    pub liveness: u32,
    pub read_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            liveness: DEFAULT_LIVENESS,
            read_grace_ms: DEFAULT_READ_GRACE_MS,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn liveness(&self) -> u32 {
        self.liveness.max(1)
    }

    /// Read deadline for one loop iteration: two heartbeats plus grace.
    ///
    /// A server that stays silent for longer than this has missed a
    /// heartbeat cycle.
    pub fn read_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2 + Duration::from_millis(self.read_grace_ms)
    }
}
