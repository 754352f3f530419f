//! Logging bootstrap for programs embedding the client or worker.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! the embedding program installs a subscriber. `init` installs the usual
//! one: an `EnvFilter` (honouring `RUST_LOG`) and a fmt layer.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "kosmonaut=info";

/// Install a global subscriber.
///
/// `default_filter` is used when `RUST_LOG` is unset; pass
/// [`DEFAULT_FILTER`] or e.g. `"kosmonaut=debug"` to see every frame.
///
/// # Errors
///
/// Returns an error if the filter does not parse or a global subscriber is
/// already installed.
pub fn init(default_filter: &str) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(default_filter),
    }
    .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!("Logging initialized (kosmonaut v{})", env!("CARGO_PKG_VERSION"));
    Ok(())
}
