//! Structured logging setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{error::EscrowError, EscrowResult};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (e.g. `"info"` or
/// `"escrow_orchestrator=debug"`) is used. Fails if a subscriber is already
/// installed.
pub fn init_tracing(default_filter: &str) -> EscrowResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| EscrowError::config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| EscrowError::config(format!("Tracing already initialized: {}", e)))
}
