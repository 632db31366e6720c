//! Tracing initialization.
//!
//! Log output goes to stderr through a `tracing-subscriber` fmt layer so that stdout stays free
//! for the interactive confirmation prompt. The filter is read from `RUST_LOG` and defaults to
//! `info`:
//!
//! ```bash
//! RUST_LOG=streetlens=debug streetlens reconcile
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;

    tracing::debug!("Telemetry initialized");
    Ok(())
}
