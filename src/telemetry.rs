//! Log subscriber setup for processes that host a partition manager.
//!
//! The engine only emits `tracing` events and spans; installing a subscriber
//! is left to the host. [`init_logging`] is a ready-made one:
//!
//! ```rust,no_run
//! use changefeed::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("no subscriber installed yet");
//! ```
//!
//! `LOG_FORMAT=json` switches to one JSON object per line, anything else
//! keeps the human-readable output. `RUST_LOG` filters as usual and falls
//! back to `info`, e.g. `RUST_LOG=changefeed::feed::lease_manager=debug` to
//! follow etag conflicts.
//!
//! The spans from [`crate::feed::observability`] carry `lease_token` and
//! `host`, so in JSON mode every event inside a supervisor or lease write
//! names its lease through the `span` field.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event, including the current span.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        })
    }
}

impl LogFormat {
    /// `LOG_FORMAT`, defaulting to [`LogFormat::Pretty`] when unset.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Install the global subscriber.
///
/// Fails if the process already has one.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}
