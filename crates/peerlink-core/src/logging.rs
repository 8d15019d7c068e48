//! Tracing subscriber setup for applications embedding Peerlink.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the host application. `LoggingBuilder` is the common setup:
//!
//! ```ignore
//! use peerlink_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new()
//!     .with_filter("peerlink_core=debug")
//!     .try_init()?;
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{LinkError, LinkResult};

/// Filter used when neither `RUST_LOG` nor an explicit filter is given.
pub const DEFAULT_FILTER: &str = "peerlink_core=info";

/// Builder for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    env_filter: Option<String>,
    console_output: bool,
    with_target: bool,
    ansi: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            env_filter: None,
            console_output: true,
            with_target: true,
            ansi: true,
        }
    }

    /// Set the filter directive (e.g., "peerlink_core=debug,warn").
    ///
    /// Takes precedence over `RUST_LOG`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Disable console output.
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Omit the module path from console lines.
    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }

    /// Disable ANSI colors (for log files and CI).
    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    /// Resolve the filter this builder would install.
    pub fn build_filter(&self) -> LinkResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| LinkError::InvalidState(format!("Invalid log filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }

    /// Install the subscriber globally.
    ///
    /// Fails if a global subscriber is already set.
    pub fn try_init(self) -> LinkResult<()> {
        let filter = self.build_filter()?;
        let console = self.console_output.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(self.with_target)
                .with_ansi(self.ansi)
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .map_err(|e| LinkError::InvalidState(format!("Logging already initialized: {}", e)))
    }
}
