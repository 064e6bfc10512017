//! Subscriber initialization for structured logs.
//!
//! The engine itself only emits `tracing` events; embedding applications
//! can either install their own subscriber or call [`init_tracing`] for a
//! sensible default.

use tracing_subscriber::EnvFilter;

/// Configuration for the default tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Filter directive, e.g. `"storyloom=debug,info"`. Falls back to the
    /// `RUST_LOG` environment variable, then to `"info"`.
    pub filter: Option<String>,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl TracingConfig {
    /// Creates a new tracing config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter directive.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Enables JSON output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> anyhow::Result<()> {
    let filter = match &config.filter {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}
