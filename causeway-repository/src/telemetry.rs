//! Tracing subscriber setup for binaries and tests embedding the repository.
//!
//! The filter comes from `RUST_LOG`, defaulting to info for the causeway
//! crates. Setting `CAUSEWAY_LOG_FORMAT=json` switches to one JSON object per
//! line.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "causeway=info,warn";

/// Output format for [`init_tracing_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("CAUSEWAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber using `CAUSEWAY_LOG_FORMAT`.
///
/// Calling it again, or after another subscriber was installed, does nothing.
pub fn init_tracing() {
    init_tracing_with(LogFormat::from_env());
}

/// Install the global subscriber. Returns false if one was already installed.
pub fn init_tracing_with(format: LogFormat) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init(),
    };

    match installed {
        Ok(()) => {
            tracing::debug!(format = ?format, "Tracing initialized");
            true
        }
        Err(_) => false,
    }
}
