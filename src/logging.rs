//! Log subscriber setup for the server binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{GeneralConfig, LogFormat};
use crate::error::{MonitorError, MonitorResult};

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `general.log_level`. Call once at
/// startup.
///
/// # Errors
///
/// An invalid level directive, or a subscriber already installed.
pub fn init_logging(general: &GeneralConfig) -> MonitorResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&general.log_level)
            .map_err(|e| MonitorError::internal(format!("invalid log level {:?}: {e}", general.log_level)))?,
    };
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match general.log_format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init(),
    };
    installed.map_err(|e| MonitorError::internal(format!("log subscriber: {e}")))
}
