//! Tracing initialisation for germline binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are no-ops
//! because the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before falling back to `RUST_LOG`.
pub const LOG_ENV: &str = "GERMLINE_LOG";

/// Install the global subscriber.
///
/// * `json` selects newline-delimited JSON output.
/// * `level` is the default verbosity when neither `GERMLINE_LOG` nor
///   `RUST_LOG` is set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry.with(fmt::layer().with_target(false)).try_init().ok();
    }
}
