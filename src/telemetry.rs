//! Logging initialization.
//!
//! The store logs through `tracing` and never installs a subscriber on its
//! own. Binaries and tests call [`init`], which reads:
//! - `RECIPIENTDB_LOG`: an `EnvFilter` directive, default `warn`
//! - `RECIPIENTDB_LOG_FORMAT`: `json` for JSON lines, anything else for text
//!
//! Output goes to stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Env var holding the filter directive.
pub const LOG_ENV: &str = "RECIPIENTDB_LOG";
/// Env var selecting the output format.
pub const LOG_FORMAT_ENV: &str = "RECIPIENTDB_LOG_FORMAT";

/// Installs a global subscriber. Returns false when one was already set.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.is_ok()
}
