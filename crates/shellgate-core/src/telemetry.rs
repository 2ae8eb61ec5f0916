//! Tracing initialisation for shellgate binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "SHELLGATE_LOG";

/// Initialise the global subscriber.
///
/// * `json` - emit newline-delimited JSON.
/// * `level` - verbosity when neither `SHELLGATE_LOG` nor `RUST_LOG` is set.
///
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
