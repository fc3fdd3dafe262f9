//! Structured logging setup.
//!
//! - `LOG_FORMAT=json` switches to JSON lines for log shipping, anything else is text
//! - `RUST_LOG` filters as usual (default: `info`), e.g.
//!   `RUST_LOG=ka_activation=debug,reqwest=warn`
//! - Output goes to stderr; stdout carries the host bridge protocol
//!
//! Activation runs open an `activation` span carrying `run_id` and a masked session
//! token, so every event emitted while a run is in flight is attributable to it.
//! License keys, identity tokens and proxy passwords must only be logged through
//! [`crate::mask_key`] or a preview.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber for `service_name`.
///
/// Returns `false` if a subscriber was already installed (e.g. by the host app).
pub fn init_logging(service_name: &str) -> bool {
    let installed = match LogFormat::from_env() {
        LogFormat::Json => init_json_logging(env_filter()),
        LogFormat::Text => init_text_logging(env_filter()),
    };
    if installed {
        tracing::info!(service = service_name, "Logging initialized");
    }
    installed
}

/// Subscriber for tests: output is captured per test by the harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(true),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = EnvFilter::new(DEFAULT_FILTER);
        drop(filter);
    }

    #[test]
    fn test_second_init_is_reported() {
        init_test_logging();
        assert!(!init_logging("ka-test"));
    }
}
