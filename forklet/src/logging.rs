//! Tracing subscriber setup for binaries and tests that embed forklet.
//!
//! Forked children never log, so everything here describes the parent side:
//! `forklet::future` and `forklet::bridge` emit one event per child spawned or
//! consumed, `forklet::pool` emits one per admission and sweep.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with FORKLET_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence when set. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("FORKLET_LOG")
            .ok()
            .and_then(|value| parse_level(&value))
            .unwrap_or(LevelFilter::INFO);
        EnvFilter::new(directives(level))
    };

    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(fmt_layer.json()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(LevelFilter::WARN),
        other => other.parse().ok(),
    }
}

fn directives(level: LevelFilter) -> String {
    let level = level.to_string().to_ascii_lowercase();
    ["forklet::future", "forklet::bridge", "forklet::pool", "forklet"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::debug!("still alive");
    }

    #[test]
    fn level_names_are_lenient() {
        assert_eq!(parse_level("Warning"), Some(LevelFilter::WARN));
        assert_eq!(parse_level(" debug "), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn every_target_gets_the_requested_level() {
        assert_eq!(
            directives(LevelFilter::INFO),
            "forklet::future=info,forklet::bridge=info,forklet::pool=info,forklet=info"
        );
        assert!(directives(LevelFilter::TRACE).contains("forklet::pool=trace"));
        assert!(directives(LevelFilter::OFF).ends_with("forklet=off"));
    }
}
