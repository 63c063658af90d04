//! Tracing setup and small logging helpers.
//!
//! Console output is compact and human oriented; `--json-logs` switches to
//! one JSON object per event for machine parsing.

use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Dependencies that are chatty at debug level.
const QUIET_TARGETS: [&str; 3] = ["tungstenite=warn", "hyper=warn", "reqwest=warn"];

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Emit JSON lines instead of text.
    pub json: bool,
    /// Default to DEBUG for this crate.
    pub verbose: bool,
}

impl LogConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }

    fn default_filter(&self) -> String {
        let level = if self.verbose { Level::DEBUG } else { Level::INFO };
        let mut directives = vec![format!(
            "crosspoint_send={}",
            level.as_str().to_lowercase()
        )];
        directives.extend(QUIET_TARGETS.iter().map(|d| d.to_string()));
        directives.join(",")
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Returns `false` when a subscriber was already installed.
pub fn init(config: LogConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    result.is_ok()
}

/// Lets an event through at most once per interval.
///
/// Owned by the loop it throttles, so no synchronization is needed.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True on the first call and whenever `interval` has passed since the
    /// last `true`.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Byte count for humans, in binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
