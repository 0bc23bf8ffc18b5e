// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Configuration is loaded from, in order of priority:
//!   1. The `TOWLINE_LOG` environment variable (standard `EnvFilter` syntax).
//!   2. An optional TOML file pointed to by `TOWLINE_LOGGING_CONFIG_PATH`.
//!   3. Built-in defaults (`info`).
//!
//! Output is human-readable by default; set `TOWLINE_LOG_JSONL=1` for JSON
//! lines.
//!
//! Example config file:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "towline" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// ENV used to set the filter directives directly.
const FILTER_ENV: &str = "TOWLINE_LOG";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file.
const CONFIG_PATH_ENV: &str = "TOWLINE_LOGGING_CONFIG_PATH";

/// ENV that switches output to JSON lines.
const JSONL_ENV: &str = "TOWLINE_LOG_JSONL";

/// Once instance to ensure the subscriber is only installed once.
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
pub struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Defaults merged with the optional TOML file.
    pub fn from_settings() -> Self {
        let mut figment = Figment::from(Serialized::defaults(LoggingConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.extract().unwrap_or_default()
    }

    /// Comma-separated `EnvFilter` directives: base level first, then one
    /// `target=level` entry per filter, in sorted order for stability.
    fn filter_directives(&self) -> String {
        let mut directives = vec![self.log_level.clone()];
        let mut filters: Vec<_> = self.log_filters.iter().collect();
        filters.sort();
        directives.extend(filters.into_iter().map(|(target, level)| format!("{target}={level}")));
        directives.join(",")
    }
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call wins.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
            EnvFilter::new(LoggingConfig::from_settings().filter_directives())
        });
        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        if jsonl {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
