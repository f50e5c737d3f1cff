// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `REGC_LOGGING_CONFIG_PATH`
//!      environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is
//! `READABLE`. `JSONL` can be enabled by setting the `REGC_LOGGING_JSONL`
//! environment variable to `1`.
//!
//! Filters can be configured using the `REGC_LOG` environment variable or by
//! setting the `log_filters` key in the TOML configuration file. Filters are
//! comma-separated key-value pairs where the key is the crate or module name
//! and the value is the log level. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "regcenter" = "debug"
//! "regcenter::singleton" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// ENV used to set the log level
const FILTER_ENV: &str = "REGC_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "REGC_LOGGING_CONFIG_PATH";

/// ENV used to switch the output format to JSON lines
const JSONL_ENV: &str = "REGC_LOGGING_JSONL";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("tonic".to_string(), "error".to_string()),
            ]),
        }
    }
}

fn jsonl_logging_enabled() -> bool {
    std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false)
}

pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // The generics mean we have to repeat everything. Each builder method
    // returns a specialized type.
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .with_ansi(false)
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    } else {
        let l = fmt::layer()
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(
            config
                .log_level
                .parse()
                .unwrap_or(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config file
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "".to_string());
    Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path))
        .extract()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "logging.toml",
                r#"
                log_level = "warn"

                [log_filters]
                "regcenter" = "debug"
                "#,
            )?;
            jail.set_env(CONFIG_PATH_ENV, "logging.toml");
            let config = load_config();
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.log_filters.get("regcenter").unwrap(), "debug");
            Ok(())
        });
    }

    #[test]
    fn test_filters_accept_defaults() {
        // builds without panicking even with the env unset
        let _ = filters(LoggingConfig::default());
    }
}
