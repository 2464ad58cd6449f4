// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TracingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default = "default_display_thread_names")]
    display_thread_names: bool,

    #[serde(default = "default_display_thread_ids")]
    display_thread_ids: bool,

    /// Extra directives in `EnvFilter` syntax, e.g. `dualgate_transport=debug,hyper=warn`.
    /// Empty means only `log_level` applies.
    #[serde(default = "default_filter")]
    filter: String,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: default_log_level(),
            display_thread_names: default_display_thread_names(),
            display_thread_ids: default_display_thread_ids(),
            filter: default_filter(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_display_thread_names() -> bool {
    true
}

fn default_display_thread_ids() -> bool {
    false
}

fn default_filter() -> String {
    String::new()
}

// string level to tracing::Level, unknown values fall back to info
fn resolve_level(level: &str) -> Level {
    let level = level.to_lowercase();
    match level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

impl TracingConfiguration {
    pub fn with_log_level(self, log_level: String) -> Self {
        TracingConfiguration { log_level, ..self }
    }

    pub fn with_display_thread_names(self, display_thread_names: bool) -> Self {
        TracingConfiguration {
            display_thread_names,
            ..self
        }
    }

    pub fn with_display_thread_ids(self, display_thread_ids: bool) -> Self {
        TracingConfiguration {
            display_thread_ids,
            ..self
        }
    }

    pub fn with_filter(self, filter: String) -> Self {
        TracingConfiguration { filter, ..self }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn display_thread_names(&self) -> bool {
        self.display_thread_names
    }

    pub fn display_thread_ids(&self) -> bool {
        self.display_thread_ids
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Builds the `EnvFilter`: the global level first, then the configured
    /// directives. Invalid directives are dropped and reported on stderr since
    /// no subscriber exists yet.
    fn env_filter(&self) -> EnvFilter {
        let level = resolve_level(&self.log_level);
        let mut filter = EnvFilter::default().add_directive(level.into());

        for directive in self.filter.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("ignoring invalid tracing directive {directive:?}: {e}"),
            }
        }

        filter
    }

    /// Set up a subscriber that logs to stdout.
    ///
    /// Calling this more than once is harmless: later calls keep the
    /// subscriber that is already installed.
    pub fn setup_tracing_subscriber(&self) {
        let res = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_thread_names(self.display_thread_names)
            .with_thread_ids(self.display_thread_ids)
            .try_init();

        if res.is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tracing_configuration() {
        let config = TracingConfiguration::default();
        assert_eq!(config.log_level, default_log_level());
        assert_eq!(config.display_thread_names, default_display_thread_names());
        assert_eq!(config.display_thread_ids, default_display_thread_ids());
        assert_eq!(config.filter, default_filter());
    }

    #[test]
    fn test_resolve_level() {
        assert_eq!(resolve_level("trace"), Level::TRACE);
        assert_eq!(resolve_level("DEBUG"), Level::DEBUG);
        assert_eq!(resolve_level("info"), Level::INFO);
        assert_eq!(resolve_level("warn"), Level::WARN);
        assert_eq!(resolve_level("error"), Level::ERROR);
        assert_eq!(resolve_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: TracingConfiguration =
            serde_yaml::from_str("log_level: debug\nfilter: \"hyper=warn\"\n").unwrap();
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.filter(), "hyper=warn");
        assert!(config.display_thread_names());
        assert!(!config.display_thread_ids());
    }

    #[test]
    fn test_env_filter_skips_invalid_directives() {
        let config = TracingConfiguration::default()
            .with_log_level("warn".to_string())
            .with_filter("dualgate_transport=debug, ,not a directive===".to_string());
        let rendered = config.env_filter().to_string();
        assert!(rendered.contains("dualgate_transport=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_builders() {
        let config = TracingConfiguration::default()
            .with_display_thread_ids(true)
            .with_display_thread_names(false);
        assert!(config.display_thread_ids());
        assert!(!config.display_thread_names());
    }
}
