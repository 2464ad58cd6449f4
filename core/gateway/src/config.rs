// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader reads the configuration file once and exposes lazy, cached
// accessors per section. A section that does not parse falls back to its
// defaults with a warning; the transport sections are also validated.

use std::collections::HashSet;
use std::fmt::Debug;

use dualgate_tracing::TracingConfiguration;
use dualgate_transport::{ConfigError as TransportConfigError, Configuration, GrpcConfig, HttpConfig};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value, from_str};
use thiserror::Error;
use tracing::{debug, warn};

use crate::exercise::ExerciseConfig;
use crate::runtime::RuntimeConfiguration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),
    #[error("invalid {section} configuration: {source}")]
    Invalid {
        section: &'static str,
        #[source]
        source: TransportConfigError,
    },
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("runtime");
        s.insert("http");
        s.insert("grpc");
        s.insert("exercise");
        s
    };
}

pub struct ConfigLoader {
    root: Value,
    tracing: Option<TracingConfiguration>,
    runtime: Option<RuntimeConfiguration>,
    http: Option<HttpConfig>,
    grpc: Option<GrpcConfig>,
    exercise: Option<ExerciseConfig>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root_keys = self
            .root
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();

        f.debug_struct("ConfigLoader")
            .field("root_keys", &root_keys)
            .field("tracing_loaded", &self.tracing.is_some())
            .field("runtime_loaded", &self.runtime.is_some())
            .field("http_loaded", &self.http.is_some())
            .field("grpc_loaded", &self.grpc.is_some())
            .field("exercise_loaded", &self.exercise.is_some())
            .finish()
    }
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        // an empty file is an empty configuration
        let root = if config_str.trim().is_empty() {
            Value::Mapping(Mapping::new())
        } else {
            from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?
        };

        let mapping = root.as_mapping().ok_or(ConfigError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ConfigError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ConfigError::InvalidKey(k.to_string()));
            }
        }

        Ok(Self {
            root,
            tracing: None,
            runtime: None,
            http: None,
            grpc: None,
            exercise: None,
        })
    }

    pub fn tracing(&mut self) -> &TracingConfiguration {
        let root = &self.root;
        self.tracing.get_or_insert_with(|| section(root, "tracing"))
    }

    pub fn runtime(&mut self) -> &RuntimeConfiguration {
        let root = &self.root;
        self.runtime.get_or_insert_with(|| section(root, "runtime"))
    }

    pub fn http(&mut self) -> Result<&HttpConfig, ConfigError> {
        let root = &self.root;
        let cfg = self.http.get_or_insert_with(|| section(root, "http"));
        cfg.validate().map_err(|source| ConfigError::Invalid {
            section: "http",
            source,
        })?;
        Ok(cfg)
    }

    pub fn grpc(&mut self) -> Result<&GrpcConfig, ConfigError> {
        let root = &self.root;
        let cfg = self.grpc.get_or_insert_with(|| section(root, "grpc"));
        cfg.validate().map_err(|source| ConfigError::Invalid {
            section: "grpc",
            source,
        })?;
        Ok(cfg)
    }

    pub fn exercise(&mut self) -> &ExerciseConfig {
        let root = &self.root;
        self.exercise.get_or_insert_with(|| section(root, "exercise"))
    }
}

fn section<T>(root: &Value, key: &'static str) -> T
where
    T: DeserializeOwned + Default + Debug,
{
    let cfg = root
        .get(key)
        .cloned()
        .map(|v| {
            serde_yaml::from_value(v).unwrap_or_else(|e| {
                warn!(section = key, error = %e, "invalid configuration section, falling back to default");
                T::default()
            })
        })
        .unwrap_or_default();
    debug!(section = key, ?cfg, "configuration loaded");
    cfg
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tracing_test::traced_test;

    fn testdata_path() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/testdata").to_string()
    }

    #[test]
    #[traced_test]
    fn test_full_config() {
        let path = format!("{}/config.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).expect("loader init should succeed");

        assert_eq!(loader.tracing().log_level(), "debug");
        assert_eq!(loader.runtime().n_cores(), 2);
        assert_eq!(loader.runtime().drain_timeout(), Duration::from_secs(5));

        let http = loader.http().unwrap();
        assert!(http.enable);
        assert_eq!(http.listen_port, 3737);
        assert_eq!(http.write_timeout, Duration::from_secs(10));

        let grpc = loader.grpc().unwrap();
        assert!(grpc.enable);
        assert_eq!(grpc.listen_port, 3730);
        assert_eq!(grpc.max_concurrent_streams, Some(128));

        let exercise = loader.exercise();
        assert!(exercise.enabled);
        assert_eq!(exercise.interval, Duration::from_secs(3));
    }

    #[test]
    fn test_empty_config() {
        let path = format!("{}/config-empty.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).unwrap();

        assert_eq!(loader.tracing().log_level(), "info");
        assert!(!loader.http().unwrap().enable);
        assert!(!loader.grpc().unwrap().enable);
        assert!(!loader.exercise().enabled);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let path = format!("{}/config-invalid-key.yaml", testdata_path());
        let err = ConfigLoader::new(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey(k) if k == "services"));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new("/does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            ConfigLoader::from_yaml("- just\n- a list\n"),
            Err(ConfigError::InvalidYaml)
        ));
        assert!(matches!(
            ConfigLoader::from_yaml("http: [unclosed"),
            Err(ConfigError::InvalidYaml)
        ));
    }

    #[test]
    #[traced_test]
    fn test_bad_section_falls_back() {
        let path = format!("{}/config-bad-section.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).unwrap();

        // grpc section is a string, not a mapping
        assert_eq!(loader.grpc().unwrap(), &GrpcConfig::default());
        assert!(logs_contain("falling back to default"));

        // the rest of the file is unaffected
        assert_eq!(loader.http().unwrap().listen_port, 8080);
    }

    #[test]
    fn test_invalid_http_section() {
        let path = format!("{}/config-invalid-http.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).unwrap();
        let err = loader.http().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "http", .. }));
        // other sections still load
        assert!(loader.grpc().is_ok());
    }
}
