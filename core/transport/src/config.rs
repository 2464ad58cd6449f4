// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! YAML-facing transport settings. These are plain data; they reach a running
//! transport only through a locked core (`apply_config`) and a start or
//! restart.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub trait Configuration {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate the configuration
    fn validate(&self) -> Result<(), Self::Error>;
}

pub const DEFAULT_HTTP_PORT: u16 = 3737;
pub const DEFAULT_GRPC_PORT: u16 = 3730;
pub const DEFAULT_PATH_TEMPLATE: &str = "/{pkg}/{service}/{method}";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_http_port")]
    pub listen_port: u16,

    /// Time allowed to receive request headers and body. `0s` disables it.
    #[serde(default = "default_io_timeout", deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,

    /// Hard bound on producing the response. `0s` disables it.
    #[serde(default = "default_io_timeout", deserialize_with = "deserialize_duration")]
    pub write_timeout: Duration,

    /// Route template; must expose `{pkg}`, `{service}` and `{method}`.
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    #[serde(default = "default_shutdown_timeout", deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            host: default_host(),
            listen_port: default_http_port(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            path: default_path(),
            max_body_size: default_max_body_size(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.listen_port)
    }
}

impl Configuration for HttpConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        let has_params = ["{pkg}", "{service}", "{method}"]
            .iter()
            .all(|p| self.path.contains(p));
        if !self.path.starts_with('/') || !has_params {
            return Err(ConfigError::PathTemplate(self.path.clone()));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::ZeroValue("max_body_size"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GrpcConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_grpc_port")]
    pub listen_port: u16,

    /// HTTP/2 concurrent streams per connection, unlimited if unset.
    #[serde(default)]
    pub max_concurrent_streams: Option<u32>,

    /// Interval of server keepalive pings, disabled if unset.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub keepalive_interval: Option<Duration>,

    #[serde(default = "default_keepalive_timeout", deserialize_with = "deserialize_duration")]
    pub keepalive_timeout: Duration,

    #[serde(default = "default_shutdown_timeout", deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enable: false,
            host: default_host(),
            listen_port: default_grpc_port(),
            max_concurrent_streams: None,
            keepalive_interval: None,
            keepalive_timeout: default_keepalive_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl GrpcConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.listen_port)
    }
}

impl Configuration for GrpcConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.max_concurrent_streams == Some(0) {
            return Err(ConfigError::ZeroValue("max_concurrent_streams"));
        }
        if self.keepalive_interval.is_some() && self.keepalive_timeout.is_zero() {
            return Err(ConfigError::ZeroValue("keepalive_timeout"));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_grpc_port() -> u16 {
    DEFAULT_GRPC_PORT
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_path() -> String {
    DEFAULT_PATH_TEMPLATE.to_string()
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
