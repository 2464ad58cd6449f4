// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Mutable per-transport settings. A core is only reachable through a
//! [`crate::module::Module`] lock, and a running transport works from a
//! snapshot taken when it started.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dualgate_dispatch::{CtxOption, ServiceKey, StreamMiddleware, UnaryMiddleware};

use crate::config::{DEFAULT_PATH_TEMPLATE, GrpcConfig, HttpConfig};

pub trait TransportCore: Clone + Default + Send + Sync + 'static {
    fn enabled(&self) -> bool;

    fn listen_addr(&self) -> SocketAddr;

    /// Upper bound for draining in-flight calls on stop or restart.
    fn shutdown_timeout(&self) -> Duration;
}

/// Named parameters captured by the HTTP path template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl<'k, 'v> FromIterator<(&'k str, &'v str)> for PathParams {
    fn from_iter<I: IntoIterator<Item = (&'k str, &'v str)>>(iter: I) -> Self {
        PathParams(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

pub type PathToKey = Arc<dyn Fn(&PathParams) -> Option<ServiceKey> + Send + Sync>;

/// Maps `{pkg}`, `{service}` and `{method}` to a key, unchanged.
pub fn default_path_to_key() -> PathToKey {
    Arc::new(|params: &PathParams| {
        Some(ServiceKey::new(
            params.get("pkg")?,
            params.get("service")?,
            params.get("method")?,
        ))
    })
}

#[derive(Clone)]
pub struct HttpCore {
    pub enable: bool,
    pub host: IpAddr,
    pub listen_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub path: String,
    pub path_to_key: PathToKey,
    pub max_body_size: usize,
    pub shutdown_timeout: Duration,
    pub middlewares: Vec<UnaryMiddleware>,
    pub ctx_options: Vec<CtxOption>,
}

impl Default for HttpCore {
    fn default() -> Self {
        let config = HttpConfig::default();
        Self {
            enable: config.enable,
            host: config.host,
            listen_port: config.listen_port,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            path: DEFAULT_PATH_TEMPLATE.to_string(),
            path_to_key: default_path_to_key(),
            max_body_size: config.max_body_size,
            shutdown_timeout: config.shutdown_timeout,
            middlewares: Vec::new(),
            ctx_options: Vec::new(),
        }
    }
}

impl HttpCore {
    /// Copies the file settings; middlewares, options and the key mapping are
    /// code-level and stay as they are.
    pub fn apply_config(&mut self, config: &HttpConfig) {
        self.enable = config.enable;
        self.host = config.host;
        self.listen_port = config.listen_port;
        self.read_timeout = config.read_timeout;
        self.write_timeout = config.write_timeout;
        self.path = config.path.clone();
        self.max_body_size = config.max_body_size;
        self.shutdown_timeout = config.shutdown_timeout;
    }
}

impl TransportCore for HttpCore {
    fn enabled(&self) -> bool {
        self.enable
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.listen_port)
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl fmt::Debug for HttpCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCore")
            .field("enable", &self.enable)
            .field("listen_addr", &self.listen_addr())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("path", &self.path)
            .field("middlewares", &self.middlewares.len())
            .field("ctx_options", &self.ctx_options.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct GrpcCore {
    pub enable: bool,
    pub host: IpAddr,
    pub listen_port: u16,
    pub max_concurrent_streams: Option<u32>,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Interceptors for unary methods.
    pub middlewares: Vec<UnaryMiddleware>,
    /// Interceptors for streaming methods, configured independently.
    pub stream_middlewares: Vec<StreamMiddleware>,
    pub ctx_options: Vec<CtxOption>,
}

impl Default for GrpcCore {
    fn default() -> Self {
        let config = GrpcConfig::default();
        Self {
            enable: config.enable,
            host: config.host,
            listen_port: config.listen_port,
            max_concurrent_streams: config.max_concurrent_streams,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            shutdown_timeout: config.shutdown_timeout,
            middlewares: Vec::new(),
            stream_middlewares: Vec::new(),
            ctx_options: Vec::new(),
        }
    }
}

impl GrpcCore {
    pub fn apply_config(&mut self, config: &GrpcConfig) {
        self.enable = config.enable;
        self.host = config.host;
        self.listen_port = config.listen_port;
        self.max_concurrent_streams = config.max_concurrent_streams;
        self.keepalive_interval = config.keepalive_interval;
        self.keepalive_timeout = config.keepalive_timeout;
        self.shutdown_timeout = config.shutdown_timeout;
    }
}

impl TransportCore for GrpcCore {
    fn enabled(&self) -> bool {
        self.enable
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.listen_port)
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl fmt::Debug for GrpcCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcCore")
            .field("enable", &self.enable)
            .field("listen_addr", &self.listen_addr())
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("middlewares", &self.middlewares.len())
            .field("stream_middlewares", &self.stream_middlewares.len())
            .field("ctx_options", &self.ctx_options.len())
            .finish()
    }
}
