// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to build {kind} runtime: {source}")]
    Build {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RuntimeConfiguration {
    /// the number of cores to use for this runtime, 0 means all
    #[serde(default = "default_n_cores")]
    n_cores: usize,

    /// the thread name for the runtime
    #[serde(default = "default_thread_name")]
    thread_name: String,

    /// the timeout for draining the transports on shutdown
    #[serde(
        default = "default_drain_timeout",
        deserialize_with = "deserialize_duration"
    )]
    drain_timeout: time::Duration,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        RuntimeConfiguration {
            n_cores: default_n_cores(),
            thread_name: default_thread_name(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_n_cores() -> usize {
    0
}

fn default_thread_name() -> String {
    "dualgate".to_string()
}

fn default_drain_timeout() -> time::Duration {
    time::Duration::from_secs(10)
}

impl RuntimeConfiguration {
    pub fn new() -> Self {
        RuntimeConfiguration::default()
    }

    pub fn with_cores(n_cores: usize) -> Self {
        RuntimeConfiguration {
            n_cores,
            ..RuntimeConfiguration::default()
        }
    }

    pub fn with_drain_timeout(drain_timeout: time::Duration) -> Self {
        RuntimeConfiguration {
            drain_timeout,
            ..RuntimeConfiguration::default()
        }
    }

    pub fn n_cores(&self) -> usize {
        self.n_cores
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn drain_timeout(&self) -> time::Duration {
        self.drain_timeout
    }
}

pub struct GatewayRuntime {
    pub config: RuntimeConfiguration,
    pub runtime: Runtime,
}

pub fn build(config: &RuntimeConfiguration) -> Result<GatewayRuntime, RuntimeError> {
    let n_cpu = num_cpus::get();

    let cores = if config.n_cores > n_cpu {
        warn!(
            requested = config.n_cores,
            available = n_cpu,
            "requested more cores than available, using all available cores"
        );
        n_cpu
    } else if config.n_cores == 0 {
        info!(%n_cpu, "using all available cores");
        n_cpu
    } else {
        config.n_cores
    };

    let runtime = match cores {
        1 => {
            info!("using single-threaded runtime");
            Builder::new_current_thread()
                .enable_all()
                .thread_name(config.thread_name.as_str())
                .build()
                .map_err(|source| RuntimeError::Build {
                    kind: "single-threaded",
                    source,
                })?
        }
        _ => {
            info!(%cores, "using multi-threaded runtime");
            Builder::new_multi_thread()
                .enable_all()
                .thread_name(config.thread_name.as_str())
                .worker_threads(cores)
                .max_blocking_threads(cores)
                .build()
                .map_err(|source| RuntimeError::Build {
                    kind: "multi-threaded",
                    source,
                })?
        }
    };

    Ok(GatewayRuntime {
        config: config.clone(),
        runtime,
    })
}
