// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{transport}: cannot bind {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{transport}: cannot read local address: {source}")]
    LocalAddr {
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is already serving")]
    AlreadyServing(&'static str),
    #[error("invalid path template {template:?}: {reason}")]
    InvalidPathTemplate { template: String, reason: String },
    #[error("response not written within {0:?}")]
    WriteTimeout(Duration),
    #[error("cannot dial {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid path template {0:?}: must contain {{pkg}}, {{service}} and {{method}}")]
    PathTemplate(String),
    #[error("{0} must not be zero")]
    ZeroValue(&'static str),
}
