// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Transport adapters for the dispatch registry.
//!
//! An [`HttpModule`] serves unary handlers as HTTP/JSON and a [`GrpcModule`]
//! serves unary and streaming handlers as binary gRPC. Both read the same
//! [`dualgate_dispatch::Registry`]. Settings live in a core that is changed
//! through [`Module::lock`] and applied with
//! [`ModuleGuard::unlock_and_restart`].

pub mod client;
pub mod codec;
pub mod config;
pub mod core;
pub mod errors;
pub mod grpc;
pub mod http;
pub mod module;

pub use client::{CallOptions, ClientStream, GrpcClient};
pub use codec::RawCodec;
pub use config::{Configuration, GrpcConfig, HttpConfig};
pub use crate::core::{GrpcCore, HttpCore, PathParams, PathToKey, TransportCore, default_path_to_key};
pub use errors::{ConfigError, TransportError};
pub use grpc::{GrpcModule, GrpcTransport, parse_grpc_timeout};
pub use crate::http::{HttpModule, HttpTransport, http_status};
pub use module::{Module, ModuleGuard, Transport};
