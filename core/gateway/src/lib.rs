// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod args;
pub mod config;
pub mod demo;
pub mod exercise;
pub mod gateway;
pub mod runner;
pub mod runtime;

pub use gateway::{Gateway, GatewayError, StartReport};
