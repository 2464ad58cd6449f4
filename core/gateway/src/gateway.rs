// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dualgate_dispatch::{
    AccessLog, CallSpanOption, CallTags, CtxOption, Recovery, Registry, StreamMiddleware,
    UnaryMiddleware,
};
use dualgate_transport::{GrpcConfig, GrpcModule, HttpConfig, HttpModule, TransportError};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("transports not drained within {0:?}")]
    DrainTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of [`Gateway::start`]. A transport that failed to bind is listed
/// in `errors` and has no address; the other one keeps serving.
#[derive(Debug, Default)]
pub struct StartReport {
    pub http: Option<SocketAddr>,
    pub grpc: Option<SocketAddr>,
    pub errors: Vec<TransportError>,
}

impl StartReport {
    pub fn is_serving(&self) -> bool {
        self.http.is_some() || self.grpc.is_some()
    }
}

/// The shared registry and one module per transport.
#[derive(Debug)]
pub struct Gateway {
    registry: Arc<Registry>,
    http: HttpModule,
    grpc: GrpcModule,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            http: HttpModule::new(registry.clone()),
            grpc: GrpcModule::new(registry.clone()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn http(&self) -> &HttpModule {
        &self.http
    }

    pub fn grpc(&self) -> &GrpcModule {
        &self.grpc
    }

    /// Applies `config` and the default interceptors to the HTTP core. A
    /// running listener picks them up on its next start.
    pub async fn configure_http(&self, config: &HttpConfig) {
        let mut core = self.http.lock().await;
        core.apply_config(config);
        core.middlewares = unary_middlewares();
        core.ctx_options = ctx_options();
        core.unlock();
    }

    /// Applies `config` and the default interceptors to the gRPC core and
    /// restarts the listener if it is already serving.
    pub async fn configure_grpc(&self, config: &GrpcConfig) -> Result<(), TransportError> {
        let mut core = self.grpc.lock().await;
        core.apply_config(config);
        core.middlewares = unary_middlewares();
        core.stream_middlewares = stream_middlewares();
        core.ctx_options = ctx_options();
        core.unlock_and_restart().await
    }

    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();

        match self.http.start().await {
            Ok(addr) => report.http = addr,
            Err(e) => {
                error!(transport = "http", error = %e, "transport failed to start");
                report.errors.push(e);
            }
        }
        match self.grpc.start().await {
            Ok(addr) => report.grpc = addr,
            Err(e) => {
                error!(transport = "grpc", error = %e, "transport failed to start");
                report.errors.push(e);
            }
        }

        info!(
            http = ?report.http,
            grpc = ?report.grpc,
            handlers = self.registry.len(),
            "gateway started"
        );
        report
    }

    /// Drains both transports concurrently. Each module bounds its own drain
    /// by its shutdown timeout; `timeout` bounds the whole operation.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), GatewayError> {
        let both = async {
            tokio::join!(self.http.stop(), self.grpc.stop());
        };
        tokio::time::timeout(timeout, both)
            .await
            .map_err(|_| GatewayError::DrainTimeout(timeout))?;
        info!("gateway stopped");
        Ok(())
    }
}

fn unary_middlewares() -> Vec<UnaryMiddleware> {
    vec![
        Arc::new(Recovery) as UnaryMiddleware,
        Arc::new(CallTags),
        Arc::new(AccessLog),
    ]
}

fn stream_middlewares() -> Vec<StreamMiddleware> {
    vec![
        Arc::new(Recovery) as StreamMiddleware,
        Arc::new(CallTags),
        Arc::new(AccessLog),
    ]
}

fn ctx_options() -> Vec<CtxOption> {
    vec![Arc::new(CallSpanOption) as CtxOption]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_configure_sets_interceptors() {
        let gateway = Gateway::new();
        gateway.configure_http(&HttpConfig::default()).await;
        gateway.configure_grpc(&GrpcConfig::default()).await.unwrap();

        let http = gateway.http().snapshot().await;
        assert_eq!(http.middlewares.len(), 3);
        assert_eq!(http.ctx_options.len(), 1);

        let grpc = gateway.grpc().snapshot().await;
        assert_eq!(grpc.middlewares.len(), 3);
        assert_eq!(grpc.stream_middlewares.len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_disabled() {
        let gateway = Gateway::new();
        let report = gateway.start().await;
        assert!(!report.is_serving());
        assert!(report.errors.is_empty());
        assert!(logs_contain("module disabled, not serving"));

        gateway.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
