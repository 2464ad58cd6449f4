// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use tracing::{Instrument, debug, info, info_span};

use crate::config::ConfigLoader;
use crate::demo::register_demo_handlers;
use crate::exercise::Exercise;
use crate::gateway::Gateway;
use crate::runtime;

/// Async body: tracing setup, gateway lifecycle, graceful shutdown.
/// The caller provides the Tokio runtime.
pub async fn run_gateway(mut config: ConfigLoader) -> Result<()> {
    let tracing_conf = config.tracing().clone();
    tracing_conf.setup_tracing_subscriber();
    debug!(?tracing_conf);

    let root_span = info_span!("application_lifecycle");
    serve(config).instrument(root_span).await
}

async fn serve(mut config: ConfigLoader) -> Result<()> {
    let drain_timeout = config.runtime().drain_timeout();
    let http_config = config.http().context("invalid http configuration")?.clone();
    let grpc_config = config.grpc().context("invalid grpc configuration")?.clone();
    let exercise_config = config.exercise().clone();

    let gateway = Gateway::new();
    register_demo_handlers(gateway.registry()).context("failed to register demo handlers")?;

    gateway.configure_http(&http_config).await;
    gateway
        .configure_grpc(&grpc_config)
        .await
        .context("failed to configure grpc")?;

    let report = gateway.start().await;
    if !report.errors.is_empty() && !report.is_serving() {
        anyhow::bail!("no transport could start: {} errors", report.errors.len());
    }

    let exercise = exercise_config
        .enabled
        .then(|| Exercise::spawn(&exercise_config, report.http, report.grpc));

    dualgate_signal::shutdown().await;
    debug!("received shutdown signal");

    if let Some(exercise) = exercise {
        for (task, stats) in exercise.stop().await {
            info!(task, ok = stats.ok, failed = stats.failed, "exercise loop stopped");
        }
    }

    gateway
        .shutdown(drain_timeout)
        .await
        .context("gateway shutdown failed")?;
    Ok(())
}

/// Loads `config_file`, builds the runtime described by its `runtime:`
/// section and serves until a shutdown signal. Blocks the calling thread.
pub fn run(config_file: &str) -> Result<()> {
    let mut config = ConfigLoader::new(config_file).context("failed to load configuration")?;

    let rt = runtime::build(config.runtime()).context("failed to build runtime")?;
    rt.runtime.block_on(run_gateway(config))
}
