// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

/// Resolves once the process is asked to stop (SIGINT/SIGTERM, or Ctrl-C
/// where unix signals are unavailable).
///
/// If a handler cannot be installed the error is logged and the future never
/// resolves for that signal, so the gateway keeps serving instead of exiting.
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            // interactive interrupt
            _ = sig(SignalKind::interrupt(), "SIGINT") => {}
            // orchestrator stop, e.g. k8s pod termination
            _ = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &str) {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                error!(target: "dualgate::signal", signal = name, error = %e, "cannot register signal handler");
                return std::future::pending().await;
            }
        };

        stream.recv().await;
        info!(
            target: "dualgate::signal",
            "received signal {}, starting shutdown",
            name,
        );
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "dualgate::signal", error = %e, "cannot register Ctrl-C handler");
            return std::future::pending().await;
        }
        info!(
            target: "dualgate::signal",
            "received signal Ctrl-C, starting shutdown",
        );
    }
}
