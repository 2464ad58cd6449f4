// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Module lifecycle controller.
//!
//! Each transport owns one [`Module`]: its core sits behind an async mutex
//! and is only mutated through the [`ModuleGuard`] returned by
//! [`Module::lock`]. Starting takes a snapshot of the core under the same
//! lock, so a running transport never sees a half-applied change. Request
//! handling never touches the lock.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use dualgate_dispatch::Registry;
use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::core::TransportCore;
use crate::errors::TransportError;

/// A wire protocol that can be served by a [`Module`].
pub trait Transport: Send + Sync + 'static {
    type Core: TransportCore;
    /// Immutable per-start state shared by all connections.
    type State: Send + Sync + 'static;

    const NAME: &'static str;

    fn prepare(core: &Self::Core, registry: &Arc<Registry>) -> Result<Self::State, TransportError>;

    /// Serves one accepted connection. Implementations hold `watch` for the
    /// connection's lifetime and shut the connection down gracefully once it
    /// is signaled.
    fn serve_connection(
        state: Arc<Self::State>,
        stream: TcpStream,
        peer: SocketAddr,
        watch: drain::Watch,
    ) -> BoxFuture<'static, ()>;
}

pub struct Module<T: Transport> {
    core: Mutex<T::Core>,
    registry: Arc<Registry>,
    server: Mutex<Option<RunningServer>>,
}

impl<T: Transport> Module<T> {
    /// New module with a default (disabled) core.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_core(registry, T::Core::default())
    }

    pub fn with_core(registry: Arc<Registry>, core: T::Core) -> Self {
        Self {
            core: Mutex::new(core),
            registry,
            server: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Exclusive access to the core. Do not call [`Module::start`] or
    /// [`Module::stop`] while holding the guard.
    pub async fn lock(&self) -> ModuleGuard<'_, T> {
        ModuleGuard {
            core: self.core.lock().await,
            module: self,
        }
    }

    /// Copy of the current settings.
    pub async fn snapshot(&self) -> T::Core {
        self.core.lock().await.clone()
    }

    /// Binds and starts serving with the current settings. Returns the bound
    /// address, or `None` when the core is disabled.
    pub async fn start(&self) -> Result<Option<SocketAddr>, TransportError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(TransportError::AlreadyServing(T::NAME));
        }

        let core = self.core.lock().await.clone();
        *server = Self::launch(core, &self.registry).await?;
        Ok(server.as_ref().map(|s| s.local_addr))
    }

    /// Stops accepting, then waits for open connections to finish their calls
    /// for at most the core's shutdown timeout. No-op when not serving.
    pub async fn stop(&self) {
        if let Some(running) = self.server.lock().await.take() {
            running.shutdown(T::NAME).await;
        }
    }

    pub async fn is_serving(&self) -> bool {
        self.server.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// The server slot is released while the old listener drains, so
    /// `is_serving` and `local_addr` answer immediately (not serving) until
    /// the new listener is installed.
    async fn restart_if_serving(&self) -> Result<(), TransportError> {
        let Some(running) = self.server.lock().await.take() else {
            debug!(transport = T::NAME, "not serving, new settings apply on start");
            return Ok(());
        };

        info!(transport = T::NAME, addr = %running.local_addr, "restarting with new settings");
        running.shutdown(T::NAME).await;

        let core = self.core.lock().await.clone();
        let launched = Self::launch(core, &self.registry).await?;

        let mut server = self.server.lock().await;
        if server.is_some() {
            // started by someone else while draining; theirs wins
            drop(server);
            if let Some(extra) = launched {
                extra.shutdown(T::NAME).await;
            }
            return Err(TransportError::AlreadyServing(T::NAME));
        }
        *server = launched;
        Ok(())
    }

    async fn launch(
        core: T::Core,
        registry: &Arc<Registry>,
    ) -> Result<Option<RunningServer>, TransportError> {
        if !core.enabled() {
            info!(transport = T::NAME, "module disabled, not serving");
            return Ok(None);
        }

        let state = Arc::new(T::prepare(&core, registry)?);

        let addr = core.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                transport: T::NAME,
                addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::LocalAddr {
                transport: T::NAME,
                source,
            })?;

        let (signal, watch) = drain::channel();
        let accept_stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();

        let acceptor = tokio::spawn(
            accept_loop::<T>(
                listener,
                state,
                watch,
                accept_stop.clone(),
                hard_stop.clone(),
            )
            .in_current_span(),
        );

        info!(transport = T::NAME, %local_addr, "listening");
        Ok(Some(RunningServer {
            local_addr,
            accept_stop,
            hard_stop,
            signal,
            acceptor,
            shutdown_timeout: core.shutdown_timeout(),
        }))
    }
}

impl<T: Transport> std::fmt::Debug for Module<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("transport", &T::NAME).finish()
    }
}

/// Holds a module's configuration lock. Dropping the guard (or calling
/// [`ModuleGuard::unlock`]) releases it without touching a running
/// transport.
pub struct ModuleGuard<'a, T: Transport> {
    core: MutexGuard<'a, T::Core>,
    module: &'a Module<T>,
}

impl<T: Transport> ModuleGuard<'_, T> {
    pub fn unlock(self) {}

    /// Releases the lock and, if the transport is serving, drains it and
    /// starts it again with the settings just written.
    pub async fn unlock_and_restart(self) -> Result<(), TransportError> {
        let ModuleGuard { core, module } = self;
        drop(core);
        module.restart_if_serving().await
    }
}

impl<T: Transport> Deref for ModuleGuard<'_, T> {
    type Target = T::Core;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

impl<T: Transport> DerefMut for ModuleGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.core
    }
}

struct RunningServer {
    local_addr: SocketAddr,
    accept_stop: CancellationToken,
    hard_stop: CancellationToken,
    signal: drain::Signal,
    acceptor: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl RunningServer {
    async fn shutdown(self, transport: &'static str) {
        self.accept_stop.cancel();
        if let Err(e) = self.acceptor.await {
            error!(transport, error = %e, "accept loop ended abnormally");
        }

        debug!(transport, addr = %self.local_addr, "draining connections");
        match tokio::time::timeout(self.shutdown_timeout, self.signal.drain()).await {
            Ok(()) => info!(transport, addr = %self.local_addr, "stopped"),
            Err(_) => {
                warn!(
                    transport,
                    addr = %self.local_addr,
                    timeout = ?self.shutdown_timeout,
                    "drain timed out, closing remaining connections"
                );
                self.hard_stop.cancel();
            }
        }
    }
}

async fn accept_loop<T: Transport>(
    listener: TcpListener,
    state: Arc<T::State>,
    watch: drain::Watch,
    accept_stop: CancellationToken,
    hard_stop: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = accept_stop.cancelled() => {
                debug!(transport = T::NAME, "no longer accepting connections");
                break;
            }
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    // usually fd exhaustion; back off instead of spinning
                    error!(transport = T::NAME, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(transport = T::NAME, %peer, error = %e, "cannot set TCP_NODELAY");
        }

        let conn = T::serve_connection(state.clone(), stream, peer, watch.clone());
        let hard_stop = hard_stop.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = conn => {}
                    _ = hard_stop.cancelled() => {
                        debug!(transport = T::NAME, %peer, "connection aborted");
                    }
                }
            }
            .in_current_span(),
        );
    }
}
