// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::codec::Payload;
use crate::context::CallContext;
use crate::errors::DispatchError;
use crate::handler::HandlerDescriptor;
use crate::key::ServiceKey;
use crate::status::Status;
use crate::stream::ServerStream;

pub type HandlerTable = HashMap<ServiceKey, Arc<HandlerDescriptor>>;

/// Process-wide table of handlers, shared by every transport.
///
/// Lookups read an immutable snapshot and never block. Registration copies
/// the table, adds the entry and publishes the new snapshot; writers are
/// serialized among themselves. A key can be registered only once: a second
/// registration is rejected with `DuplicateRegistration` and the first
/// handler stays in place.
#[derive(Default)]
pub struct Registry {
    table: ArcSwap<HandlerTable>,
    writer: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: ServiceKey,
        descriptor: HandlerDescriptor,
    ) -> Result<(), DispatchError> {
        key.validate()?;

        let _writer = self.writer.lock();
        let current = self.table.load();
        if current.contains_key(&key) {
            debug!(%key, "rejecting duplicate registration");
            return Err(DispatchError::DuplicateRegistration(key));
        }

        let mut next = HandlerTable::clone(&current);
        info!(%key, kind = %descriptor.kind(), request = descriptor.request_type(), "handler registered");
        next.insert(key, Arc::new(descriptor));
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// Registers a unary handler: one request in, one response out.
    pub fn handle_unary<Req, Resp, F, Fut>(
        &self,
        key: ServiceKey,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(key, HandlerDescriptor::unary(handler))
    }

    /// Registers a streaming handler that drives the stream itself.
    pub fn listen_stream<F, Fut>(&self, key: ServiceKey, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(key, HandlerDescriptor::streaming(handler))
    }

    pub fn resolve(&self, key: &ServiceKey) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        self.table
            .load()
            .get(key)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(key.clone()))
    }

    pub fn snapshot(&self) -> Arc<HandlerTable> {
        self.table.load_full()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Registered keys grouped by fully qualified service name, both levels
    /// sorted.
    pub fn services(&self) -> BTreeMap<String, Vec<ServiceKey>> {
        let mut services: BTreeMap<String, Vec<ServiceKey>> = BTreeMap::new();
        for key in self.table.load().keys() {
            services
                .entry(key.service_name())
                .or_default()
                .push(key.clone());
        }
        for keys in services.values_mut() {
            keys.sort();
        }
        services
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.len())
            .finish()
    }
}
