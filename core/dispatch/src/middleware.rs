// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Interceptor chains.
//!
//! A chain is a list of interceptors wrapped around the handler. The first
//! interceptor is the outermost: it runs first, sees the final result last,
//! and can answer without calling `next` at all. Chains are immutable; a
//! transport builds its chain once when it starts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Reply;
use crate::context::CallContext;
use crate::handler::{StreamHandler, UnaryInvocation};
use crate::status::Status;
use crate::stream::ServerStream;

#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(&self, ctx: CallContext, next: UnaryNext<'_>) -> Result<Reply, Status>;
}

#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    async fn intercept(&self, stream: ServerStream, next: StreamNext<'_>) -> Result<(), Status>;
}

pub type UnaryMiddleware = Arc<dyn UnaryInterceptor>;
pub type StreamMiddleware = Arc<dyn StreamInterceptor>;

/// The rest of a unary chain, ending in the handler.
pub struct UnaryNext<'a> {
    rest: &'a [UnaryMiddleware],
    endpoint: UnaryInvocation,
}

impl UnaryNext<'_> {
    pub async fn run(self, ctx: CallContext) -> Result<Reply, Status> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = UnaryNext {
                    rest,
                    endpoint: self.endpoint,
                };
                first.intercept(ctx, next).await
            }
            None => self.endpoint.invoke(ctx).await,
        }
    }
}

/// The rest of a streaming chain, ending in the handler.
pub struct StreamNext<'a> {
    rest: &'a [StreamMiddleware],
    handler: StreamHandler,
}

impl StreamNext<'_> {
    pub async fn run(self, stream: ServerStream) -> Result<(), Status> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = StreamNext {
                    rest,
                    handler: self.handler,
                };
                first.intercept(stream, next).await
            }
            None => (self.handler)(stream).await,
        }
    }
}

#[derive(Clone)]
pub struct UnaryChain {
    interceptors: Arc<[UnaryMiddleware]>,
}

impl UnaryChain {
    pub fn new(interceptors: Vec<UnaryMiddleware>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub async fn call(&self, ctx: CallContext, endpoint: UnaryInvocation) -> Result<Reply, Status> {
        UnaryNext {
            rest: &self.interceptors,
            endpoint,
        }
        .run(ctx)
        .await
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Default for UnaryChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[derive(Clone)]
pub struct StreamChain {
    interceptors: Arc<[StreamMiddleware]>,
}

impl StreamChain {
    pub fn new(interceptors: Vec<StreamMiddleware>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub async fn call(&self, stream: ServerStream, handler: StreamHandler) -> Result<(), Status> {
        StreamNext {
            rest: &self.interceptors,
            handler,
        }
        .run(stream)
        .await
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Default for StreamChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
