// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::codec::{Payload, Reply, WireFormat};
use crate::context::CallContext;
use crate::status::Status;
use crate::stream::ServerStream;

/// Calling convention of a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Streaming,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Unary => f.write_str("unary"),
            CallKind::Streaming => f.write_str("streaming"),
        }
    }
}

/// A decoded request bound to its handler, waiting for the context.
pub struct UnaryInvocation(Box<dyn FnOnce(CallContext) -> BoxFuture<'static, Result<Reply, Status>> + Send>);

impl UnaryInvocation {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(CallContext) -> BoxFuture<'static, Result<Reply, Status>> + Send + 'static,
    {
        UnaryInvocation(Box::new(f))
    }

    pub(crate) fn invoke(self, ctx: CallContext) -> BoxFuture<'static, Result<Reply, Status>> {
        (self.0)(ctx)
    }
}

/// Unary entry point with its request type erased. Decoding happens in
/// `prepare`, before any interceptor runs.
pub trait UnaryEndpoint: Send + Sync {
    fn prepare(&self, body: &[u8], format: WireFormat) -> Result<UnaryInvocation, Status>;
}

struct TypedUnary<Req, Resp, F> {
    handler: Arc<F>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F, Fut> UnaryEndpoint for TypedUnary<Req, Resp, F>
where
    Req: Payload,
    Resp: Payload,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    fn prepare(&self, body: &[u8], format: WireFormat) -> Result<UnaryInvocation, Status> {
        let request: Req = format.decode(body)?;
        let handler = self.handler.clone();
        Ok(UnaryInvocation::new(move |ctx| {
            async move { handler(ctx, request).await.map(Reply::new) }.boxed()
        }))
    }
}

pub type StreamHandler = Arc<dyn Fn(ServerStream) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

#[derive(Clone)]
pub enum HandlerMode {
    Unary(Arc<dyn UnaryEndpoint>),
    Streaming(StreamHandler),
}

/// Immutable description of a registered method: how to decode its request
/// and how to invoke it.
#[derive(Clone)]
pub struct HandlerDescriptor {
    request_type: &'static str,
    response_type: &'static str,
    mode: HandlerMode,
}

impl HandlerDescriptor {
    pub fn unary<Req, Resp, F, Fut>(handler: F) -> Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        Self {
            request_type: std::any::type_name::<Req>(),
            response_type: std::any::type_name::<Resp>(),
            mode: HandlerMode::Unary(Arc::new(TypedUnary {
                handler: Arc::new(handler),
                _types: PhantomData,
            })),
        }
    }

    /// Streaming methods decode their own messages through
    /// [`ServerStream::recv`], so no request type is recorded.
    pub fn streaming<F, Fut>(handler: F) -> Self
    where
        F: Fn(ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        Self {
            request_type: "stream",
            response_type: "stream",
            mode: HandlerMode::Streaming(Arc::new(move |stream| handler(stream).boxed())),
        }
    }

    pub fn mode(&self) -> &HandlerMode {
        &self.mode
    }

    pub fn kind(&self) -> CallKind {
        match self.mode {
            HandlerMode::Unary(_) => CallKind::Unary,
            HandlerMode::Streaming(_) => CallKind::Streaming,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.kind() == CallKind::Streaming
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn response_type(&self) -> &'static str {
        self.response_type
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind())
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .finish()
    }
}
