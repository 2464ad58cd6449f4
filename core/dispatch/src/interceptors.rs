// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Built-in interceptors. Each works on both unary and streaming chains.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::codec::Reply;
use crate::context::CallContext;
use crate::errors::DispatchError;
use crate::middleware::{StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext};
use crate::status::{Code, Status};
use crate::stream::ServerStream;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Turns a panic in any inner layer into an `Internal` status.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recovery;

#[async_trait]
impl UnaryInterceptor for Recovery {
    async fn intercept(&self, ctx: CallContext, next: UnaryNext<'_>) -> Result<Reply, Status> {
        let key = ctx.key().clone();
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(res) => res,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(method = %key, panic = %msg, "recovered from handler panic");
                Err(DispatchError::HandlerPanic(msg).into())
            }
        }
    }
}

#[async_trait]
impl StreamInterceptor for Recovery {
    async fn intercept(&self, stream: ServerStream, next: StreamNext<'_>) -> Result<(), Status> {
        let key = stream.context().key().clone();
        match AssertUnwindSafe(next.run(stream)).catch_unwind().await {
            Ok(res) => res,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(method = %key, panic = %msg, "recovered from stream handler panic");
                Err(DispatchError::HandlerPanic(msg).into())
            }
        }
    }
}

/// Call tags collected by [`CallTags`] and printed by [`AccessLog`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(BTreeMap<&'static str, String>);

impl Tags {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Attaches [`Tags`] describing the call so later layers can log them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallTags;

impl CallTags {
    fn tag(ctx: &mut CallContext) {
        let mut tags = ctx.get::<Tags>().cloned().unwrap_or_default();
        tags.set("transport", ctx.transport().as_str());
        tags.set("service", ctx.key().service_name());
        tags.set("method", ctx.key().method());
        if let Some(peer) = ctx.peer() {
            tags.set("peer.address", peer.to_string());
        }
        if let Some(agent) = ctx.metadata().get("user-agent") {
            tags.set("user_agent", agent);
        }
        ctx.insert(tags);
    }
}

#[async_trait]
impl UnaryInterceptor for CallTags {
    async fn intercept(&self, mut ctx: CallContext, next: UnaryNext<'_>) -> Result<Reply, Status> {
        Self::tag(&mut ctx);
        next.run(ctx).await
    }
}

#[async_trait]
impl StreamInterceptor for CallTags {
    async fn intercept(&self, mut stream: ServerStream, next: StreamNext<'_>) -> Result<(), Status> {
        Self::tag(stream.context_mut());
        next.run(stream).await
    }
}

/// One log line per finished call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

impl AccessLog {
    fn record(ctx: &CallContext, kind: &'static str, started: Instant, code: Code, message: &str) {
        let tags = ctx.get::<Tags>().map(Tags::to_string).unwrap_or_default();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let span = ctx.span();
        if code.is_ok() {
            info!(
                parent: &span,
                transport = %ctx.transport(),
                method = %ctx.key(),
                kind,
                code = %code,
                elapsed_ms,
                tags,
                "finished call"
            );
        } else {
            warn!(
                parent: &span,
                transport = %ctx.transport(),
                method = %ctx.key(),
                kind,
                code = %code,
                elapsed_ms,
                tags,
                error = message,
                "finished call"
            );
        }
    }
}

#[async_trait]
impl UnaryInterceptor for AccessLog {
    async fn intercept(&self, ctx: CallContext, next: UnaryNext<'_>) -> Result<Reply, Status> {
        let started = Instant::now();
        let observed = ctx.clone();
        let res = next.run(ctx).await;
        match &res {
            Ok(_) => Self::record(&observed, "unary", started, Code::Ok, ""),
            Err(status) => Self::record(&observed, "unary", started, status.code(), status.message()),
        }
        res
    }
}

#[async_trait]
impl StreamInterceptor for AccessLog {
    async fn intercept(&self, stream: ServerStream, next: StreamNext<'_>) -> Result<(), Status> {
        let started = Instant::now();
        let observed = stream.context().clone();
        let res = next.run(stream).await;
        match &res {
            Ok(()) => Self::record(&observed, "stream", started, Code::Ok, ""),
            Err(status) => Self::record(&observed, "stream", started, status.code(), status.message()),
        }
        res
    }
}
