// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Extensions;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Span;

use crate::key::ServiceKey;
use crate::metadata::Metadata;
use crate::status::Status;

/// Transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    Grpc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Grpc => "grpc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped state handed to interceptors and handlers.
///
/// Cloning is cheap enough for per-call use and every clone shares the same
/// cancellation token. Extensions can be added but never removed, so whatever
/// a context option attached is visible for the rest of the call.
#[derive(Debug, Clone)]
pub struct CallContext {
    key: ServiceKey,
    transport: TransportKind,
    metadata: Metadata,
    peer: Option<SocketAddr>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    extensions: Extensions,
}

impl CallContext {
    pub fn new(key: ServiceKey, transport: TransportKind) -> Self {
        Self {
            key,
            transport,
            metadata: Metadata::new(),
            peer: None,
            deadline: None,
            cancellation: CancellationToken::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_metadata(self, metadata: Metadata) -> Self {
        Self { metadata, ..self }
    }

    pub fn with_peer(self, peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..self
        }
    }

    /// Sets the deadline unless an earlier one is already in place.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Derives a child context bounded by `timeout`. Cancelling the parent
    /// cancels the child; cancelling the child leaves the parent running.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        };
        child.with_deadline(Instant::now() + timeout)
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel()
    }

    /// Attaches a value for the rest of the call. A value of the same type
    /// attached earlier is shadowed, not removed.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(value);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    /// The call's log span if a [`CallSpan`] option ran, otherwise the
    /// current span.
    pub fn span(&self) -> Span {
        self.get::<CallSpan>()
            .map(|s| s.0.clone())
            .unwrap_or_else(Span::current)
    }

    /// Drives `fut` until it completes, the call is cancelled, or the deadline
    /// passes, whichever happens first.
    pub async fn bounded<F, T>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Status::cancelled("call cancelled")),
            _ = sleep_until(self.deadline) => Err(Status::deadline_exceeded(format!("deadline exceeded for {}", self.key))),
            res = fut => res,
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Per-call hook run before the middleware chain, in registration order.
pub trait ContextOption: Send + Sync {
    fn apply(&self, ctx: CallContext) -> CallContext;
}

impl<F> ContextOption for F
where
    F: Fn(CallContext) -> CallContext + Send + Sync,
{
    fn apply(&self, ctx: CallContext) -> CallContext {
        self(ctx)
    }
}

pub type CtxOption = Arc<dyn ContextOption>;

pub fn apply_options(ctx: CallContext, options: &[CtxOption]) -> CallContext {
    options.iter().fold(ctx, |ctx, option| option.apply(ctx))
}

/// Log handle attached by [`CallSpanOption`].
#[derive(Debug, Clone)]
pub struct CallSpan(pub Span);

/// Context option that opens an `rpc` span per call and attaches it as a
/// [`CallSpan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSpanOption;

impl ContextOption for CallSpanOption {
    fn apply(&self, mut ctx: CallContext) -> CallContext {
        let span = tracing::info_span!(
            "rpc",
            transport = %ctx.transport(),
            service = %ctx.key().service_name(),
            method = %ctx.key().method(),
        );
        ctx.insert(CallSpan(span));
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn ctx() -> CallContext {
        CallContext::new(ServiceKey::new("pkg", "Svc", "Call"), TransportKind::Grpc)
    }

    #[test]
    fn test_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = ctx()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(5)));

        let ctx = ctx.with_deadline(now + Duration::from_secs(1));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_child_cancellation() {
        let parent = ctx();
        let child = parent.with_timeout(Duration::from_secs(3));
        assert!(child.remaining_time().unwrap() <= Duration::from_secs(3));
        assert!(parent.deadline().is_none());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.with_timeout(Duration::from_secs(3));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_options_run_in_order() {
        #[derive(Clone)]
        struct Trail(Vec<&'static str>);

        let first: CtxOption = Arc::new(|mut ctx: CallContext| {
            ctx.insert(Trail(vec!["first"]));
            ctx
        });
        let second: CtxOption = Arc::new(|mut ctx: CallContext| {
            let mut trail = ctx.get::<Trail>().cloned().unwrap_or(Trail(vec![]));
            trail.0.push("second");
            ctx.insert(trail);
            ctx
        });

        let ctx = apply_options(ctx(), &[first, second]);
        assert_eq!(ctx.get::<Trail>().unwrap().0, vec!["first", "second"]);
    }

    #[test]
    fn test_span_option() {
        let ctx = apply_options(ctx(), &[Arc::new(CallSpanOption)]);
        assert!(ctx.get::<CallSpan>().is_some());
        let _ = ctx.span();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_deadline() {
        let ctx = ctx().with_timeout(Duration::from_millis(50));
        let res = ctx
            .bounded(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert_eq!(res.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let ctx = ctx();
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move { token.cancel() });
        let res: Result<(), Status> = ctx.bounded(std::future::pending()).await;
        assert_eq!(res.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_bounded_completes() {
        let res = ctx().bounded(async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
