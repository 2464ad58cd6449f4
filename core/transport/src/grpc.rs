// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Binary gRPC adapter.
//!
//! The registry is snapshot when the module starts and grouped into one bound
//! service per `package.Service`. Each call is routed on its `/pkg.Svc/Method`
//! path and framed by tonic with [`RawCodec`], so the message bytes reach the
//! dispatch layer untouched.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dualgate_dispatch::{
    CallContext, Code, CtxOption, HandlerMode, HandlerTable, Metadata, Registry, ServerStream,
    ServiceKey, Status, StreamChain, StreamHandler, TransportKind, UnaryChain, UnaryEndpoint,
    WireFormat, apply_options,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::server::{Grpc, StreamingService, UnaryService};
use tracing::{Instrument, debug, error, info};

use crate::codec::RawCodec;
use crate::core::GrpcCore;
use crate::errors::TransportError;
use crate::module::{Module, Transport};

pub type GrpcModule = Module<GrpcTransport>;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
const STREAM_BUFFER: usize = 16;

pub struct GrpcTransport;

pub struct GrpcState {
    table: Arc<HandlerTable>,
    services: BTreeMap<String, Vec<String>>,
    unary: UnaryChain,
    stream: StreamChain,
    ctx_options: Arc<[CtxOption]>,
    max_concurrent_streams: Option<u32>,
    keepalive_interval: Option<Duration>,
    keepalive_timeout: Duration,
}

impl GrpcState {
    /// Bound service names with their method names, sorted.
    pub fn services(&self) -> &BTreeMap<String, Vec<String>> {
        &self.services
    }
}

impl Transport for GrpcTransport {
    type Core = GrpcCore;
    type State = GrpcState;

    const NAME: &'static str = "grpc";

    fn prepare(core: &GrpcCore, registry: &Arc<Registry>) -> Result<GrpcState, TransportError> {
        let table = registry.snapshot();

        let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in table.keys() {
            services
                .entry(key.service_name())
                .or_default()
                .push(key.method().to_string());
        }
        for (service, methods) in services.iter_mut() {
            methods.sort();
            info!(service = %service, methods = ?methods, "binding service");
        }

        Ok(GrpcState {
            table,
            services,
            unary: UnaryChain::new(core.middlewares.clone()),
            stream: StreamChain::new(core.stream_middlewares.clone()),
            ctx_options: core.ctx_options.clone().into(),
            max_concurrent_streams: core.max_concurrent_streams,
            keepalive_interval: core.keepalive_interval,
            keepalive_timeout: core.keepalive_timeout,
        })
    }

    fn serve_connection(
        state: Arc<GrpcState>,
        stream: TcpStream,
        peer: SocketAddr,
        watch: drain::Watch,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder
                .timer(TokioTimer::new())
                .max_concurrent_streams(state.max_concurrent_streams)
                .keep_alive_interval(state.keepalive_interval)
                .keep_alive_timeout(state.keepalive_timeout);

            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(state.dispatch(req, peer).await) }
            });
            let mut conn = std::pin::pin!(builder.serve_connection(TokioIo::new(stream), service));

            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!(%peer, error = %e, "grpc connection closed with error");
                    }
                }
                release = watch.signaled() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        debug!(%peer, error = %e, "grpc connection failed while draining");
                    }
                    drop(release);
                }
            }
        })
    }
}

impl GrpcState {
    async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<tonic::body::Body> {
        let Some(key) = ServiceKey::from_grpc_path(req.uri().path()) else {
            debug!(path = %req.uri().path(), "malformed grpc path");
            return error_response(Status::not_found(format!(
                "unknown path {}",
                req.uri().path()
            )));
        };

        let Some(descriptor) = self.table.get(&key).cloned() else {
            let service = key.service_name();
            let message = if self.services.contains_key(&service) {
                format!("unknown method {} for service {}", key.method(), service)
            } else {
                format!("unknown service {service}")
            };
            debug!(method = %key, "{message}");
            return error_response(Status::not_found(message));
        };

        let mut ctx = CallContext::new(key, TransportKind::Grpc)
            .with_metadata(Metadata::from_headers(req.headers()))
            .with_peer(peer);
        if let Some(timeout) = req
            .headers()
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
        {
            ctx = ctx.with_deadline(Instant::now() + timeout);
        }
        let ctx = apply_options(ctx, &self.ctx_options);

        match descriptor.mode() {
            HandlerMode::Unary(endpoint) => {
                let call = UnaryDispatch {
                    endpoint: endpoint.clone(),
                    chain: self.unary.clone(),
                    ctx,
                };
                Grpc::new(RawCodec).unary(call, req).await
            }
            HandlerMode::Streaming(handler) => {
                let call = StreamDispatch {
                    handler: handler.clone(),
                    chain: self.stream.clone(),
                    ctx,
                };
                Grpc::new(RawCodec).streaming(call, req).await
            }
        }
    }
}

struct UnaryDispatch {
    endpoint: Arc<dyn UnaryEndpoint>,
    chain: UnaryChain,
    ctx: CallContext,
}

impl UnaryService<Bytes> for UnaryDispatch {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<tonic::Response<Bytes>, tonic::Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let endpoint = self.endpoint.clone();
        let chain = self.chain.clone();
        let ctx = self.ctx.clone();

        Box::pin(async move {
            let invocation = endpoint
                .prepare(request.get_ref(), WireFormat::Protobuf)
                .map_err(into_tonic)?;

            let bounds = ctx.clone();
            let reply = bounds
                .bounded(chain.call(ctx, invocation))
                .await
                .and_then(|reply| reply.encode(WireFormat::Protobuf))
                .map_err(into_tonic)?;

            Ok(tonic::Response::new(reply))
        })
    }
}

struct StreamDispatch {
    handler: StreamHandler,
    chain: StreamChain,
    ctx: CallContext,
}

impl StreamingService<Bytes> for StreamDispatch {
    type Response = Bytes;
    type ResponseStream = BoxStream<'static, Result<Bytes, tonic::Status>>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, tonic::Status>>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<Bytes>>) -> Self::Future {
        let handler = self.handler.clone();
        let chain = self.chain.clone();
        let ctx = self.ctx.clone();

        Box::pin(async move {
            let inbound = request
                .into_inner()
                .map(|item| item.map_err(from_tonic))
                .boxed();

            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            let terminal = tx.clone();
            let key = ctx.key().clone();
            let stream = ServerStream::new(ctx, inbound, tx, WireFormat::Protobuf);

            let task =
                tokio::spawn(async move { chain.call(stream, handler).await }.in_current_span());
            let watcher = async move {
                let res = match task.await {
                    Ok(res) => res,
                    Err(e) => {
                        error!(method = %key, error = %e, "stream handler task failed");
                        Err(Status::internal("stream handler failed"))
                    }
                };
                // the handler's messages are all queued; the error is the trailer
                if let Err(status) = res {
                    let _ = terminal.send(Err(status)).await;
                }
            };
            tokio::spawn(watcher.in_current_span());

            let outbound = ReceiverStream::new(rx)
                .map(|item| item.map_err(into_tonic))
                .boxed();
            Ok(tonic::Response::new(outbound))
        })
    }
}

/// Decodes a `grpc-timeout` header value: at most eight digits followed by
/// one of `H`, `M`, `S`, `m`, `u` or `n`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 60 * 60)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

pub fn into_tonic(status: Status) -> tonic::Status {
    tonic::Status::new(
        tonic::Code::from_i32(status.code().as_i32()),
        status.message().to_string(),
    )
}

pub fn from_tonic(status: tonic::Status) -> Status {
    let code = Code::from_i32(status.code() as i32).unwrap_or(Code::Unknown);
    Status::new(code, status.message())
}

fn error_response(status: Status) -> Response<tonic::body::Body> {
    let mut resp = Response::new(tonic::body::Body::default());
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(e) = into_tonic(status).add_header(resp.headers_mut()) {
        debug!(error = %e, "cannot encode grpc status headers");
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5u"), Some(Duration::from_micros(5)));
        assert_eq!(parse_grpc_timeout("7n"), Some(Duration::from_nanos(7)));

        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
        assert_eq!(parse_grpc_timeout("1é"), None);
    }

    #[test]
    fn test_status_conversion() {
        let status = into_tonic(Status::not_found("content-type lost"));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "content-type lost");

        let back = from_tonic(tonic::Status::unimplemented("nope"));
        assert_eq!(back.code(), Code::Unimplemented);
        assert_eq!(back.message(), "nope");
    }

    #[test]
    fn test_services_grouped_from_snapshot() {
        let registry = Arc::new(Registry::new());
        for key in [
            ServiceKey::new("webbff", "WebBFF", "LoginGame"),
            ServiceKey::new("webbff", "WebBFF", "Login"),
            ServiceKey::new("ops", "Health", "Check"),
        ] {
            registry.listen_stream(key, |_stream| async { Ok(()) }).unwrap();
        }

        let state = GrpcTransport::prepare(&GrpcCore::default(), &registry).unwrap();
        assert_eq!(state.services().len(), 2);
        assert_eq!(
            state.services()["webbff.WebBFF"],
            vec!["Login".to_string(), "LoginGame".to_string()]
        );

        // later registrations are not served until the module restarts
        registry
            .listen_stream(ServiceKey::new("ops", "Health", "Watch"), |_stream| async { Ok(()) })
            .unwrap();
        assert_eq!(state.services()["ops.Health"], vec!["Check".to_string()]);
    }

    #[test]
    fn test_error_response_headers() {
        let resp = error_response(Status::not_found("unknown service x.Y"));
        assert_eq!(resp.headers().get("grpc-status").unwrap(), "5");
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/grpc");
    }
}
