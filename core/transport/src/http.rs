// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! HTTP/JSON adapter.
//!
//! Every registered unary method is reachable as `POST` on the configured
//! path template. The body is JSON and the reply is the JSON encoding of the
//! handler's response. Failures carry an error document and a status derived
//! from the RPC code. Streaming methods are refused.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dualgate_dispatch::{
    CallContext, Code, CtxOption, DispatchError, HandlerMode, Metadata, Registry, ServiceKey,
    Status, TransportKind, UnaryChain, UnaryEndpoint, WireFormat, apply_options,
};
use futures::future::BoxFuture;
use http::header::{ALLOW, CONNECTION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::core::{HttpCore, PathParams, PathToKey};
use crate::errors::TransportError;
use crate::module::{Module, Transport};

pub type HttpModule = Module<HttpTransport>;

pub struct HttpTransport;

/// Everything a connection needs, fixed when the module starts.
pub struct HttpState {
    router: matchit::Router<()>,
    path_to_key: PathToKey,
    registry: Arc<Registry>,
    chain: UnaryChain,
    ctx_options: Arc<[CtxOption]>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_body_size: usize,
}

impl Transport for HttpTransport {
    type Core = HttpCore;
    type State = HttpState;

    const NAME: &'static str = "http";

    fn prepare(core: &HttpCore, registry: &Arc<Registry>) -> Result<HttpState, TransportError> {
        let mut router = matchit::Router::new();
        router
            .insert(core.path.clone(), ())
            .map_err(|e| TransportError::InvalidPathTemplate {
                template: core.path.clone(),
                reason: e.to_string(),
            })?;

        Ok(HttpState {
            router,
            path_to_key: core.path_to_key.clone(),
            registry: registry.clone(),
            chain: UnaryChain::new(core.middlewares.clone()),
            ctx_options: core.ctx_options.clone().into(),
            read_timeout: core.read_timeout,
            write_timeout: core.write_timeout,
            max_body_size: core.max_body_size,
        })
    }

    fn serve_connection(
        state: Arc<HttpState>,
        stream: TcpStream,
        peer: SocketAddr,
        watch: drain::Watch,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut builder = http1::Builder::new();
            builder.timer(TokioTimer::new());
            if !state.read_timeout.is_zero() {
                builder.header_read_timeout(state.read_timeout);
            }

            let service = service_fn(move |req| state.clone().handle(req, peer));
            let mut conn = std::pin::pin!(builder.serve_connection(TokioIo::new(stream), service));

            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!(%peer, error = %e, "http connection closed with error");
                    }
                }
                release = watch.signaled() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        debug!(%peer, error = %e, "http connection failed while draining");
                    }
                    drop(release);
                }
            }
        })
    }
}

impl HttpState {
    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, TransportError> {
        if self.write_timeout.is_zero() {
            return Ok(self.dispatch(req, peer).await);
        }

        match tokio::time::timeout(self.write_timeout, self.dispatch(req, peer)).await {
            Ok(resp) => Ok(resp),
            Err(_) => {
                warn!(%peer, timeout = ?self.write_timeout, "response not ready in time, closing connection");
                Err(TransportError::WriteTimeout(self.write_timeout))
            }
        }
    }

    async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        if req.method() != Method::POST {
            let status = Status::unimplemented(format!("method {} not allowed", req.method()));
            let mut resp = error_response(StatusCode::METHOD_NOT_ALLOWED, &status);
            resp.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            return resp;
        }

        let Some(key) = self.route(req.uri().path()) else {
            debug!(path = %req.uri().path(), "no route");
            return status_response(Status::not_found(format!(
                "no route for {}",
                req.uri().path()
            )));
        };

        let endpoint = match self.resolve(&key) {
            Ok(endpoint) => endpoint,
            Err(resp) => return resp,
        };

        let metadata = Metadata::from_headers(req.headers());
        let body = match self.read_body(req.into_body()).await {
            Ok(body) => body,
            Err(resp) => return resp,
        };

        let ctx = CallContext::new(key, TransportKind::Http)
            .with_metadata(metadata)
            .with_peer(peer);
        let ctx = apply_options(ctx, &self.ctx_options);

        let invocation = match endpoint.prepare(&body, WireFormat::Json) {
            Ok(invocation) => invocation,
            Err(status) => return status_response(status),
        };

        let bounds = ctx.clone();
        let reply = bounds
            .bounded(self.chain.call(ctx, invocation))
            .await
            .and_then(|reply| reply.encode(WireFormat::Json));

        match reply {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(status) => status_response(status),
        }
    }

    fn route(&self, path: &str) -> Option<ServiceKey> {
        let matched = self.router.at(path).ok()?;
        let params: PathParams = matched.params.iter().collect();
        (self.path_to_key)(&params)
    }

    fn resolve(&self, key: &ServiceKey) -> Result<Arc<dyn UnaryEndpoint>, Response<Full<Bytes>>> {
        let descriptor = self
            .registry
            .resolve(key)
            .map_err(|e| status_response(e.into()))?;

        match descriptor.mode() {
            HandlerMode::Unary(endpoint) => Ok(endpoint.clone()),
            HandlerMode::Streaming(_) => {
                debug!(method = %key, "streaming method requested over http");
                let err = DispatchError::MethodNotSupported {
                    key: key.clone(),
                    transport: TransportKind::Http,
                };
                // the body is never read, so the connection cannot be reused
                let mut resp = status_response(err.into());
                resp.headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                Err(resp)
            }
        }
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes, Response<Full<Bytes>>> {
        let collect = Limited::new(body, self.max_body_size).collect();
        let collected = if self.read_timeout.is_zero() {
            collect.await
        } else {
            match tokio::time::timeout(self.read_timeout, collect).await {
                Ok(res) => res,
                Err(_) => {
                    let status = Status::deadline_exceeded("request body not received in time");
                    return Err(error_response(StatusCode::REQUEST_TIMEOUT, &status));
                }
            }
        };

        match collected {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let status = Status::resource_exhausted(format!(
                    "request body exceeds {} bytes",
                    self.max_body_size
                ));
                Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, &status))
            }
            Err(e) => {
                let status = Status::invalid_argument(format!("cannot read request body: {e}"));
                Err(error_response(StatusCode::BAD_REQUEST, &status))
            }
        }
    }
}

/// HTTP status for an RPC code.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i32,
    status: &'static str,
    message: &'a str,
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(WireFormat::Json.content_type()),
    );
    resp
}

fn error_response(http_status: StatusCode, status: &Status) -> Response<Full<Bytes>> {
    let body = ErrorBody {
        code: status.code().as_i32(),
        status: status.code().as_str(),
        message: status.message(),
    };
    let body = serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default();
    json_response(http_status, body)
}

fn status_response(status: Status) -> Response<Full<Bytes>> {
    error_response(http_status(status.code()), &status)
}
