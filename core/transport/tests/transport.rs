// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dualgate_dispatch::{
    CallContext, Code, CtxOption, Recovery, Registry, Reply, ServerStream, ServiceKey, Status,
    UnaryInterceptor, UnaryMiddleware, UnaryNext,
};
use dualgate_transport::{CallOptions, GrpcClient, GrpcModule, HttpModule, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_test::traced_test;

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
struct Echo {
    #[prost(string, tag = "1")]
    text: String,
    #[prost(uint32, tag = "2")]
    seq: u32,
}

fn key(method: &str) -> ServiceKey {
    ServiceKey::new("test", "Echo", method)
}

async fn say(ctx: CallContext, req: Echo) -> Result<Echo, Status> {
    let tag = ctx.metadata().get("x-tag").unwrap_or("none").to_string();
    Ok(Echo {
        text: format!("{}:{}:{}", req.text.to_uppercase(), ctx.transport(), tag),
        seq: req.seq + 1,
    })
}

async fn slow(_ctx: CallContext, req: Echo) -> Result<Echo, Status> {
    tokio::time::sleep(Duration::from_millis(u64::from(req.seq))).await;
    Ok(req)
}

/// Reports the server-side time budget in milliseconds, 0 when unbounded.
async fn budget(ctx: CallContext, _req: Echo) -> Result<Echo, Status> {
    let remaining = ctx.remaining_time().map(|d| d.as_millis()).unwrap_or(0);
    Ok(Echo {
        text: String::new(),
        seq: u32::try_from(remaining).unwrap_or(u32::MAX),
    })
}

async fn deny(_ctx: CallContext, _req: Echo) -> Result<Echo, Status> {
    Err(Status::permission_denied("not yours"))
}

async fn boom(_ctx: CallContext, _req: Echo) -> Result<Echo, Status> {
    panic!("handler blew up")
}

async fn echo_stream(mut stream: ServerStream) -> Result<(), Status> {
    let mut seq = 0;
    while let Some(msg) = stream.recv::<Echo>().await? {
        seq += 1;
        stream.send(&Echo { text: msg.text, seq }).await?;
    }
    Ok(())
}

async fn abort_stream(mut stream: ServerStream) -> Result<(), Status> {
    stream
        .send(&Echo {
            text: "partial".to_string(),
            seq: 1,
        })
        .await?;
    Err(Status::new(Code::Aborted, "stopped early"))
}

fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.handle_unary(key("Say"), say).unwrap();
    registry.handle_unary(key("Slow"), slow).unwrap();
    registry.handle_unary(key("Budget"), budget).unwrap();
    registry.handle_unary(key("Deny"), deny).unwrap();
    registry.handle_unary(key("Boom"), boom).unwrap();
    registry.listen_stream(key("Chat"), echo_stream).unwrap();
    registry.listen_stream(key("Abort"), abort_stream).unwrap();
    registry
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_http(
    registry: Arc<Registry>,
    middlewares: Vec<UnaryMiddleware>,
) -> (HttpModule, SocketAddr) {
    let module = HttpModule::new(registry);
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = 0;
    core.max_body_size = 1024;
    core.middlewares = middlewares;
    core.unlock();

    let addr = module.start().await.unwrap().unwrap();
    (module, addr)
}

async fn start_grpc(
    registry: Arc<Registry>,
    middlewares: Vec<UnaryMiddleware>,
) -> (GrpcModule, SocketAddr) {
    let module = GrpcModule::new(registry);
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = 0;
    core.middlewares = middlewares;
    core.unlock();

    let addr = module.start().await.unwrap().unwrap();
    (module, addr)
}

async fn post(addr: SocketAddr, path: &str, body: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .header("content-type", "application/json")
        .header("x-tag", "web")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
#[traced_test]
async fn test_one_handler_serves_both_transports() {
    let registry = registry();
    let (http, http_addr) = start_http(registry.clone(), Vec::new()).await;
    let (grpc, grpc_addr) = start_grpc(registry, Vec::new()).await;

    let (status, body) = post(http_addr, "/test/Echo/Say", r#"{"text":"hi","seq":1}"#).await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "HI:http:web");
    assert_eq!(body["seq"], 2);

    let mut client = GrpcClient::dial(grpc_addr.to_string()).await.unwrap();
    let reply: Echo = client
        .unary(
            CallOptions::new(key("Say")).with_metadata("x-tag", "bin"),
            &Echo {
                text: "hi".to_string(),
                seq: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.text, "HI:grpc:bin");
    assert_eq!(reply.seq, 2);

    assert!(logs_contain("binding service"));
    http.stop().await;
    grpc.stop().await;
}

#[tokio::test]
async fn test_empty_json_body_is_default_message() {
    let (http, addr) = start_http(registry(), Vec::new()).await;
    let (status, body) = post(addr, "/test/Echo/Say", "").await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], ":http:web");
    assert_eq!(body["seq"], 1);
    http.stop().await;
}

#[tokio::test]
async fn test_http_error_mapping() {
    let (http, addr) = start_http(registry(), Vec::new()).await;

    let (status, body) = post(addr, "/test/Echo/Deny", "{}").await;
    assert_eq!(status, 403);
    assert_eq!(body["code"], 7);
    assert_eq!(body["status"], "PERMISSION_DENIED");
    assert_eq!(body["message"], "not yours");

    let (status, body) = post(addr, "/test/Echo/Missing", "{}").await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "NOT_FOUND");

    let (status, _) = post(addr, "/not/routed", "{}").await;
    assert_eq!(status, 404);

    let (status, body) = post(addr, "/test/Echo/Say", "{not json").await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], 3);

    let big = format!(r#"{{"text":"{}"}}"#, "x".repeat(4096));
    let (status, body) = post(addr, "/test/Echo/Say", &big).await;
    assert_eq!(status, 413);
    assert_eq!(body["status"], "RESOURCE_EXHAUSTED");

    let resp = reqwest::get(format!("http://{addr}/test/Echo/Say")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 405);
    assert_eq!(resp.headers()["allow"], "POST");

    http.stop().await;
}

#[tokio::test]
async fn test_streaming_refused_over_http() {
    let (http, addr) = start_http(registry(), Vec::new()).await;
    let (status, body) = post(addr, "/test/Echo/Chat", "{}").await;
    assert_eq!(status, 501);
    assert_eq!(body["status"], "UNIMPLEMENTED");

    // the listener keeps serving
    let (status, _) = post(addr, "/test/Echo/Say", "{}").await;
    assert_eq!(status, 200);
    http.stop().await;
}

#[tokio::test]
async fn test_bidirectional_stream_in_order() {
    let (grpc, addr) = start_grpc(registry(), Vec::new()).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let mut stream = client.open_stream::<Echo, Echo>(key("Chat")).await.unwrap();
    for text in ["a", "b", "c"] {
        stream
            .send(&Echo {
                text: text.to_string(),
                seq: 0,
            })
            .await
            .unwrap();
    }
    stream.close_send();

    let mut got = Vec::new();
    while let Some(msg) = stream.recv().await.unwrap() {
        got.push((msg.text, msg.seq));
    }
    assert_eq!(
        got,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 2),
            ("c".to_string(), 3)
        ]
    );
    grpc.stop().await;
}

#[tokio::test]
async fn test_stream_error_follows_sent_messages() {
    let (grpc, addr) = start_grpc(registry(), Vec::new()).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let mut stream = client.open_stream::<Echo, Echo>(key("Abort")).await.unwrap();
    let first = stream.recv().await.unwrap().unwrap();
    assert_eq!(first.text, "partial");

    let err = stream.recv().await.unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(err.message(), "stopped early");
    grpc.stop().await;
}

#[tokio::test]
async fn test_grpc_errors() {
    let (grpc, addr) = start_grpc(registry(), Vec::new()).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let err = client
        .unary::<Echo, Echo>(key("Deny"), &Echo::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = client
        .unary::<Echo, Echo>(key("Missing"), &Echo::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(err.message().contains("unknown method"));

    let err = client
        .unary::<Echo, Echo>(ServiceKey::new("other", "Svc", "Call"), &Echo::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(err.message().contains("unknown service"));

    // the connection survives failed calls
    let ok: Echo = client.unary(key("Say"), &Echo::default()).await.unwrap();
    assert_eq!(ok.seq, 1);
    grpc.stop().await;
}

#[tokio::test]
async fn test_grpc_timeout_sets_deadline() {
    let (grpc, addr) = start_grpc(registry(), Vec::new()).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let err = client
        .unary::<Echo, Echo>(
            CallOptions::new(key("Slow")).with_timeout(Duration::from_millis(100)),
            &Echo {
                text: String::new(),
                seq: 2_000,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    grpc.stop().await;
}

#[tokio::test]
async fn test_grpc_timeout_reaches_handler() {
    let (grpc, addr) = start_grpc(registry(), Vec::new()).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let bounded: Echo = client
        .unary(
            CallOptions::new(key("Budget")).with_timeout(Duration::from_secs(5)),
            &Echo::default(),
        )
        .await
        .unwrap();
    assert!(bounded.seq > 4_000, "remaining {}ms", bounded.seq);
    assert!(bounded.seq <= 5_000, "remaining {}ms", bounded.seq);

    let unbounded: Echo = client.unary(key("Budget"), &Echo::default()).await.unwrap();
    assert_eq!(unbounded.seq, 0);
    grpc.stop().await;
}

/// Records entry and exit, and rejects calls carrying `x-deny`.
struct Step {
    name: &'static str,
    trail: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl UnaryInterceptor for Step {
    async fn intercept(&self, ctx: CallContext, next: UnaryNext<'_>) -> Result<Reply, Status> {
        self.trail.lock().unwrap().push(format!("{} in", self.name));
        if self.name == "A" && ctx.metadata().contains_key("x-deny") {
            return Err(Status::unauthenticated("denied by A"));
        }
        let res = next.run(ctx).await;
        self.trail.lock().unwrap().push(format!("{} out", self.name));
        res
    }
}

#[tokio::test]
async fn test_middleware_order_over_the_wire() {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let chain = vec![
        Arc::new(Step {
            name: "A",
            trail: trail.clone(),
        }) as UnaryMiddleware,
        Arc::new(Step {
            name: "B",
            trail: trail.clone(),
        }),
    ];
    let (grpc, addr) = start_grpc(registry(), chain).await;
    let mut client = GrpcClient::dial(addr.to_string()).await.unwrap();

    let _: Echo = client.unary(key("Say"), &Echo::default()).await.unwrap();
    assert_eq!(*trail.lock().unwrap(), vec!["A in", "B in", "B out", "A out"]);

    trail.lock().unwrap().clear();
    let err = client
        .unary::<Echo, Echo>(
            CallOptions::new(key("Say")).with_metadata("x-deny", "1"),
            &Echo::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
    assert_eq!(*trail.lock().unwrap(), vec!["A in"]);
    grpc.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_panic_recovered_on_both_transports() {
    let registry = registry();
    let (http, http_addr) = start_http(registry.clone(), vec![Arc::new(Recovery) as UnaryMiddleware]).await;
    let (grpc, grpc_addr) = start_grpc(registry, vec![Arc::new(Recovery) as UnaryMiddleware]).await;

    let (status, body) = post(http_addr, "/test/Echo/Boom", "{}").await;
    assert_eq!(status, 500);
    assert_eq!(body["status"], "INTERNAL");

    let mut client = GrpcClient::dial(grpc_addr.to_string()).await.unwrap();
    let err = client
        .unary::<Echo, Echo>(key("Boom"), &Echo::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // still serving after the panic
    let (status, _) = post(http_addr, "/test/Echo/Say", "{}").await;
    assert_eq!(status, 200);
    assert!(logs_contain("recovered from handler panic"));

    http.stop().await;
    grpc.stop().await;
}

#[derive(Clone)]
struct Tenant(&'static str);

#[tokio::test]
async fn test_context_options_run_before_handler() {
    let registry = Arc::new(Registry::new());
    registry
        .handle_unary(key("Who"), |ctx: CallContext, _req: Echo| async move {
            let tenant = ctx.get::<Tenant>().map(|t| t.0).unwrap_or("unset");
            Ok::<_, Status>(Echo {
                text: tenant.to_string(),
                seq: 0,
            })
        })
        .unwrap();

    let module = HttpModule::new(registry);
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = 0;
    let option: CtxOption = Arc::new(|mut ctx: CallContext| {
        ctx.insert(Tenant("acme"));
        ctx
    });
    core.ctx_options.push(option);
    core.unlock();
    let addr = module.start().await.unwrap().unwrap();

    let (status, body) = post(addr, "/test/Echo/Who", "{}").await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "acme");
    module.stop().await;
}

#[tokio::test]
async fn test_custom_path_template() {
    let module = HttpModule::new(registry());
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = 0;
    core.path = "/rpc/{service}/{method}".to_string();
    core.path_to_key = Arc::new(|params: &dualgate_transport::PathParams| {
        Some(ServiceKey::new("test", params.get("service")?, params.get("method")?))
    });
    core.unlock();
    let addr = module.start().await.unwrap().unwrap();

    let (status, body) = post(addr, "/rpc/Echo/Say", r#"{"text":"x"}"#).await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "X:http:web");
    module.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_restart_drains_in_flight_call() {
    let (http, old_addr) = start_http(registry(), Vec::new()).await;

    let in_flight = tokio::spawn(async move {
        post(old_addr, "/test/Echo/Slow", r#"{"text":"late","seq":400}"#).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut core = http.lock().await;
    core.listen_port = 0;
    core.write_timeout = Duration::from_secs(5);
    core.unlock_and_restart().await.unwrap();

    let (status, body) = in_flight.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["text"], "late");

    let new_addr = http.local_addr().await.unwrap();
    let (status, _) = post(new_addr, "/test/Echo/Say", "{}").await;
    assert_eq!(status, 200);
    if new_addr != old_addr {
        assert!(tokio::net::TcpStream::connect(old_addr).await.is_err());
    }
    assert_eq!(http.snapshot().await.write_timeout, Duration::from_secs(5));
    http.stop().await;
}

#[tokio::test]
async fn test_write_timeout_closes_connection() {
    let module = HttpModule::new(registry());
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = 0;
    core.write_timeout = Duration::from_millis(100);
    core.unlock();
    let addr = module.start().await.unwrap().unwrap();

    let res = reqwest::Client::new()
        .post(format!("http://{addr}/test/Echo/Slow"))
        .body(r#"{"seq":2000}"#)
        .send()
        .await;
    assert!(res.is_err());
    module.stop().await;
}

#[tokio::test]
async fn test_bind_conflict_reports_error() {
    let blocker = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let module = GrpcModule::new(registry());
    let mut core = module.lock().await;
    core.enable = true;
    core.host = LOCALHOST;
    core.listen_port = port;
    core.unlock();

    let err = module.start().await.unwrap_err();
    assert!(matches!(err, TransportError::Bind { transport: "grpc", .. }));
}
