// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Self-exercise loops. Each loop calls one demo method on a fixed interval
//! against the gateway's own listeners, so a running process shows traffic on
//! both transports.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dualgate_dispatch::{Code, Status, WireFormat};
use dualgate_transport::GrpcClient;
use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::demo::{
    GAME_TOKENS, LoginGameReq, LoginGameResp, LoginReq, LoginResp, login_game_key, login_key,
};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExerciseConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for ExerciseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_interval(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(3)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExerciseStats {
    pub ok: u64,
    pub failed: u64,
}

pub struct Exercise {
    token: CancellationToken,
    loops: Vec<(&'static str, JoinHandle<ExerciseStats>)>,
}

impl Exercise {
    /// Starts one loop per reachable demo call. A transport that is not
    /// serving gets no loops.
    pub fn spawn(config: &ExerciseConfig, http: Option<SocketAddr>, grpc: Option<SocketAddr>) -> Self {
        let token = CancellationToken::new();
        let interval = config.interval;
        let mut loops = Vec::new();

        if let Some(addr) = grpc.map(reachable) {
            loops.push((
                "grpc-login",
                tokio::spawn(run_loop("grpc-login", interval, token.child_token(), GrpcLogin::new(addr))),
            ));
            loops.push((
                "grpc-login-game",
                tokio::spawn(run_loop("grpc-login-game", interval, token.child_token(), GrpcLoginGame::new(addr))),
            ));
        }
        if let Some(addr) = http.map(reachable) {
            loops.push((
                "http-login",
                tokio::spawn(run_loop("http-login", interval, token.child_token(), HttpLogin::new(addr))),
            ));
        }

        info!(loops = loops.len(), ?interval, "exercise started");
        Self { token, loops }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Cancels every loop and collects its counters.
    pub async fn stop(self) -> Vec<(&'static str, ExerciseStats)> {
        self.token.cancel();

        let mut stats = Vec::with_capacity(self.loops.len());
        for (name, handle) in self.loops {
            match handle.await {
                Ok(s) => stats.push((name, s)),
                Err(e) => warn!(task = name, error = %e, "exercise loop ended abnormally"),
            }
        }
        stats
    }
}

/// Listeners bound to the unspecified address are dialed on loopback.
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

trait ExerciseCall: Send + 'static {
    fn call(&mut self) -> impl Future<Output = Result<String, Status>> + Send;
}

async fn run_loop<P: ExerciseCall>(
    name: &'static str,
    interval: Duration,
    token: CancellationToken,
    mut target: P,
) -> ExerciseStats {
    let mut stats = ExerciseStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; wait a full interval before calling
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let res = tokio::select! {
            _ = token.cancelled() => break,
            res = target.call() => res,
        };
        match res {
            Ok(outcome) => {
                stats.ok += 1;
                debug!(task = name, %outcome, "exercise call succeeded");
            }
            Err(status) => {
                stats.failed += 1;
                warn!(task = name, code = %status.code(), error = %status.message(), "exercise call failed");
            }
        }
    }

    debug!(task = name, ok = stats.ok, failed = stats.failed, "exercise loop stopped");
    stats
}

/// Dials lazily and drops the client after a transport failure so the next
/// round reconnects.
struct Dialer {
    addr: SocketAddr,
    client: Option<GrpcClient>,
}

impl Dialer {
    fn new(addr: SocketAddr) -> Self {
        Self { addr, client: None }
    }

    async fn client(&mut self) -> Result<GrpcClient, Status> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = GrpcClient::dial(self.addr.to_string())
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn reset_on_unavailable(&mut self, res: &Result<String, Status>) {
        if matches!(res, Err(s) if s.code() == Code::Unavailable) {
            self.client = None;
        }
    }
}

struct GrpcLogin(Dialer);

impl GrpcLogin {
    fn new(addr: SocketAddr) -> Self {
        Self(Dialer::new(addr))
    }

    async fn login(client: &mut GrpcClient) -> Result<String, Status> {
        let req = LoginReq {
            name: "Dan".to_string(),
            password: "p1234567".to_string(),
        };
        let resp: LoginResp = client.unary(login_key(), &req).await?;
        Ok(resp.token)
    }
}

impl ExerciseCall for GrpcLogin {
    async fn call(&mut self) -> Result<String, Status> {
        let mut client = self.0.client().await?;
        let res = Self::login(&mut client).await;
        self.0.reset_on_unavailable(&res);
        res
    }
}

struct GrpcLoginGame(Dialer);

impl GrpcLoginGame {
    fn new(addr: SocketAddr) -> Self {
        Self(Dialer::new(addr))
    }

    async fn login_game(client: &mut GrpcClient) -> Result<String, Status> {
        let mut stream = client
            .open_stream::<LoginGameReq, LoginGameResp>(login_game_key())
            .await?;
        stream
            .send(&LoginGameReq {
                username: "DDDD".to_string(),
            })
            .await?;
        stream.close_send();

        let mut tokens = Vec::new();
        while let Some(resp) = stream.recv().await? {
            tokens.push(resp.token);
        }
        if tokens != GAME_TOKENS {
            return Err(Status::internal(format!("unexpected tokens {tokens:?}")));
        }
        Ok(tokens.join(","))
    }
}

impl ExerciseCall for GrpcLoginGame {
    async fn call(&mut self) -> Result<String, Status> {
        let mut client = self.0.client().await?;
        let res = Self::login_game(&mut client).await;
        self.0.reset_on_unavailable(&res);
        res
    }
}

struct HttpLogin {
    client: reqwest::Client,
    url: String,
}

impl HttpLogin {
    fn new(addr: SocketAddr) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{addr}{}", login_key().http_path()),
        }
    }
}

impl ExerciseCall for HttpLogin {
    async fn call(&mut self) -> Result<String, Status> {
        let resp = self
            .client
            .post(&self.url)
            .json(&LoginReq {
                name: "Dan".to_string(),
                password: "12345678".to_string(),
            })
            .send()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(Status::unknown(format!(
                "http {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let login: LoginResp = WireFormat::Json.decode(&body)?;
        Ok(login.token)
    }
}
