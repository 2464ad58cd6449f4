// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Demo services: `webbff.WebBFF/Login` (unary) and
//! `userservice.UserService/LoginGame` (streaming).

use std::time::Duration;

use dualgate_dispatch::{CallContext, DispatchError, Registry, ServerStream, ServiceKey, Status};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const LOGIN_TOKEN: &str = "xxxxxxxx";
pub const GAME_TOKENS: [&str; 3] = ["1234", "12345", "12346"];

const LOGIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginReq {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResp {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginGameReq {
    #[prost(string, tag = "1")]
    pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginGameResp {
    #[prost(string, tag = "1")]
    pub token: String,
}

pub fn login_key() -> ServiceKey {
    ServiceKey::new("webbff", "WebBFF", "Login")
}

pub fn login_game_key() -> ServiceKey {
    ServiceKey::new("userservice", "UserService", "LoginGame")
}

/// Requires the caller's `content-type`; both transports always send one.
pub async fn login(ctx: CallContext, req: LoginReq) -> Result<LoginResp, Status> {
    let ctx = ctx.with_timeout(LOGIN_TIMEOUT);
    let span = ctx.span();

    ctx.bounded(async {
        let content_type = ctx
            .metadata()
            .require("content-type")
            .map_err(|_| Status::not_found("content-type lost"))?;
        info!(parent: &span, content_type, "get content-type");
        info!(parent: &span, name = %req.name, "user try to login");

        Ok(LoginResp {
            token: LOGIN_TOKEN.to_string(),
        })
    })
    .await
}

/// Reads one request and answers with three tokens.
pub async fn login_game(mut stream: ServerStream) -> Result<(), Status> {
    let Some(req) = stream.recv::<LoginGameReq>().await? else {
        return Err(Status::invalid_argument("expected a LoginGameReq"));
    };
    info!(parent: &stream.context().span(), username = %req.username, "user try to login game");

    for token in GAME_TOKENS {
        stream
            .send(&LoginGameResp {
                token: token.to_string(),
            })
            .await?;
    }
    Ok(())
}

pub fn register_demo_handlers(registry: &Registry) -> Result<(), DispatchError> {
    registry.handle_unary(login_key(), login)?;
    registry.listen_stream(login_game_key(), login_game)?;
    Ok(())
}
