// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Transport-agnostic dispatch core.
//!
//! Handlers are registered once in a [`Registry`] under a [`ServiceKey`] and
//! are reachable from every transport. Transports decode the request with the
//! descriptor's [`WireFormat`], build a [`CallContext`], apply their context
//! options and run the call through a [`UnaryChain`] or [`StreamChain`].

pub mod codec;
pub mod context;
pub mod errors;
pub mod handler;
pub mod interceptors;
pub mod key;
pub mod metadata;
pub mod middleware;
pub mod registry;
pub mod status;
pub mod stream;

pub use codec::{Payload, Reply, WireFormat};
pub use context::{
    CallContext, CallSpan, CallSpanOption, ContextOption, CtxOption, TransportKind, apply_options,
};
pub use errors::DispatchError;
pub use handler::{CallKind, HandlerDescriptor, HandlerMode, StreamHandler, UnaryEndpoint, UnaryInvocation};
pub use interceptors::{AccessLog, CallTags, Recovery, Tags};
pub use key::ServiceKey;
pub use metadata::Metadata;
pub use middleware::{
    StreamChain, StreamInterceptor, StreamMiddleware, StreamNext, UnaryChain, UnaryInterceptor,
    UnaryMiddleware, UnaryNext,
};
pub use registry::{HandlerTable, Registry};
pub use status::{Code, Status};
pub use stream::ServerStream;
