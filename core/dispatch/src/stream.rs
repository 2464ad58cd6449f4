// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::codec::{Payload, WireFormat};
use crate::context::{CallContext, sleep_until};
use crate::status::Status;

/// Bidirectional message stream handed to a streaming handler.
///
/// Every `recv`/`send` also watches the call's cancellation token, its
/// deadline, and the peer going away, and returns `Cancelled` or
/// `DeadlineExceeded` as soon as one fires. Handlers should stop using the
/// stream after such an error.
pub struct ServerStream {
    ctx: CallContext,
    inbound: BoxStream<'static, Result<Bytes, Status>>,
    outbound: mpsc::Sender<Result<Bytes, Status>>,
    format: WireFormat,
}

impl ServerStream {
    pub fn new(
        ctx: CallContext,
        inbound: BoxStream<'static, Result<Bytes, Status>>,
        outbound: mpsc::Sender<Result<Bytes, Status>>,
        format: WireFormat,
    ) -> Self {
        Self {
            ctx,
            inbound,
            outbound,
            format,
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    /// Next message from the client, `Ok(None)` once the client closed its
    /// side.
    pub async fn recv<T: Payload>(&mut self) -> Result<Option<T>, Status> {
        let next = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => return Err(Status::cancelled("call cancelled")),
            _ = sleep_until(self.ctx.deadline()) => return Err(self.deadline_status()),
            _ = self.outbound.closed() => return Err(Status::cancelled("client went away")),
            next = self.inbound.next() => next,
        };

        match next {
            None => Ok(None),
            Some(Err(status)) => Err(status),
            Some(Ok(buf)) => self.format.decode(&buf).map(Some),
        }
    }

    /// Sends one message. Messages reach the client in the order sent.
    pub async fn send<T: Payload>(&mut self, message: &T) -> Result<(), Status> {
        let buf = self.format.encode(message)?;
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(Status::cancelled("call cancelled")),
            _ = sleep_until(self.ctx.deadline()) => Err(self.deadline_status()),
            res = self.outbound.send(Ok(buf)) => {
                res.map_err(|_| Status::cancelled("client went away"))
            }
        }
    }

    fn deadline_status(&self) -> Status {
        Status::deadline_exceeded(format!("deadline exceeded for {}", self.ctx.key()))
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("key", self.ctx.key())
            .field("format", &self.format)
            .finish()
    }
}
