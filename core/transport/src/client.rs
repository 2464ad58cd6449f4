// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! gRPC client for methods served by a registry, addressed by [`ServiceKey`]
//! instead of generated stubs.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use dualgate_dispatch::{Code, Metadata, Payload, ServiceKey, Status, WireFormat};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::codec::RawCodec;
use crate::errors::TransportError;
use crate::grpc::from_tonic;

const STREAM_BUFFER: usize = 16;

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct CallOptions {
    key: ServiceKey,
    metadata: Metadata,
    timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            metadata: Metadata::new(),
            timeout: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    /// Sent as `grpc-timeout`; becomes the server-side call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Absolute deadline for a call starting now.
    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    fn path(&self) -> Result<PathAndQuery, Status> {
        PathAndQuery::try_from(self.key.grpc_path())
            .map_err(|e| Status::invalid_argument(format!("invalid method path: {e}")))
    }

    fn request<T>(&self, message: T) -> Result<tonic::Request<T>, Status> {
        let mut request = tonic::Request::new(message);
        for (key, value) in self.metadata.iter() {
            let name = AsciiMetadataKey::from_bytes(key.as_bytes())
                .map_err(|e| Status::invalid_argument(format!("invalid metadata key {key}: {e}")))?;
            let value = AsciiMetadataValue::try_from(value)
                .map_err(|e| Status::invalid_argument(format!("invalid metadata value for {key}: {e}")))?;
            request.metadata_mut().append(name, value);
        }
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        Ok(request)
    }
}

impl From<ServiceKey> for CallOptions {
    fn from(key: ServiceKey) -> Self {
        CallOptions::new(key)
    }
}

#[derive(Debug, Clone)]
pub struct GrpcClient {
    inner: tonic::client::Grpc<Channel>,
}

impl GrpcClient {
    /// Connects to `endpoint`, given as `host:port` or as a URI.
    pub async fn dial(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        let uri = if endpoint.contains("://") {
            endpoint.clone()
        } else {
            format!("http://{endpoint}")
        };

        let dial_error = |reason: String| TransportError::Dial {
            endpoint: endpoint.clone(),
            reason,
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| dial_error(e.to_string()))?
            .connect()
            .await
            .map_err(|e| dial_error(e.to_string()))?;

        debug!(%endpoint, "connected");
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    pub async fn unary<Req, Resp>(
        &mut self,
        options: impl Into<CallOptions>,
        message: &Req,
    ) -> Result<Resp, Status>
    where
        Req: Payload,
        Resp: Payload,
    {
        let options = options.into();
        let request = options.request(WireFormat::Protobuf.encode(message)?)?;
        let path = options.path()?;
        let deadline = options.deadline();

        let call = async {
            self.ready().await?;
            self.inner
                .unary(request, path, RawCodec)
                .await
                .map_err(from_tonic)
        };
        let response = within(deadline, call).await?;
        WireFormat::Protobuf.decode(response.get_ref())
    }

    /// Opens a bidirectional stream. Messages are sent with
    /// [`ClientStream::send`] and read with [`ClientStream::recv`].
    pub async fn open_stream<Req, Resp>(
        &mut self,
        options: impl Into<CallOptions>,
    ) -> Result<ClientStream<Req, Resp>, Status>
    where
        Req: Payload,
        Resp: Payload,
    {
        let options = options.into();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let request = options.request(ReceiverStream::new(rx))?;
        let path = options.path()?;
        let deadline = options.deadline();

        let call = async {
            self.ready().await?;
            self.inner
                .streaming(request, path, RawCodec)
                .await
                .map_err(from_tonic)
        };
        let response = within(deadline, call).await?;

        Ok(ClientStream {
            tx: Some(tx),
            inbound: response.into_inner(),
            deadline,
            _types: PhantomData,
        })
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("service not ready: {e}")))
    }
}

pub struct ClientStream<Req, Resp> {
    tx: Option<mpsc::Sender<Bytes>>,
    inbound: tonic::Streaming<Bytes>,
    deadline: Option<Instant>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Payload, Resp: Payload> ClientStream<Req, Resp> {
    pub async fn send(&mut self, message: &Req) -> Result<(), Status> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("send side already closed"))?;
        let body = WireFormat::Protobuf.encode(message)?;
        tx.send(body)
            .await
            .map_err(|_| Status::unavailable("stream closed by server"))
    }

    /// Half-closes the stream; the server sees end of input.
    pub fn close_send(&mut self) {
        self.tx.take();
    }

    /// Next server message, `Ok(None)` once the server finished successfully.
    pub async fn recv(&mut self) -> Result<Option<Resp>, Status> {
        let deadline = self.deadline;
        let next = async { self.inbound.message().await.map_err(from_tonic) };
        match within(deadline, next).await? {
            Some(body) => WireFormat::Protobuf.decode(&body).map(Some),
            None => Ok(None),
        }
    }
}

/// Runs `call` until `deadline`. Expiry is reported as `DeadlineExceeded`,
/// including when the channel's own timeout fires first and cancels the call.
async fn within<T, F>(deadline: Option<Instant>, call: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let Some(deadline) = deadline else {
        return call.await;
    };

    match timeout_at(deadline, call).await {
        Ok(Err(status)) if status.code() == Code::Cancelled && Instant::now() >= deadline => {
            Err(deadline_exceeded())
        }
        Ok(res) => res,
        Err(_) => Err(deadline_exceeded()),
    }
}

fn deadline_exceeded() -> Status {
    Status::deadline_exceeded("call deadline exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_options_request() {
        let options = CallOptions::from(ServiceKey::new("webbff", "WebBFF", "Login"))
            .with_metadata("x-trace", "abc")
            .with_metadata("x-trace", "def")
            .with_timeout(Duration::from_secs(2));

        assert_eq!(options.path().unwrap().as_str(), "/webbff.WebBFF/Login");

        let request = options.request(()).unwrap();
        let values: Vec<_> = request
            .metadata()
            .get_all("x-trace")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["abc", "def"]);
        assert!(request.metadata().get("grpc-timeout").is_some());
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let options = CallOptions::new(ServiceKey::new("a", "B", "C")).with_metadata("x-bad", "line\nbreak");
        let err = options.request(()).unwrap_err();
        assert_eq!(err.code(), dualgate_dispatch::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expired_call_reports_deadline_exceeded() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Status>(())
        };
        let err = within(Some(Instant::now() + Duration::from_millis(20)), slow)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        // the channel gave up on its own at the deadline
        let cancelled = async { Err::<(), _>(Status::cancelled("Timeout expired")) };
        let err = within(Some(Instant::now()), cancelled).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        // a cancellation before the deadline keeps its code
        let cancelled = async { Err::<(), _>(Status::cancelled("gone")) };
        let err = within(Some(Instant::now() + Duration::from_secs(5)), cancelled)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);

        assert!(within(None, async { Ok::<_, Status>(7) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let err = GrpcClient::dial("not a uri at all").await.unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }));
    }
}
