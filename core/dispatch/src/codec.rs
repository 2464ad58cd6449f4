// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::DispatchError;
use crate::status::Status;

/// A message type that can travel over both transports: protobuf on the
/// binary transport, JSON over HTTP.
pub trait Payload: prost::Message + Serialize + DeserializeOwned + Default + 'static {}

impl<T> Payload for T where T: prost::Message + Serialize + DeserializeOwned + Default + 'static {}

/// Serialization used on a given transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Json,
    Protobuf,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Protobuf => "application/grpc+proto",
        }
    }

    /// An empty JSON document decodes to the default message, matching what
    /// an empty protobuf buffer decodes to.
    pub fn decode<T: Payload>(&self, buf: &[u8]) -> Result<T, Status> {
        let decoded = match self {
            WireFormat::Json if buf.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
            WireFormat::Json => {
                serde_json::from_slice(buf).map_err(|e| DispatchError::Decode(e.to_string()))
            }
            WireFormat::Protobuf => {
                <T as prost::Message>::decode(buf).map_err(|e| DispatchError::Decode(e.to_string()))
            }
        };
        decoded.map_err(Status::from)
    }

    pub fn encode<T: Payload>(&self, message: &T) -> Result<Bytes, Status> {
        match self {
            WireFormat::Json => serde_json::to_vec(message)
                .map(Bytes::from)
                .map_err(|e| Status::internal(format!("cannot encode response: {e}"))),
            WireFormat::Protobuf => Ok(Bytes::from(message.encode_to_vec())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::Protobuf => f.write_str("protobuf"),
        }
    }
}

trait ErasedPayload: fmt::Debug + Send + Sync {
    fn encode_as(&self, format: WireFormat) -> Result<Bytes, Status>;
}

impl<T: Payload> ErasedPayload for T {
    fn encode_as(&self, format: WireFormat) -> Result<Bytes, Status> {
        format.encode(self)
    }
}

/// Response of a unary handler, already detached from its concrete type so
/// interceptors can pass it along (and log it) without knowing the schema.
#[derive(Debug)]
pub struct Reply(Box<dyn ErasedPayload>);

impl Reply {
    pub fn new<T: Payload>(message: T) -> Self {
        Reply(Box::new(message))
    }

    pub fn encode(&self, format: WireFormat) -> Result<Bytes, Status> {
        self.0.encode_as(format)
    }
}
