// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::context::TransportKind;
use crate::key::ServiceKey;
use crate::status::Status;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler registered for {0}")]
    NotFound(ServiceKey),
    #[error("handler already registered for {0}")]
    DuplicateRegistration(ServiceKey),
    #[error("invalid service key: {0}")]
    InvalidKey(String),
    #[error("{key} is a streaming method and cannot be called over {transport}")]
    MethodNotSupported {
        key: ServiceKey,
        transport: TransportKind,
    },
    #[error("missing required metadata: {0}")]
    MissingMetadata(String),
    #[error("cannot decode payload: {0}")]
    Decode(String),
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::NotFound(_) => Status::not_found(message),
            DispatchError::DuplicateRegistration(_) => Status::already_exists(message),
            DispatchError::InvalidKey(_) => Status::invalid_argument(message),
            DispatchError::MethodNotSupported { .. } => Status::unimplemented(message),
            DispatchError::MissingMetadata(_) => Status::not_found(message),
            DispatchError::Decode(_) => Status::invalid_argument(message),
            DispatchError::HandlerPanic(_) => Status::internal(message),
        }
    }
}
