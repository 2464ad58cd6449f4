// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::errors::DispatchError;

/// Logical endpoint identifier shared by both transports.
///
/// Components are kept exactly as given and compared case-sensitively, so
/// `webbff/WebBFF/Login` and `webbff/webbff/login` are different keys. The
/// package may be dotted (`acme.billing`); service and method may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    package: String,
    service: String,
    method: String,
}

impl ServiceKey {
    pub fn new(
        package: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Fully qualified service name, `package.Service`.
    pub fn service_name(&self) -> String {
        format!("{}.{}", self.package, self.service)
    }

    /// Binary-RPC request path, `/package.Service/Method`.
    pub fn grpc_path(&self) -> String {
        format!("/{}.{}/{}", self.package, self.service, self.method)
    }

    /// HTTP request path for the default template, `/package/Service/Method`.
    pub fn http_path(&self) -> String {
        format!("/{}/{}/{}", self.package, self.service, self.method)
    }

    /// Parses `/package.Service/Method`. The service is everything after the
    /// last dot of the first segment.
    pub fn from_grpc_path(path: &str) -> Option<Self> {
        let (qualified, method) = path.strip_prefix('/')?.split_once('/')?;
        let (package, service) = qualified.rsplit_once('.')?;
        let key = Self::new(package, service, method);
        key.validate().ok().map(|_| key)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let parts = [
            ("package", &self.package),
            ("service", &self.service),
            ("method", &self.method),
        ];
        for (name, value) in parts {
            if value.is_empty() {
                return Err(DispatchError::InvalidKey(format!("empty {name}")));
            }
            if value.contains('/') || value.chars().any(char::is_whitespace) {
                return Err(DispatchError::InvalidKey(format!(
                    "{name} {value:?} contains a separator"
                )));
            }
        }
        if self.service.contains('.') || self.method.contains('.') {
            return Err(DispatchError::InvalidKey(format!(
                "service and method must not contain dots: {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.package, self.service, self.method)
    }
}
