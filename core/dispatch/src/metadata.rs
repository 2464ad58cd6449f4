// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use http::HeaderMap;
use tracing::trace;

use crate::errors::DispatchError;

/// Request metadata: HTTP headers or gRPC custom metadata, keyed by the
/// lower-cased name. A key may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every textual header. Binary (`-bin`) and non UTF-8 values are
    /// skipped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut metadata = Self::new();
        for (name, value) in headers {
            if name.as_str().ends_with("-bin") {
                continue;
            }
            match value.to_str() {
                Ok(value) => metadata.append(name.as_str(), value),
                Err(_) => trace!(header = %name, "skipping non-text header value"),
            }
        }
        metadata
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// First value for `key`, or `MissingMetadata` so handlers can `?` it and
    /// pick the status the caller should see.
    pub fn require(&self, key: &str) -> Result<&str, DispatchError> {
        self.get(key)
            .ok_or_else(|| DispatchError::MissingMetadata(key.to_ascii_lowercase()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Replaces all values of `key`.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .entry(key.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All `(key, value)` pairs, keys in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.append(k, v);
        }
        metadata
    }
}
