//! Outgoing call context.
//!
//! A [`CallContext`] carries the metadata a caller wants attached to every
//! call made with it, plus an optional deadline. Dispatch never mutates a
//! context: per-call headers are merged into a copy, so one context can be
//! shared across concurrent calls with different headers.

use crate::{Error, Result};
use core::time::Duration;
use std::collections::HashMap;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};

/// Per-call string headers, sent as ASCII gRPC metadata.
pub type Headers = HashMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: MetadataMap,
    timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from metadata the caller already holds, e.g. the incoming
    /// metadata of a request being proxied.
    pub fn from_metadata(metadata: MetadataMap) -> Self {
        Self {
            metadata,
            timeout: None,
        }
    }

    /// Deadline for calls made with this context, sent as `grpc-timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a header to the context itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] if the key or value is not valid
    /// ASCII metadata.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        let (key, value) = encode(key, value)?;
        self.metadata.insert(key, value);
        Ok(())
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns a copy of the context metadata with `headers` set on it.
    ///
    /// A header replaces any value the context holds under the same key. Keys
    /// are lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] on the first header that cannot be
    /// encoded; the context is left untouched either way.
    pub fn merged_metadata(&self, headers: &Headers) -> Result<MetadataMap> {
        let mut metadata = self.metadata.clone();
        for (key, value) in headers {
            let (key, value) = encode(key, value)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }
}

fn encode(key: &str, value: &str) -> Result<(AsciiMetadataKey, AsciiMetadataValue)> {
    let key = AsciiMetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes()).map_err(|e| {
        Error::InvalidMetadata {
            reason: format!("header `{key}`: {e}"),
        }
    })?;
    let value = AsciiMetadataValue::try_from(value).map_err(|e| Error::InvalidMetadata {
        reason: format!("value of header `{key}`: {e}"),
    })?;
    Ok((key, value))
}
