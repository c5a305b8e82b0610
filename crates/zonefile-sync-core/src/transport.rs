use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::model::Revision;

/// A key/value pair as stored remotely (prefix still attached).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefixed range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Store revision at which the read was served.
    pub revision: Revision,
}

/// A single mutation delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put(KeyValue),
    Delete { key: String },
}

/// Classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The service is temporarily unavailable; the read may be retried.
    Unavailable,
    Other,
}

/// Error returned by a `KvTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Unavailable
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

/// Batches of watch events in commit order. An `Err` item is terminal.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<Vec<KvEvent>, TransportError>> + Send>>;

/// Raw capability of the remote key-value store.
///
/// Connection management, TLS and RPC framing live behind this trait.
#[async_trait]
pub trait KvTransport: Send + Sync {
    /// Read every key starting with `prefix` in one consistent request.
    async fn range_prefix(&self, prefix: &str) -> Result<RangeResult, TransportError>;

    /// Open a watch on `prefix` delivering mutations with revision >= `start_revision`.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, TransportError>;
}
