//! In-memory revisioned key-value store.
//!
//! Behaves like a single-node etcd for the subset of operations the engine
//! uses: every mutation bumps the store revision, range reads are served at
//! the current revision, and watches replay history from any start revision
//! before following live writes. Faults can be injected for range reads and
//! watch streams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::model::Revision;
use crate::transport::{KeyValue, KvEvent, KvTransport, RangeResult, TransportError, WatchStream};

type WatchItem = Result<Vec<KvEvent>, TransportError>;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    data: BTreeMap<String, String>,
    history: Vec<(Revision, KvEvent)>,
    watchers: Vec<Watcher>,
    range_faults: VecDeque<TransportError>,
    watch_fault: Option<TransportError>,
    range_calls: u32,
}

impl Inner {
    fn commit(&mut self, event: KvEvent) {
        self.revision += 1;
        let key = match &event {
            KvEvent::Put(kv) => kv.key.clone(),
            KvEvent::Delete { key } => key.clone(),
        };
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(Ok(vec![event.clone()])).is_ok());
        self.history.push((self.revision, event));
    }
}

/// Revisioned in-memory `KvTransport`.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking writer cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current store revision (0 for an empty store).
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Create or replace `key`, returning the commit revision.
    pub fn put(&self, key: &str, value: &str) -> Revision {
        let mut inner = self.lock();
        inner.data.insert(key.to_string(), value.to_string());
        inner.commit(KvEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        }));
        inner.revision
    }

    /// Remove `key`. Returns the commit revision, or `None` if the key was absent.
    pub fn delete(&self, key: &str) -> Option<Revision> {
        let mut inner = self.lock();
        inner.data.remove(key)?;
        inner.commit(KvEvent::Delete {
            key: key.to_string(),
        });
        Some(inner.revision)
    }

    /// Fail the next range read with `error`. Faults queue up in order.
    pub fn fail_next_range(&self, error: TransportError) {
        self.lock().range_faults.push_back(error);
    }

    /// Refuse every subsequent watch with `error`.
    pub fn fail_watch_open(&self, error: TransportError) {
        self.lock().watch_fault = Some(error);
    }

    /// Deliver `error` to every open watch and end them.
    pub fn abort_watchers(&self, error: TransportError) {
        let mut inner = self.lock();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(error.clone()));
        }
    }

    /// End every open watch cleanly.
    pub fn close_watchers(&self) {
        self.lock().watchers.clear();
    }

    /// Number of watches currently open.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Number of range reads served or failed so far.
    pub fn range_calls(&self) -> u32 {
        self.lock().range_calls
    }
}

#[async_trait]
impl KvTransport for MemoryKv {
    async fn range_prefix(&self, prefix: &str) -> Result<RangeResult, TransportError> {
        let mut inner = self.lock();
        inner.range_calls += 1;
        if let Some(fault) = inner.range_faults.pop_front() {
            return Err(fault);
        }

        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();

        Ok(RangeResult {
            kvs,
            revision: inner.revision,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Revision,
    ) -> Result<WatchStream, TransportError> {
        let mut inner = self.lock();
        if let Some(fault) = inner.watch_fault.clone() {
            return Err(fault);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let replay: Vec<KvEvent> = inner
            .history
            .iter()
            .filter(|(rev, event)| {
                let key = match event {
                    KvEvent::Put(kv) => &kv.key,
                    KvEvent::Delete { key } => key,
                };
                *rev >= start_revision && key.starts_with(prefix)
            })
            .map(|(_, event)| event.clone())
            .collect();

        debug!(
            "Memory watch on {} from revision {} replays {} event(s)",
            prefix,
            start_revision,
            replay.len()
        );
        if !replay.is_empty() {
            let _ = tx.send(Ok(replay));
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_revisions_increase_per_mutation() {
        let kv = MemoryKv::new();
        assert_eq!(kv.revision(), 0);
        assert_eq!(kv.put("/z/a", "1"), 1);
        assert_eq!(kv.put("/z/a", "2"), 2);
        assert_eq!(kv.delete("/z/a"), Some(3));
        assert_eq!(kv.delete("/z/a"), None);
        assert_eq!(kv.revision(), 3);
    }

    #[tokio::test]
    async fn test_range_respects_prefix() {
        let kv = MemoryKv::new();
        kv.put("/z/a", "1");
        kv.put("/z/b", "2");
        kv.put("/zz/c", "3");

        let range = kv.range_prefix("/z/").await.unwrap();
        let keys: Vec<_> = range.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/z/a", "/z/b"]);
        assert_eq!(range.revision, 3);
    }

    #[tokio::test]
    async fn test_range_faults_are_consumed_in_order() {
        let kv = MemoryKv::new();
        kv.fail_next_range(TransportError::unavailable("down"));

        assert!(kv.range_prefix("/z/").await.is_err());
        assert!(kv.range_prefix("/z/").await.is_ok());
        assert_eq!(kv.range_calls(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_from_start_revision() {
        let kv = MemoryKv::new();
        kv.put("/z/a", "1");
        let second = kv.put("/z/b", "2");

        let mut stream = kv.watch_prefix("/z/", second).await.unwrap();
        kv.delete("/z/a");
        kv.close_watchers();

        let mut events = Vec::new();
        while let Some(batch) = stream.next().await {
            events.extend(batch.unwrap());
        }
        assert_eq!(
            events,
            vec![
                KvEvent::Put(KeyValue {
                    key: "/z/b".to_string(),
                    value: "2".to_string()
                }),
                KvEvent::Delete {
                    key: "/z/a".to_string()
                },
            ]
        );
    }
}
