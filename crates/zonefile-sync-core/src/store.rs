use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::SyncError;
use crate::model::{ChangeEvent, Revision, Snapshot, ZonefileRecord};
use crate::transport::{KvEvent, KvTransport, RangeResult, TransportError};

/// Default delay between snapshot attempts.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 100;

/// Retry budget for snapshot reads that hit a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Fixed wait between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

/// Client over a `KvTransport` that knows about zone file keys.
///
/// Snapshots are retried on transient unavailability; watch streams never are,
/// since reconnecting at an unknown point would break ordering.
#[derive(Clone)]
pub struct StoreClient {
    transport: Arc<dyn KvTransport>,
    retry: RetryPolicy,
    request_timeout: Option<Duration>,
    channel_capacity: usize,
}

impl StoreClient {
    pub fn new(transport: Arc<dyn KvTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            request_timeout: None,
            channel_capacity: 1,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound each snapshot attempt. `None` waits indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Capacity of the queue between the watch producer and the consumer (min 1).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    async fn range_once(&self, prefix: &str) -> Result<RangeResult, TransportError> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.range_prefix(prefix))
                .await
                .map_err(|_| {
                    TransportError::other(format!(
                        "request timed out after {} ms",
                        limit.as_millis()
                    ))
                })?,
            None => self.transport.range_prefix(prefix).await,
        }
    }

    /// Read all zone files under `prefix` along with the revision of the read.
    ///
    /// Keys are returned with `prefix` stripped.
    #[instrument(skip(self), level = "debug")]
    pub async fn snapshot(&self, prefix: &str) -> Result<Snapshot, SyncError> {
        let mut attempts: u32 = 0;

        let range = loop {
            attempts += 1;
            match self.range_once(prefix).await {
                Ok(range) => break range,
                Err(e) if e.is_transient() && attempts <= self.retry.retries => {
                    warn!(
                        attempt = attempts,
                        retries = self.retry.retries,
                        delay_ms = self.retry.interval.as_millis() as u64,
                        "Store unavailable, retrying snapshot: {}",
                        e
                    );
                    tokio::time::sleep(self.retry.interval).await;
                }
                Err(e) => {
                    return Err(SyncError::Snapshot {
                        attempts,
                        message: e.message,
                    })
                }
            }
        };

        let records = range
            .kvs
            .into_iter()
            .map(|kv| (strip_key(prefix, &kv.key), kv.value))
            .collect();

        debug!(
            "Snapshot of {} at revision {} after {} attempt(s)",
            prefix, range.revision, attempts
        );

        Ok(Snapshot {
            records,
            revision: range.revision,
        })
    }

    /// Stream every mutation under `prefix` committed after `from_revision`.
    ///
    /// The returned stream ends after the first `ChangeEvent::Failed`, or
    /// cleanly if the remote side closes the watch.
    pub fn watch(&self, prefix: &str, from_revision: Revision) -> ChangeStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let transport = Arc::clone(&self.transport);
        let prefix = prefix.to_string();

        let producer = tokio::spawn(async move {
            let mut batches = match transport.watch_prefix(&prefix, from_revision + 1).await {
                Ok(batches) => batches,
                Err(e) => {
                    let _ = tx
                        .send(ChangeEvent::Failed(SyncError::Watch(format!(
                            "Watcher could not be established: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };
            debug!("Watching {} from revision {}", prefix, from_revision + 1);

            while let Some(batch) = batches.next().await {
                let events = match batch {
                    Ok(events) => events,
                    Err(e) => {
                        let _ = tx
                            .send(ChangeEvent::Failed(SyncError::Watch(e.message)))
                            .await;
                        return;
                    }
                };

                for event in events {
                    let change = match event {
                        KvEvent::Put(kv) => ChangeEvent::Upsert(ZonefileRecord {
                            key: strip_key(&prefix, &kv.key),
                            content: kv.value,
                        }),
                        KvEvent::Delete { key } => ChangeEvent::Delete(strip_key(&prefix, &key)),
                    };
                    // Consumer gone: the session is over.
                    if tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
            debug!("Watch on {} closed by remote", prefix);
        });

        ChangeStream { rx, producer }
    }
}

fn strip_key(prefix: &str, key: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}

/// Ordered, non-restartable sequence of change events.
///
/// Dropping it cancels the underlying watch.
pub struct ChangeStream {
    rx: mpsc::Receiver<ChangeEvent>,
    producer: JoinHandle<()>,
}

impl ChangeStream {
    /// Receive the next event; `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Stop the producer and drop any queued events.
    pub fn close(&mut self) {
        self.producer.abort();
        self.rx.close();
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
