use std::path::PathBuf;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::SyncError;
use crate::local::ZonefileDir;
use crate::model::{ChangeEvent, Revision};
use crate::reconcile;
use crate::store::StoreClient;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// The remote side closed the watch without an error.
    StreamClosed,
    /// The external stop signal was raised.
    Stopped,
    /// The session ended with an error.
    Failed,
}

/// Lifecycle of a `SyncSession`. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Bootstrapping,
    Reconciling,
    Streaming,
    Terminated(TerminationKind),
}

/// Successful end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    StreamClosed,
    Stopped,
}

/// What a session did before it terminated without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Revision of the bootstrap snapshot; streaming resumed right after it.
    pub revision: Revision,
    /// Files written during reconciliation.
    pub bootstrap_upserts: usize,
    /// Files removed during reconciliation.
    pub bootstrap_deletions: usize,
    /// Change events applied while streaming.
    pub events_applied: u64,
    pub termination: Termination,
}

/// One synchronisation session: bootstrap, reconcile, then follow the change stream.
///
/// The session never restarts itself. Whoever owns the process decides
/// whether to start a new one after it terminates.
pub struct SyncSession {
    store: StoreClient,
    prefix: String,
    directory: PathBuf,
    state: watch::Sender<SessionState>,
}

impl SyncSession {
    pub fn new(store: StoreClient, prefix: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(SessionState::Bootstrapping);
        Self {
            store,
            prefix: prefix.into(),
            directory: directory.into(),
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        debug!("Session state -> {:?}", next);
        self.state.send_replace(next);
    }

    /// Run the session to completion.
    ///
    /// `shutdown` is the external stop signal: once it reads `true`, no new
    /// change event is applied. An apply already in progress completes.
    #[instrument(skip_all, fields(prefix = %self.prefix, directory = %self.directory.display()))]
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<SessionSummary, SyncError> {
        let result = self.drive(shutdown).await;
        let kind = match &result {
            Ok(summary) => match summary.termination {
                Termination::StreamClosed => TerminationKind::StreamClosed,
                Termination::Stopped => TerminationKind::Stopped,
            },
            Err(e) => {
                error!("Zonefile synchronisation failed: {}", e);
                TerminationKind::Failed
            }
        };
        self.transition(SessionState::Terminated(kind));
        result
    }

    async fn drive(&self, mut shutdown: watch::Receiver<bool>) -> Result<SessionSummary, SyncError> {
        self.transition(SessionState::Bootstrapping);
        let dir = ZonefileDir::claim(&self.directory).await?;
        // Stop is honoured while the snapshot or its retry wait is pending.
        let snapshot = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => {
                info!("Stop requested before the snapshot completed");
                return Ok(SessionSummary {
                    revision: 0,
                    bootstrap_upserts: 0,
                    bootstrap_deletions: 0,
                    events_applied: 0,
                    termination: Termination::Stopped,
                });
            }
            snapshot = self.store.snapshot(&self.prefix) => snapshot?,
        };
        info!(
            "Fetched {} zonefile(s) at revision {}",
            snapshot.records.len(),
            snapshot.revision
        );

        let mut summary = SessionSummary {
            revision: snapshot.revision,
            bootstrap_upserts: 0,
            bootstrap_deletions: 0,
            events_applied: 0,
            termination: Termination::Stopped,
        };
        if *shutdown.borrow() {
            return Ok(summary);
        }

        self.transition(SessionState::Reconciling);
        let local = dir.list().await?;
        let deletions = reconcile::deletions_for(&snapshot.records, &local);
        dir.apply_batch(&snapshot.records, &deletions).await?;
        summary.bootstrap_upserts = snapshot.records.len();
        summary.bootstrap_deletions = deletions.len();
        info!(
            "Reconciled {}: {} upserted, {} deleted",
            dir.path().display(),
            summary.bootstrap_upserts,
            summary.bootstrap_deletions
        );
        if *shutdown.borrow() {
            return Ok(summary);
        }

        self.transition(SessionState::Streaming);
        let mut events = self.store.watch(&self.prefix, snapshot.revision);
        info!("Streaming changes after revision {}", snapshot.revision);

        loop {
            let event = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => {
                    events.close();
                    info!("Stop requested, {} change(s) applied", summary.events_applied);
                    summary.termination = Termination::Stopped;
                    return Ok(summary);
                }
                event = events.next_event() => event,
            };

            match event {
                None => {
                    info!("Change stream closed, {} change(s) applied", summary.events_applied);
                    summary.termination = Termination::StreamClosed;
                    return Ok(summary);
                }
                Some(ChangeEvent::Failed(e)) => return Err(e),
                Some(ChangeEvent::Upsert(record)) => {
                    dir.write(&record.key, &record.content).await?;
                }
                Some(ChangeEvent::Delete(key)) => {
                    dir.delete(&key).await?;
                }
            }
            summary.events_applied += 1;
        }
    }
}

/// Resolves once the stop flag is raised. Never resolves if the signal owner is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|&stop| stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use crate::transport::{KvTransport, RangeResult, TransportError, WatchStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Transport whose range reads never complete.
    #[derive(Default)]
    struct StalledTransport {
        range_calls: AtomicU32,
    }

    #[async_trait]
    impl KvTransport for StalledTransport {
        async fn range_prefix(&self, _prefix: &str) -> Result<RangeResult, TransportError> {
            self.range_calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn watch_prefix(
            &self,
            _prefix: &str,
            _start_revision: Revision,
        ) -> Result<WatchStream, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_snapshot_failure_terminates_with_error() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.fail_next_range(TransportError::other("auth failed"));

        let session = SyncSession::new(StoreClient::new(kv), "/zones/", temp_dir.path().join("z"));
        let states = session.subscribe_state();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = session.run(stop_rx).await.unwrap_err();

        assert!(matches!(err, SyncError::Snapshot { .. }));
        assert_eq!(
            *states.borrow(),
            SessionState::Terminated(TerminationKind::Failed)
        );
        // Directory was still ensured before the snapshot
        assert!(temp_dir.path().join("z").is_dir());
    }

    #[tokio::test]
    async fn test_stop_before_streaming() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.put("/zones/a.zone", "X");

        let session = SyncSession::new(StoreClient::new(kv.clone()), "/zones/", temp_dir.path());
        let states = session.subscribe_state();
        let (_stop_tx, stop_rx) = watch::channel(true);

        let summary = session.run(stop_rx).await.unwrap();

        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(
            *states.borrow(),
            SessionState::Terminated(TerminationKind::Stopped)
        );
        assert!(!temp_dir.path().join("a.zone").exists());
        // Stop was already raised, so the store is never read
        assert_eq!(kv.range_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let transport = Arc::new(StalledTransport::default());

        let session = SyncSession::new(
            StoreClient::new(transport.clone()),
            "/zones/",
            temp_dir.path(),
        );
        let states = session.subscribe_state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(stop_rx));

        while transport.range_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not stop during the snapshot")
            .unwrap()
            .unwrap();
        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(summary.revision, 0);
        assert_eq!(
            *states.borrow(),
            SessionState::Terminated(TerminationKind::Stopped)
        );
    }

    #[tokio::test]
    async fn test_stop_interrupts_snapshot_retry_wait() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.fail_next_range(TransportError::unavailable("etcdserver: unavailable"));

        let store = StoreClient::new(kv.clone())
            .with_retry(crate::store::RetryPolicy::new(3, Duration::from_secs(3600)));
        let session = SyncSession::new(store, "/zones/", temp_dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(session.run(stop_rx));

        while kv.range_calls() == 0 {
            tokio::task::yield_now().await;
        }
        stop_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not stop during the retry wait")
            .unwrap()
            .unwrap();
        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(kv.range_calls(), 1);
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_does_not_stop_session() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(MemoryKv::new());
        kv.put("/zones/a.zone", "X");

        let session = SyncSession::new(StoreClient::new(kv.clone()), "/zones/", temp_dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        let handle = tokio::spawn(session.run(stop_rx));
        while kv.range_calls() == 0 {
            tokio::task::yield_now().await;
        }
        kv.put("/zones/b.zone", "Y");
        kv.close_watchers();

        // Closing may race the watch being opened; keep closing until the session ends.
        let summary = loop {
            if handle.is_finished() {
                break handle.await.unwrap().unwrap();
            }
            kv.close_watchers();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(summary.termination, Termination::StreamClosed);
        assert!(temp_dir.path().join("b.zone").exists());
    }
}
