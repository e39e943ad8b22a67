use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::files::api::FileRecord;

use super::registry::{DeltaOutcome, StateReconciler};
use super::snapshot::{
    FetchOutcome, FetchReason, SnapshotFetcher, SnapshotSource, DEFAULT_REPAIR_COOLDOWN,
};
use super::stream::{ConnectionIndicator, Connector, EventStreamClient, StreamEvent};

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub repair_cooldown: Duration,
}

impl SessionConfig {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            repair_cooldown: DEFAULT_REPAIR_COOLDOWN,
        }
    }
}

/// Work riding along with the session whose result may announce a new file
/// (the single-shot upload receipt).
pub type Announcement = BoxFuture<'static, Option<FileRecord>>;

/// One synchronization session: stream, poller and registry driven from a
/// single task.
pub struct SyncSession<C: Connector, S: SnapshotSource> {
    stream: EventStreamClient<C>,
    fetcher: SnapshotFetcher<S>,
    reconciler: StateReconciler,
    registry: watch::Sender<Vec<FileRecord>>,
    announcement: Option<Announcement>,
}

enum Step {
    Shutdown,
    Stream(StreamEvent),
    Snapshot(FetchOutcome),
    Announced(Option<FileRecord>),
}

impl<C: Connector, S: SnapshotSource> SyncSession<C, S> {
    /// Must be called from within a tokio runtime.
    pub fn new(connector: C, source: S, config: SessionConfig) -> Self {
        let (registry, _) = watch::channel(Vec::new());
        Self {
            stream: EventStreamClient::new(connector),
            fetcher: SnapshotFetcher::new(source, config.poll_interval, config.repair_cooldown),
            reconciler: StateReconciler::new(),
            registry,
            announcement: None,
        }
    }

    /// Read-only view of the registry, republished after every mutation.
    pub fn registry(&self) -> watch::Receiver<Vec<FileRecord>> {
        self.registry.subscribe()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionIndicator> {
        self.stream.subscribe()
    }

    pub fn attach(&mut self, announcement: Announcement) {
        self.announcement = Some(announcement);
    }

    /// Run until `shutdown` resolves, then tear the channel down. The session
    /// is consumed so the watch senders close once it returns.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Vec<FileRecord> {
        tokio::pin!(shutdown);
        self.stream.connect();

        loop {
            let step = {
                let stream = &mut self.stream;
                let fetcher = &mut self.fetcher;
                let announcement = &mut self.announcement;
                let announcing = announcement.is_some();
                tokio::select! {
                    biased;
                    _ = &mut shutdown => Step::Shutdown,
                    event = stream.next_event() => Step::Stream(event),
                    outcome = fetcher.next_outcome() => Step::Snapshot(outcome),
                    record = wait_announcement(announcement), if announcing => Step::Announced(record),
                }
            };

            match step {
                Step::Shutdown => break,
                Step::Stream(event) => self.on_stream_event(event),
                Step::Snapshot(outcome) => self.on_snapshot(outcome),
                Step::Announced(record) => {
                    self.announcement = None;
                    if let Some(record) = record {
                        debug!(file_id = %record.id, "announcing uploaded file");
                        if self.reconciler.announce(record) {
                            self.publish();
                        }
                    }
                }
            }
        }

        self.stream.teardown().await;
        self.reconciler.records()
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Delta(delta) => match self.reconciler.apply_delta(delta) {
                DeltaOutcome::Updated => self.publish(),
                DeltaOutcome::NeedsRepair => {
                    self.publish();
                    if self.fetcher.is_fetching() {
                        debug!("repair queued behind the snapshot in flight");
                    }
                    self.fetcher.request_repair();
                }
                DeltaOutcome::Unchanged | DeltaOutcome::Rejected(_) => {}
            },
            // Deltas sent while we were away are lost; catch up through the
            // repair path instead of waiting for the next tick.
            StreamEvent::Opened { reconnected: true } => self.fetcher.request_repair(),
            StreamEvent::Opened { reconnected: false } => {}
            StreamEvent::Closed { retry_in } => debug!(
                state = ?self.stream.state(),
                retries = self.stream.retry_count(),
                last_error = self.stream.last_error().unwrap_or("closed by server"),
                ?retry_in,
                "status channel down"
            ),
        }
    }

    fn on_snapshot(&mut self, outcome: FetchOutcome) {
        match outcome.result {
            Ok(records) => {
                let count = records.len();
                let summary = self.reconciler.apply_snapshot(records);
                debug!(
                    reason = %outcome.reason,
                    count,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    resolved = summary.resolved_stubs,
                    "snapshot applied"
                );
                if summary.changed() {
                    self.publish();
                }
                if outcome.reason == FetchReason::Repair && self.reconciler.needs_repair() {
                    info!("repair snapshot is missing some records; the next poll retries");
                }
            }
            Err(err) => warn!(reason = %outcome.reason, error = %format!("{err:#}"), "snapshot fetch failed; retrying on next tick"),
        }
    }

    fn publish(&self) {
        debug!(files = self.reconciler.len(), "registry updated");
        self.registry.send_replace(self.reconciler.records());
    }
}

async fn wait_announcement(slot: &mut Option<Announcement>) -> Option<FileRecord> {
    match slot {
        Some(work) => work.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::engine::snapshot::testing::FakeSource;
    use crate::engine::stream::testing::FakeConnector;
    use crate::files::api::{FileId, ScanStatus};

    const STEP: Duration = Duration::from_secs(5);

    fn named(id: &str, name: &str, status: ScanStatus) -> FileRecord {
        FileRecord {
            filename: Some(name.to_string()),
            ..FileRecord::partial(FileId::new(id), status)
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<Vec<FileRecord>>,
        predicate: impl FnMut(&Vec<FileRecord>) -> bool,
    ) -> Vec<FileRecord> {
        tokio::time::timeout(STEP, rx.wait_for(predicate))
            .await
            .expect("registry did not reach expected state")
            .expect("session ended early")
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn upload_then_deltas_end_in_terminal_clean() {
        let connector = FakeConnector::default();
        let server = connector.accept_next();
        let source = FakeSource::default();
        source.respond(Vec::new());
        source.set_fallback(vec![named("f1", "big.iso", ScanStatus::Pending)]);

        let session = SyncSession::new(
            connector,
            source.clone(),
            SessionConfig::new(Duration::from_secs(60)),
        );
        let mut registry = session.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            // Let the empty initial load land before the unknown id shows up.
            while source.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            server.push(r#"{"file_id":"f1","status":"pending"}"#);
            let repaired = wait_for(&mut registry, |files| {
                files.len() == 1 && files[0].filename.is_some()
            })
            .await;
            assert_eq!(repaired[0].scan_status, ScanStatus::Pending);
            assert_eq!(repaired[0].filename.as_deref(), Some("big.iso"));

            server.push(r#"{"file_id":"f1","status":"clean","checksum":"abc"}"#);
            let clean = wait_for(&mut registry, |files| {
                files.first().map(|f| f.scan_status) == Some(ScanStatus::Clean)
            })
            .await;
            assert_eq!(clean[0].checksum.as_deref(), Some("abc"));

            server.push(r#"{"file_id":"f1","status":"scanning"}"#);
            server.push(r#"{"type":"ping"}"#);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stop_tx.send(());
        };

        let (records, ()) = tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, FileId::new("f1"));
        assert_eq!(records[0].scan_status, ScanStatus::Clean);
        assert_eq!(records[0].checksum.as_deref(), Some("abc"));
        // initial load plus exactly one repair
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_produces_no_registry_mutation() {
        let connector = FakeConnector::default();
        let mut server = connector.accept_next();
        let source = FakeSource::default();
        source.set_fallback(vec![named("1", "a.txt", ScanStatus::Clean)]);

        let session = SyncSession::new(
            connector,
            source,
            SessionConfig::new(Duration::from_secs(60)),
        );
        let mut registry = session.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            wait_for(&mut registry, |files| files.len() == 1).await;

            server.push(r#"{"type":"ping"}"#);
            let pong = tokio::time::timeout(STEP, server.outbound.recv())
                .await
                .expect("no pong")
                .expect("channel closed");
            assert_eq!(pong, r#"{"type":"pong"}"#);

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!registry.has_changed().unwrap());
            assert!(server.outbound.try_recv().is_err());
            let _ = stop_tx.send(());
        };

        tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_failures_do_not_stop_polling() {
        let connector = FakeConnector::default();
        let _server = connector.accept_next();
        let source = FakeSource::default();
        source.fail("502 bad gateway");
        source.set_fallback(vec![named("3", "c", ScanStatus::Scanning)]);

        let session = SyncSession::new(
            connector,
            source.clone(),
            SessionConfig::new(Duration::from_secs(3)),
        );
        let mut registry = session.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            let files = wait_for(&mut registry, |files| !files.is_empty()).await;
            assert_eq!(files[0].id, FileId::new("3"));
            let _ = stop_tx.send(());
        };

        tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn announced_upload_lands_in_registry() {
        let connector = FakeConnector::default();
        let _server = connector.accept_next();
        let source = FakeSource::default();

        let mut session = SyncSession::new(
            connector,
            source,
            SessionConfig::new(Duration::from_secs(60)),
        );
        session.attach(async { Some(named("77", "new.pdf", ScanStatus::Pending)) }.boxed());
        let mut registry = session.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            let files = wait_for(&mut registry, |files| !files.is_empty()).await;
            assert_eq!(files[0].display_name(), "new.pdf");
            let _ = stop_tx.send(());
        };

        tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_receipt_keeps_terminal_status_from_the_channel() {
        let connector = FakeConnector::default();
        let server = connector.accept_next();
        let source = FakeSource::default();

        let mut session = SyncSession::new(
            connector,
            source.clone(),
            SessionConfig::new(Duration::from_secs(60)),
        );
        session.attach(
            async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Some(named("77", "new.pdf", ScanStatus::Pending))
            }
            .boxed(),
        );
        let mut registry = session.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            while source.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            server.push(r#"{"file_id":77,"status":"clean","checksum":"abc"}"#);
            wait_for(&mut registry, |files| {
                files.first().map(|f| f.scan_status) == Some(ScanStatus::Clean)
            })
            .await;

            let backfilled = wait_for(&mut registry, |files| {
                files.first().and_then(|f| f.filename.as_deref()) == Some("new.pdf")
            })
            .await;
            assert_eq!(backfilled.len(), 1);
            assert_eq!(backfilled[0].scan_status, ScanStatus::Clean);
            assert_eq!(backfilled[0].checksum.as_deref(), Some("abc"));
            let _ = stop_tx.send(());
        };

        let (records, ()) = tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
        assert_eq!(records[0].scan_status, ScanStatus::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_fetches_one_catch_up_snapshot() {
        let connector = FakeConnector::default();
        let first = connector.accept_next();
        let source = FakeSource::default();
        source.set_fallback(vec![named("1", "a.txt", ScanStatus::Scanning)]);

        let session = SyncSession::new(
            connector.clone(),
            source.clone(),
            SessionConfig::new(Duration::from_secs(60)),
        );
        let mut connection = session.connection();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let script = async {
            while source.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let before = source.calls();

            let _second = connector.accept_next();
            drop(first);
            while connector.attempts() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::timeout(
                STEP,
                connection.wait_for(|state| *state == ConnectionIndicator::Connected),
            )
            .await
            .expect("never reconnected")
            .expect("session ended early");

            // Well before the next periodic tick.
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(source.calls(), before + 1);
            let _ = stop_tx.send(());
        };

        tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_the_channel() {
        let connector = FakeConnector::default();
        let server = connector.accept_next();
        let session = SyncSession::new(
            connector.clone(),
            FakeSource::default(),
            SessionConfig::new(Duration::from_secs(60)),
        );
        let mut connection = session.connection();

        let script = async {
            tokio::time::timeout(
                STEP,
                connection.wait_for(|state| *state == ConnectionIndicator::Connected),
            )
            .await
            .expect("never connected")
            .expect("session ended early");
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            async {
                script.await;
                let _ = stop_tx.send(());
            }
        );

        // The client closed its end, so the server sees a closed inbound queue.
        assert!(server.inbound.is_closed());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 1);
    }
}
