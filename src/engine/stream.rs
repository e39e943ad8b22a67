use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::{parse_message, pong_message, Inbound, StatusDelta};

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_CAP_MS: u64 = 30_000;

/// Delay before reconnect attempt number `retry_count` (zero based):
/// `min(1000 * 2^retry_count, 30000)` milliseconds.
pub fn reconnect_delay(retry_count: u32) -> Duration {
    let ms = 2u64
        .checked_pow(retry_count)
        .and_then(|factor| RECONNECT_BASE_MS.checked_mul(factor))
        .map_or(RECONNECT_CAP_MS, |ms| ms.min(RECONNECT_CAP_MS));
    Duration::from_millis(ms)
}

/// Opens the status channel. Implementations must be able to start a fresh
/// attempt after any failure.
pub trait Connector {
    type Channel: Channel;

    fn connect(&self) -> BoxFuture<'static, Result<Self::Channel>>;
}

/// An established status channel carrying text frames.
pub trait Channel: Send {
    /// Next text frame, or `None` once the peer has closed. Must be cancel
    /// safe: dropping the future loses no frame.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String>>> + Send;

    fn send(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Read-only connection indicator for whoever renders the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened { reconnected: bool },
    Delta(StatusDelta),
    Closed { retry_in: Duration },
}

/// One logical subscription to the status channel.
///
/// All state lives in this struct and is only touched through `&mut self`,
/// so message handling and reconnect scheduling can never interleave. The
/// in-flight connect attempt and the reconnect timer are owned fields, which
/// makes [`EventStreamClient::next_event`] cancel safe and means dropping the
/// client releases the socket and the timer.
pub struct EventStreamClient<C: Connector> {
    connector: C,
    state: ConnectionState,
    retry_count: u32,
    has_connected: bool,
    torn_down: bool,
    pending_pong: bool,
    channel: Option<C::Channel>,
    pending_connect: Option<BoxFuture<'static, Result<C::Channel>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    last_error: Option<String>,
    indicator: watch::Sender<ConnectionIndicator>,
}

impl<C: Connector> EventStreamClient<C> {
    pub fn new(connector: C) -> Self {
        let (indicator, _) = watch::channel(ConnectionIndicator::Connecting);
        Self {
            connector,
            state: ConnectionState::Closed,
            retry_count: 0,
            has_connected: false,
            torn_down: false,
            pending_pong: false,
            channel: None,
            pending_connect: None,
            reconnect_timer: None,
            last_error: None,
            indicator,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionIndicator> {
        self.indicator.subscribe()
    }

    /// Start a connection attempt. No-op while open or already connecting,
    /// and after teardown.
    pub fn connect(&mut self) {
        if self.torn_down || self.state != ConnectionState::Closed {
            return;
        }
        self.reconnect_timer = None;
        self.state = ConnectionState::Connecting;
        self.pending_connect = Some(self.connector.connect());
        self.indicator.send_replace(ConnectionIndicator::Connecting);
        debug!(attempt = self.retry_count + 1, "connecting to status channel");
    }

    /// Drive the connection until something the owner must see happens.
    /// Keepalives are answered here and malformed frames are dropped here;
    /// neither is ever returned. A pong stays queued until its send completes,
    /// so cancelling this future mid-send only delays the reply.
    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            match self.state {
                ConnectionState::Connecting => {
                    let result = match self.pending_connect.as_mut() {
                        Some(attempt) => attempt.await,
                        None => {
                            self.pending_connect = Some(self.connector.connect());
                            continue;
                        }
                    };
                    self.pending_connect = None;
                    return match result {
                        Ok(channel) => self.on_open(channel),
                        Err(err) => self.on_closed(Some(format!("{err:#}"))),
                    };
                }
                ConnectionState::Open => {
                    if self.pending_pong {
                        if let Err(err) = self.reply_pong().await {
                            return self.on_closed(Some(format!("{err:#}")));
                        }
                        self.pending_pong = false;
                    }
                    let received = match self.channel.as_mut() {
                        Some(channel) => channel.recv().await,
                        None => None,
                    };
                    match received {
                        Some(Ok(text)) => match parse_message(&text) {
                            Ok(Inbound::Keepalive) => self.pending_pong = true,
                            Ok(Inbound::Delta(delta)) => return StreamEvent::Delta(delta),
                            Err(anomaly) => warn!(%anomaly, "dropping status message"),
                        },
                        Some(Err(err)) => return self.on_closed(Some(format!("{err:#}"))),
                        None => return self.on_closed(None),
                    }
                }
                ConnectionState::Closed => match self.reconnect_timer.as_mut() {
                    Some(timer) => {
                        timer.as_mut().await;
                        self.reconnect_timer = None;
                        self.connect();
                    }
                    // Never started or torn down: nothing left to drive.
                    None => std::future::pending::<()>().await,
                },
            }
        }
    }

    /// Cancel the reconnect timer and close the channel. After teardown the
    /// client never connects again.
    pub async fn teardown(&mut self) {
        self.torn_down = true;
        self.reconnect_timer = None;
        self.pending_connect = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.state = ConnectionState::Closed;
        debug!("status channel torn down");
    }

    async fn reply_pong(&mut self) -> Result<()> {
        match self.channel.as_mut() {
            Some(channel) => channel.send(pong_message()).await,
            None => Ok(()),
        }
    }

    fn on_open(&mut self, channel: C::Channel) -> StreamEvent {
        let reconnected = self.has_connected;
        self.channel = Some(channel);
        self.pending_pong = false;
        self.state = ConnectionState::Open;
        self.retry_count = 0;
        self.has_connected = true;
        self.reconnect_timer = None;
        self.last_error = None;
        self.indicator.send_replace(ConnectionIndicator::Connected);
        info!(reconnected, "status channel open");
        StreamEvent::Opened { reconnected }
    }

    fn on_closed(&mut self, error: Option<String>) -> StreamEvent {
        self.channel = None;
        self.pending_pong = false;
        self.state = ConnectionState::Closed;

        let delay = reconnect_delay(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
        match &error {
            Some(err) => warn!(error = %err, ?delay, "status channel lost; reconnecting"),
            None => info!(?delay, "status channel closed by server; reconnecting"),
        }
        self.last_error = error.clone();
        self.indicator.send_replace(ConnectionIndicator::Reconnecting {
            attempt: self.retry_count,
            delay,
            error,
        });
        StreamEvent::Closed { retry_in: delay }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use futures_util::FutureExt;
    use tokio::sync::mpsc;

    use super::*;

    /// Server side of a [`FakeChannel`].
    pub struct FakeServer {
        pub inbound: mpsc::UnboundedSender<Result<String>>,
        pub outbound: mpsc::UnboundedReceiver<String>,
        sends_open: watch::Sender<bool>,
    }

    impl FakeServer {
        pub fn push(&self, text: &str) {
            let _ = self.inbound.send(Ok(text.to_string()));
        }

        /// Client sends block until [`FakeServer::release_sends`].
        pub fn hold_sends(&self) {
            self.sends_open.send_replace(false);
        }

        pub fn release_sends(&self) {
            self.sends_open.send_replace(true);
        }
    }

    pub struct FakeChannel {
        inbound: mpsc::UnboundedReceiver<Result<String>>,
        outbound: mpsc::UnboundedSender<String>,
        sends_open: watch::Receiver<bool>,
    }

    impl Channel for FakeChannel {
        async fn recv(&mut self) -> Option<Result<String>> {
            self.inbound.recv().await
        }

        async fn send(&mut self, text: String) -> Result<()> {
            let open = self.sends_open.wait_for(|open| *open).await.is_ok();
            if !open {
                return Err(anyhow!("server went away"));
            }
            self.outbound
                .send(text)
                .map_err(|_| anyhow!("server went away"))
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    pub fn channel_pair() -> (FakeChannel, FakeServer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(true);
        (
            FakeChannel {
                inbound: in_rx,
                outbound: out_tx,
                sends_open: gate_rx,
            },
            FakeServer {
                inbound: in_tx,
                outbound: out_rx,
                sends_open: gate_tx,
            },
        )
    }

    /// Hands out scripted channels in order and refuses once they run out.
    #[derive(Clone, Default)]
    pub struct FakeConnector {
        script: Arc<Mutex<VecDeque<FakeChannel>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        pub fn accept_next(&self) -> FakeServer {
            let (channel, server) = channel_pair();
            self.script.lock().unwrap().push_back(channel);
            server
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for FakeConnector {
        type Channel = FakeChannel;

        fn connect(&self) -> BoxFuture<'static, Result<FakeChannel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            async move { next.ok_or_else(|| anyhow!("connection refused")) }.boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeConnector;
    use super::*;
    use crate::files::api::{FileId, ScanStatus};

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<u64> = (0..8).map(|n| reconnect_delay(n).as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_follow_backoff_sequence() {
        let connector = FakeConnector::default();
        let mut client = EventStreamClient::new(connector.clone());
        client.connect();

        let mut delays = Vec::new();
        for _ in 0..7 {
            match client.next_event().await {
                StreamEvent::Closed { retry_in } => delays.push(retry_in.as_secs()),
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(connector.attempts(), 7);
        assert_eq!(client.retry_count(), 7);
        assert!(client.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connection_resets_retry_counter() {
        let connector = FakeConnector::default();
        let mut client = EventStreamClient::new(connector.clone());
        client.connect();

        assert!(matches!(client.next_event().await, StreamEvent::Closed { .. }));
        assert!(matches!(client.next_event().await, StreamEvent::Closed { .. }));
        assert_eq!(client.retry_count(), 2);

        let server = connector.accept_next();
        assert_eq!(
            client.next_event().await,
            StreamEvent::Opened { reconnected: false }
        );
        assert_eq!(client.retry_count(), 0);
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.last_error(), None);
        assert_eq!(*client.subscribe().borrow(), ConnectionIndicator::Connected);

        drop(server);
        assert_eq!(
            client.next_event().await,
            StreamEvent::Closed {
                retry_in: Duration::from_secs(1)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_is_answered_and_never_surfaces() {
        let connector = FakeConnector::default();
        let mut server = connector.accept_next();
        let mut client = EventStreamClient::new(connector);
        client.connect();
        assert!(matches!(client.next_event().await, StreamEvent::Opened { .. }));

        server.push(r#"{"type":"ping"}"#);
        server.push(r#"{"file_id":"f1","status":"pending"}"#);

        let event = client.next_event().await;
        assert_eq!(
            event,
            StreamEvent::Delta(StatusDelta {
                file_id: FileId::new("f1"),
                status: ScanStatus::Pending,
                details: None,
                checksum: None,
            })
        );
        assert_eq!(server.outbound.try_recv().unwrap(), r#"{"type":"pong"}"#);
        assert!(server.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_survives_a_cancelled_poll() {
        let connector = FakeConnector::default();
        let mut server = connector.accept_next();
        let mut client = EventStreamClient::new(connector);
        client.connect();
        assert!(matches!(client.next_event().await, StreamEvent::Opened { .. }));

        server.hold_sends();
        server.push(r#"{"type":"ping"}"#);
        let stalled =
            tokio::time::timeout(Duration::from_millis(50), client.next_event()).await;
        assert!(stalled.is_err());
        assert!(server.outbound.try_recv().is_err());

        server.release_sends();
        server.push(r#"{"file_id":"f1","status":"scanning"}"#);
        assert!(matches!(client.next_event().await, StreamEvent::Delta(_)));
        assert_eq!(server.outbound.try_recv().unwrap(), r#"{"type":"pong"}"#);
        assert!(server.outbound.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn deltas_arrive_in_order_and_malformed_frames_are_dropped() {
        let connector = FakeConnector::default();
        let server = connector.accept_next();
        let mut client = EventStreamClient::new(connector);
        client.connect();
        client.next_event().await;

        server.push(r#"{"file_id":1,"status":"pending"}"#);
        server.push("{{ garbage");
        server.push(r#"{"file_id":1,"status":"scanning"}"#);
        server.push(r#"{"file_id":2,"status":"pending"}"#);

        let mut seen = Vec::new();
        for _ in 0..3 {
            match client.next_event().await {
                StreamEvent::Delta(delta) => seen.push((delta.file_id.to_string(), delta.status)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("1".to_string(), ScanStatus::Pending),
                ("1".to_string(), ScanStatus::Scanning),
                ("2".to_string(), ScanStatus::Pending),
            ]
        );
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_a_noop_while_open() {
        let connector = FakeConnector::default();
        let _server = connector.accept_next();
        let mut client = EventStreamClient::new(connector.clone());
        client.connect();
        client.connect();
        client.next_event().await;
        client.connect();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_after_drop_is_flagged_as_reconnect() {
        let connector = FakeConnector::default();
        let first = connector.accept_next();
        let mut client = EventStreamClient::new(connector.clone());
        client.connect();
        client.next_event().await;

        let _second = connector.accept_next();
        drop(first);
        assert!(matches!(client.next_event().await, StreamEvent::Closed { .. }));
        assert_eq!(
            client.next_event().await,
            StreamEvent::Opened { reconnected: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_reconnect() {
        let connector = FakeConnector::default();
        let mut client = EventStreamClient::new(connector.clone());
        client.connect();
        assert!(matches!(client.next_event().await, StreamEvent::Closed { .. }));

        client.teardown().await;
        client.connect();

        let waited =
            tokio::time::timeout(Duration::from_secs(120), client.next_event()).await;
        assert!(waited.is_err(), "torn down client must stay idle");
        assert_eq!(connector.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
