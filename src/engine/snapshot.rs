use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::debug;

use crate::files::api::{self, FileRecord};
use crate::http::ApiClient;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_REPAIR_COOLDOWN: Duration = Duration::from_secs(1);

/// Where authoritative snapshots come from.
pub trait SnapshotSource {
    fn fetch_snapshot(&self) -> BoxFuture<'static, Result<Vec<FileRecord>>>;
}

impl SnapshotSource for ApiClient {
    fn fetch_snapshot(&self) -> BoxFuture<'static, Result<Vec<FileRecord>>> {
        let client = self.clone();
        async move { api::list_files(&client).await }.boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Initial,
    Periodic,
    Repair,
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::Periodic => "periodic",
            Self::Repair => "repair",
        })
    }
}

pub struct FetchOutcome {
    pub reason: FetchReason,
    pub result: Result<Vec<FileRecord>>,
}

type InFlight = (FetchReason, BoxFuture<'static, Result<Vec<FileRecord>>>);

/// Periodic and on-demand snapshot fetching.
///
/// The first tick fires immediately and serves as the initial load. At most
/// one fetch is in flight; repair requests made meanwhile coalesce into a
/// single follow-up, and repairs are spaced by a cooldown so a burst of
/// unknown ids cannot turn into a burst of full fetches. A failed fetch does
/// not disturb the interval.
pub struct SnapshotFetcher<S> {
    source: S,
    ticker: Interval,
    started: bool,
    in_flight: Option<InFlight>,
    repair_requested: bool,
    repair_cooldown: Duration,
    last_repair: Option<Instant>,
    repair_timer: Option<Pin<Box<Sleep>>>,
}

enum Wake {
    Tick,
    Fetched(Result<Vec<FileRecord>>),
    RepairDue,
}

impl<S: SnapshotSource> SnapshotFetcher<S> {
    /// Must be called from within a tokio runtime.
    pub fn new(source: S, poll_interval: Duration, repair_cooldown: Duration) -> Self {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            source,
            ticker,
            started: false,
            in_flight: None,
            repair_requested: false,
            repair_cooldown,
            last_repair: None,
            repair_timer: None,
        }
    }

    /// Ask for a repair fetch as soon as the cooldown and any in-flight fetch
    /// allow.
    pub fn request_repair(&mut self) {
        self.repair_requested = true;
        self.arm_repair();
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Wait for the next completed fetch. Cancel safe.
    pub async fn next_outcome(&mut self) -> FetchOutcome {
        loop {
            let wake = {
                let ticker = &mut self.ticker;
                let in_flight = &mut self.in_flight;
                let repair_timer = &mut self.repair_timer;
                tokio::select! {
                    result = wait_in_flight(in_flight) => Wake::Fetched(result),
                    _ = wait_timer(repair_timer) => Wake::RepairDue,
                    _ = ticker.tick() => Wake::Tick,
                }
            };

            match wake {
                Wake::Tick => {
                    let reason = if self.started {
                        FetchReason::Periodic
                    } else {
                        FetchReason::Initial
                    };
                    self.started = true;
                    if self.in_flight.is_some() {
                        debug!("snapshot still in flight; skipping tick");
                        continue;
                    }
                    self.start(reason);
                }
                Wake::RepairDue => {
                    self.repair_timer = None;
                    if self.in_flight.is_none() && self.repair_requested {
                        self.start(FetchReason::Repair);
                    }
                }
                Wake::Fetched(result) => {
                    let reason = match self.in_flight.take() {
                        Some((reason, _)) => reason,
                        None => continue,
                    };
                    self.arm_repair();
                    return FetchOutcome { reason, result };
                }
            }
        }
    }

    fn start(&mut self, reason: FetchReason) {
        debug!(%reason, "fetching snapshot");
        if reason == FetchReason::Repair {
            self.repair_requested = false;
            self.last_repair = Some(Instant::now());
        }
        self.in_flight = Some((reason, self.source.fetch_snapshot()));
    }

    fn arm_repair(&mut self) {
        if !self.repair_requested || self.in_flight.is_some() || self.repair_timer.is_some() {
            return;
        }
        let due = match self.last_repair {
            Some(last) => last + self.repair_cooldown,
            None => Instant::now(),
        };
        self.repair_timer = Some(Box::pin(tokio::time::sleep_until(due)));
    }
}

async fn wait_in_flight(slot: &mut Option<InFlight>) -> Result<Vec<FileRecord>> {
    match slot {
        Some((_, fetch)) => fetch.await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
