//! Chain builder
//!
//! One builder per (symbol, expiry). While running, a task consumes the
//! ticks routed to the chain's instruments, keeps the latest quote per
//! strike and side, and publishes the assembled chain to the
//! `"{symbol}:{expiry}"` channel whenever something changed.
//!
//! Lifecycle: `Created -> Running -> Stopped -> Running ...`. Stopping
//! cancels the task but keeps the snapshot, so a restarted builder serves
//! the last known chain until new ticks arrive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::expiry::ExpiryDate;
use types::ids::InstrumentId;
use types::instrument::{ChainKey, InstrumentSide};
use types::tick::Tick;

use crate::directory::InstrumentDirectory;
use crate::session::FeedSession;
use crate::subscriptions::SubscriptionRegistry;

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Cadence of change-driven publishes.
    pub publish_interval: Duration,
    /// Capacity of the builder's tick queue.
    pub tick_buffer: usize,
    /// Quotes older than this are flagged stale.
    pub stale_after: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(1000),
            tick_buffer: 1024,
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Created,
    Running,
    Stopped,
}

/// One leg's quote as published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub ltp: f64,
    pub observed_at: i64,
    pub age_ms: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrikeRow {
    pub strike: i64,
    pub call: Option<Quote>,
    pub put: Option<Quote>,
    pub updated_at: Option<i64>,
}

/// Assembled option chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainPayload {
    pub symbol: String,
    pub expiry: ExpiryDate,
    pub spot: Option<f64>,
    pub future: Option<f64>,
    pub atm_strike: Option<i64>,
    pub strikes: Vec<StrikeRow>,
    pub generated_at: i64,
}

impl ChainPayload {
    pub fn row(&self, strike: i64) -> Option<&StrikeRow> {
        self.strikes.iter().find(|row| row.strike == strike)
    }
}

#[derive(Debug, Clone, Copy)]
struct LastPrice {
    ltp: f64,
    observed_at: i64,
}

#[derive(Debug, Default)]
struct Row {
    call: Option<LastPrice>,
    put: Option<LastPrice>,
    updated_at: Option<i64>,
}

#[derive(Debug, Default)]
struct ChainSnapshot {
    rows: BTreeMap<i64, Row>,
    legs: HashMap<InstrumentId, (i64, InstrumentSide)>,
    future: Option<InstrumentId>,
    dirty: bool,
}

impl ChainSnapshot {
    fn apply(&mut self, tick: &Tick) {
        if let Some(&(strike, side)) = self.legs.get(&tick.instrument_id) {
            let row = self.rows.entry(strike).or_default();
            let leg = match side {
                InstrumentSide::Call => &mut row.call,
                _ => &mut row.put,
            };
            // Keep the newer quote when ticks arrive out of order.
            if leg.as_ref().is_some_and(|held| held.observed_at > tick.observed_at) {
                return;
            }
            *leg = Some(LastPrice {
                ltp: tick.last_traded_price,
                observed_at: tick.observed_at,
            });
            row.updated_at = Some(row.updated_at.map_or(tick.observed_at, |t| t.max(tick.observed_at)));
        }
        // Underlying and future ticks only change derived fields.
        self.dirty = true;
    }
}

struct Lifecycle {
    state: BuilderState,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    subscribers: usize,
}

pub struct ChainBuilder {
    key: ChainKey,
    channel: String,
    config: ChainConfig,
    directory: Arc<InstrumentDirectory>,
    session: Arc<FeedSession>,
    subscriptions: Arc<SubscriptionRegistry>,
    snapshot: RwLock<ChainSnapshot>,
    lifecycle: Mutex<Lifecycle>,
}

impl ChainBuilder {
    pub fn new(
        key: ChainKey,
        config: ChainConfig,
        directory: Arc<InstrumentDirectory>,
        session: Arc<FeedSession>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            channel: key.channel(),
            key,
            config,
            directory,
            session,
            subscriptions,
            snapshot: RwLock::new(ChainSnapshot::default()),
            lifecycle: Mutex::new(Lifecycle {
                state: BuilderState::Created,
                stop: None,
                task: None,
                subscribers: 0,
            }),
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    /// Channel the builder publishes to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> BuilderState {
        self.lifecycle().state
    }

    /// Attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lifecycle().subscribers
    }

    /// Begin consuming ticks. No-op (returns `false`) if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle();
        self.start_locked(&mut lifecycle)
    }

    /// Cancel the ingestion task, keeping the snapshot.
    ///
    /// Safe on a builder that never started. Returns whether a task was
    /// running.
    pub fn stop_tasks(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        self.stop_locked(&mut lifecycle)
    }

    /// Count one more subscriber, starting the builder on the first.
    pub fn retain(self: &Arc<Self>) -> usize {
        let mut lifecycle = self.lifecycle();
        lifecycle.subscribers += 1;
        if lifecycle.subscribers == 1 {
            self.start_locked(&mut lifecycle);
        }
        lifecycle.subscribers
    }

    /// Drop one subscriber, stopping the builder with the last.
    pub fn release(&self) -> usize {
        let mut lifecycle = self.lifecycle();
        if lifecycle.subscribers == 0 {
            return 0;
        }
        lifecycle.subscribers -= 1;
        if lifecycle.subscribers == 0 {
            self.stop_locked(&mut lifecycle);
        }
        lifecycle.subscribers
    }

    /// Current chain merged with the latest underlying and future prices.
    /// Reads in-memory state only.
    pub fn get_latest(&self) -> ChainPayload {
        let now = chrono::Utc::now().timestamp_millis();
        let spot = self
            .directory
            .underlying(&self.key.symbol)
            .and_then(|id| self.session.spots().latest(&id))
            .map(|tick| tick.last_traded_price);

        let (rows, future_id) = {
            let snapshot = self.read_snapshot();
            let rows: Vec<StrikeRow> = snapshot
                .rows
                .iter()
                .map(|(strike, row)| StrikeRow {
                    strike: *strike,
                    call: row.call.map(|p| self.quote(p, now)),
                    put: row.put.map(|p| self.quote(p, now)),
                    updated_at: row.updated_at,
                })
                .collect();
            (rows, snapshot.future.clone())
        };

        let future = future_id
            .and_then(|id| self.session.spots().latest(&id))
            .map(|tick| tick.last_traded_price);
        let atm_strike = spot.and_then(|spot| {
            rows.iter()
                .map(|row| row.strike)
                .min_by(|a, b| (*a as f64 - spot).abs().total_cmp(&(*b as f64 - spot).abs()))
        });

        ChainPayload {
            symbol: self.key.symbol.clone(),
            expiry: self.key.expiry,
            spot,
            future,
            atm_strike,
            strikes: rows,
            generated_at: now,
        }
    }

    /// Serialized form of [`get_latest`](Self::get_latest).
    pub fn build_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.get_latest())
    }

    fn quote(&self, price: LastPrice, now: i64) -> Quote {
        let age_ms = (now - price.observed_at).max(0);
        Quote {
            ltp: price.ltp,
            observed_at: price.observed_at,
            age_ms,
            stale: age_ms > self.config.stale_after.as_millis() as i64,
        }
    }

    fn start_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> bool {
        if lifecycle.state == BuilderState::Running
            && lifecycle.task.as_ref().is_some_and(|task| !task.is_finished())
        {
            return false;
        }

        let instruments = self.refresh_legs();
        let (stop_tx, stop_rx) = oneshot::channel();
        let builder = Arc::clone(self);
        lifecycle.task = Some(tokio::spawn(async move { builder.run(instruments, stop_rx).await }));
        lifecycle.stop = Some(stop_tx);
        lifecycle.state = BuilderState::Running;
        true
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) -> bool {
        let was_running = lifecycle.state == BuilderState::Running;
        if let Some(stop) = lifecycle.stop.take() {
            let _ = stop.send(());
        }
        lifecycle.task = None;
        if lifecycle.state != BuilderState::Created {
            lifecycle.state = BuilderState::Stopped;
        }
        if was_running {
            info!(chain = %self.key, "Chain builder stopped");
        }
        was_running
    }

    /// Merge the directory's legs into the snapshot and list every
    /// instrument the builder consumes.
    fn refresh_legs(&self) -> Vec<InstrumentId> {
        let strikes = self.directory.option_chain(&self.key).unwrap_or_default();
        let future = self.directory.future(&self.key.symbol, &self.key.expiry);
        if strikes.is_empty() {
            warn!(chain = %self.key, ready = self.directory.is_ready(), "No listed strikes for chain");
        }

        let mut instruments = Vec::with_capacity(strikes.len() * 2 + 2);
        let mut snapshot = self.write_snapshot();
        for (strike, pair) in &strikes {
            snapshot.rows.entry(*strike).or_default();
            if let Some(call) = &pair.call {
                snapshot.legs.insert(call.clone(), (*strike, InstrumentSide::Call));
                instruments.push(call.clone());
            }
            if let Some(put) = &pair.put {
                snapshot.legs.insert(put.clone(), (*strike, InstrumentSide::Put));
                instruments.push(put.clone());
            }
        }
        if let Some(future) = &future {
            instruments.push(future.clone());
        }
        snapshot.future = future;
        drop(snapshot);

        if let Some(index) = self.directory.underlying(&self.key.symbol) {
            instruments.push(index);
        }
        instruments
    }

    async fn run(self: Arc<Self>, instruments: Vec<InstrumentId>, mut stop: oneshot::Receiver<()>) {
        let (tx, mut ticks) = mpsc::channel(self.config.tick_buffer.max(1));
        let route = self.session.router().register(&instruments, tx);
        self.session.request_subscription(&instruments);
        info!(chain = %self.key, instruments = instruments.len(), "Chain builder started");

        self.write_snapshot().dirty = false;
        self.publish().await;

        let period = self.config.publish_interval;
        let mut publish = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        publish.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                tick = ticks.recv() => match tick {
                    Some(tick) => self.write_snapshot().apply(&tick),
                    None => break,
                },
                _ = publish.tick() => {
                    if self.take_dirty() {
                        self.publish().await;
                    }
                }
            }
        }

        self.session.router().unregister(route, &instruments);
        debug!(chain = %self.key, "Chain ingestion task exited");
    }

    fn take_dirty(&self) -> bool {
        std::mem::replace(&mut self.write_snapshot().dirty, false)
    }

    async fn publish(&self) {
        if !self.subscriptions.contains_channel(&self.channel) {
            return;
        }
        let message = match self.build_payload() {
            Ok(message) => message,
            Err(e) => {
                warn!(chain = %self.key, error = %e, "Failed to serialize chain payload");
                return;
            }
        };
        let report = self.subscriptions.broadcast(&self.channel, &message).await;
        self.session
            .metrics()
            .record_broadcast(report.delivered, report.dropped);
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, ChainSnapshot> {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_snapshot(&self) -> std::sync::RwLockWriteGuard<'_, ChainSnapshot> {
        self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::decoder::DecoderMode;
    use crate::directory::testing::sample_source;
    use crate::directory::DirectoryConfig;
    use crate::session::testing::offline_session;

    pub struct Harness {
        pub directory: Arc<InstrumentDirectory>,
        pub session: Arc<FeedSession>,
        pub subscriptions: Arc<SubscriptionRegistry>,
    }

    /// Loaded sample directory, offline session accepting market feeds.
    pub async fn harness() -> Harness {
        let directory = Arc::new(InstrumentDirectory::new(DirectoryConfig::default(), sample_source()));
        directory.load().await.unwrap();
        Harness {
            directory,
            session: offline_session(DecoderMode::IncludeMarket),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
        }
    }

    pub fn nifty_feb() -> ChainKey {
        ChainKey::new("NIFTY", ExpiryDate::from_ymd(2025, 2, 26).unwrap()).unwrap()
    }

    /// Poll `cond` every 5ms for up to two seconds.
    pub async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}
