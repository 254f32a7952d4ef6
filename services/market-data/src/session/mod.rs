//! Feed session
//!
//! Owns the single upstream websocket for the process. Frames go through
//! the decoder; each resulting tick updates the spot board and is routed to
//! the builders whose instruments match, in upstream delivery order.
//!
//! ```text
//! authorize ─► connect ─► resubscribe wanted set ─► select { frame | command | shutdown }
//!     ▲                                                          │ error / close
//!     └──────────────── backoff (capped, doubling) ◄─────────────┘
//! ```

pub mod router;
pub mod upstream;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use types::ids::InstrumentId;

use crate::decoder::{DecoderMode, FeedDecoder};
use crate::error::{DeliveryError, FeedError};
use crate::metrics::FeedMetrics;
use crate::subscriptions::{Subscriber, SubscriptionRegistry, MARKET_DATA_CHANNEL};

pub use router::{RouteId, RouteOutcome, SpotBoard, TickRouter};
pub use upstream::{
    AccessTokenProvider, FeedAuthorizer, FixedFeedUrl, HttpFeedAuthorizer, StaticTokenProvider,
    SubscriptionRequest, DEFAULT_AUTHORIZE_URL,
};

/// Liveness cadence on subscriber-facing connections.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Feed session configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub decoder: DecoderMode,
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Instrument keys per upstream subscription request.
    pub subscribe_batch: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderMode::IndexOnly,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            subscribe_batch: 100,
        }
    }
}

enum FeedCommand {
    Subscribe(Vec<InstrumentId>),
}

enum StreamEnd {
    Closed,
    Shutdown,
}

struct Worker {
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    shutdown: watch::Sender<bool>,
}

pub struct FeedSession {
    config: FeedConfig,
    authorizer: Arc<dyn FeedAuthorizer>,
    decoder: FeedDecoder,
    router: TickRouter,
    spots: SpotBoard,
    metrics: FeedMetrics,
    connected: AtomicBool,
    worker: Mutex<Option<Worker>>,
    wanted: Mutex<BTreeSet<InstrumentId>>,
}

impl FeedSession {
    pub fn new(config: FeedConfig, authorizer: Arc<dyn FeedAuthorizer>) -> Self {
        Self {
            decoder: FeedDecoder::new(config.decoder),
            config,
            authorizer,
            router: TickRouter::new(),
            spots: SpotBoard::new(),
            metrics: FeedMetrics::new(),
            connected: AtomicBool::new(false),
            worker: Mutex::new(None),
            wanted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Start the upstream loop. Returns `false` when it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.task.is_finished()) {
            debug!("Feed session already running");
            return false;
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Arc::clone(self);
        let task = tokio::spawn(async move { session.run(command_rx, shutdown_rx).await });

        *worker = Some(Worker {
            task,
            commands,
            shutdown,
        });
        info!("Feed session started");
        true
    }

    /// Whether the upstream socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.task.is_finished())
    }

    /// Stop the upstream loop; a later `start()` opens a fresh connection.
    pub fn shutdown(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.shutdown.send_replace(true);
            info!("Feed session shutting down");
        }
    }

    /// Ask upstream for ticks on `instruments`. Only identifiers not
    /// requested before are sent; the full set is replayed on reconnect.
    pub fn request_subscription(&self, instruments: &[InstrumentId]) {
        let fresh: Vec<InstrumentId> = {
            let mut wanted = lock(&self.wanted);
            instruments
                .iter()
                .filter(|id| wanted.insert((*id).clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        debug!(count = fresh.len(), "Requesting upstream subscription");
        if let Some(worker) = lock(&self.worker).as_ref() {
            let _ = worker.commands.send(FeedCommand::Subscribe(fresh));
        }
    }

    pub fn subscribed_count(&self) -> usize {
        lock(&self.wanted).len()
    }

    pub fn router(&self) -> &TickRouter {
        &self.router
    }

    pub fn spots(&self) -> &SpotBoard {
        &self.spots
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.metrics
    }

    /// Decode one frame and route its ticks. Returns the number of ticks.
    pub fn process_frame(&self, frame: &[u8]) -> usize {
        let started = Instant::now();
        let decoded = self.decoder.decode_frame(frame);
        self.metrics.record_frame(
            decoded.ticks.len(),
            decoded.skipped,
            started.elapsed().as_nanos() as u64,
        );

        for tick in &decoded.ticks {
            self.spots.update(tick);
            let outcome = self.router.dispatch(tick);
            self.metrics.record_route(outcome.delivered, outcome.dropped);
        }
        decoded.ticks.len()
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<FeedCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut delay = self.config.reconnect_delay;

        loop {
            let outcome = self.connect_and_stream(&mut commands, &mut shutdown).await;
            self.connected.store(false, Ordering::Release);

            match outcome {
                Ok(StreamEnd::Shutdown) => break,
                Ok(StreamEnd::Closed) => {
                    warn!("Feed closed by upstream; reconnecting");
                    delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Feed disconnected; reconnecting");
                }
            }
            self.metrics.record_reconnect();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }

        info!("Feed session stopped");
    }

    async fn connect_and_stream(
        &self,
        commands: &mut mpsc::UnboundedReceiver<FeedCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd, FeedError> {
        if *shutdown.borrow() {
            return Ok(StreamEnd::Shutdown);
        }

        let url = self.authorizer.authorize().await?;
        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();
        self.connected.store(true, Ordering::Release);

        let wanted: Vec<InstrumentId> = lock(&self.wanted).iter().cloned().collect();
        info!(instruments = wanted.len(), "Feed connected");
        for batch in wanted.chunks(self.config.subscribe_batch.max(1)) {
            let request = SubscriptionRequest::subscribe(batch);
            write.send(Message::Binary(request.to_frame())).await?;
        }

        loop {
            tokio::select! {
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(StreamEnd::Closed);
                    };
                    match frame? {
                        Message::Binary(bytes) => {
                            self.process_frame(&bytes);
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(frame) => {
                            debug!(?frame, "Feed close frame");
                            return Ok(StreamEnd::Closed);
                        }
                        Message::Text(text) => {
                            debug!(len = text.len(), "Ignoring text frame from feed");
                        }
                        _ => {}
                    }
                }
                command = commands.recv() => {
                    let Some(FeedCommand::Subscribe(instruments)) = command else {
                        return Ok(StreamEnd::Shutdown);
                    };
                    for batch in instruments.chunks(self.config.subscribe_batch.max(1)) {
                        let request = SubscriptionRequest::subscribe(batch);
                        write.send(Message::Binary(request.to_frame())).await?;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamEnd::Shutdown);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Serialize)]
struct Heartbeat {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: i64,
}

/// Send a liveness payload every `interval` until a send fails.
///
/// Returns the failure; the caller owns cleanup.
pub async fn keepalive(subscriber: Arc<dyn Subscriber>, interval: Duration) -> DeliveryError {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let payload = Heartbeat {
            kind: "heartbeat",
            ts: chrono::Utc::now().timestamp_millis(),
        };
        let message = serde_json::to_string(&payload).unwrap_or_default();
        if let Err(e) = subscriber.send(&message).await {
            debug!(connection = %subscriber.id(), error = %e, "Keepalive ended");
            return e;
        }
    }
}

#[derive(Serialize)]
struct SpotQuote {
    ltp: f64,
    observed_at: i64,
}

#[derive(Serialize)]
struct SpotUpdate<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a BTreeMap<String, SpotQuote>,
    generated_at: i64,
}

/// Broadcast the underlyings' latest spots to the market-data channel
/// every `interval`, skipping passes where nothing changed.
pub async fn publish_spots(
    session: Arc<FeedSession>,
    channels: Arc<SubscriptionRegistry>,
    underlyings: BTreeMap<String, InstrumentId>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seen: BTreeMap<String, i64> = BTreeMap::new();

    loop {
        ticker.tick().await;

        let mut spots = BTreeMap::new();
        let mut changed = false;
        for (symbol, id) in &underlyings {
            if let Some(tick) = session.spots().latest(id) {
                if last_seen.insert(symbol.clone(), tick.observed_at) != Some(tick.observed_at) {
                    changed = true;
                }
                spots.insert(
                    symbol.clone(),
                    SpotQuote {
                        ltp: tick.last_traded_price,
                        observed_at: tick.observed_at,
                    },
                );
            }
        }
        if !changed || !channels.contains_channel(MARKET_DATA_CHANNEL) {
            continue;
        }

        let update = SpotUpdate {
            kind: "spot",
            data: &spots,
            generated_at: chrono::Utc::now().timestamp_millis(),
        };
        let Ok(message) = serde_json::to_string(&update) else {
            continue;
        };
        let report = channels.broadcast(MARKET_DATA_CHANNEL, &message).await;
        session
            .metrics()
            .record_broadcast(report.delivered, report.dropped);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::proto::{Feed, FeedResponse, FeedType};
    use prost::Message as _;

    /// Encode a live frame of `(instrument, feed)` entries.
    pub fn live_frame(entries: Vec<(&str, Feed)>) -> Vec<u8> {
        FeedResponse {
            r#type: FeedType::LiveFeed as i32,
            feeds: entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            current_ts: chrono::Utc::now().timestamp_millis(),
        }
        .encode_to_vec()
    }

    /// Session that never connects anywhere.
    pub fn offline_session(decoder: DecoderMode) -> Arc<FeedSession> {
        Arc::new(FeedSession::new(
            FeedConfig {
                decoder,
                ..FeedConfig::default()
            },
            Arc::new(FixedFeedUrl::new("ws://127.0.0.1:9/unused")),
        ))
    }
}
