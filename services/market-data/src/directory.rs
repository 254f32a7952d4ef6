//! Instrument directory
//!
//! Resolves (symbol, expiry, strike, side) to the upstream instrument
//! identifier. Populated once per process from the broker's compressed
//! instrument snapshot, read-only afterwards.
//!
//! # Loading
//!
//! `load()` is a double-checked one-time gate:
//!
//! ```text
//! ready flag set? ──yes──► return (no lock)
//!      │ no
//!   claim Pending ─► Loading ──lost──► park until phase leaves Loading
//!      │ won                              (Ready: return, Pending: retry)
//!   fetch + parse (no lock held)
//!      │ ok                         │ err / cancelled
//!   publish data, phase Ready     phase back to Pending
//! ```
//!
//! The phase lives in a watch channel; the claim is a single
//! `send_if_modified`, so only that bookkeeping is ever under a lock.
//! Readers after the load only check the flag. `wait_until_ready()` parks
//! on the same channel and never starts a load itself.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use types::expiry::{ExpiryDate, ExpiryInput};
use types::ids::InstrumentId;
use types::instrument::{normalize_symbol, ChainKey, InstrumentKey, InstrumentSide};

use crate::error::DirectoryError;

/// Broker's full instrument snapshot.
pub const DEFAULT_SNAPSHOT_URL: &str =
    "https://assets.upstox.com/market-quote/instruments/exchange/complete.json.gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Directory configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Derivatives segment to retain (e.g. `NSE_FO`).
    pub segment: String,
    /// Retained underlyings: symbol -> index instrument identifier.
    pub underlyings: BTreeMap<String, InstrumentId>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        let underlyings = [
            ("NIFTY", "NSE_INDEX|Nifty 50"),
            ("BANKNIFTY", "NSE_INDEX|Nifty Bank"),
            ("FINNIFTY", "NSE_INDEX|Nifty Fin Service"),
        ]
        .into_iter()
        .map(|(symbol, key)| (symbol.to_string(), InstrumentId::new(key)))
        .collect();

        Self {
            segment: "NSE_FO".to_string(),
            underlyings,
        }
    }
}

/// Where the raw snapshot bytes come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, DirectoryError>;
}

/// Fetches the snapshot over HTTPS.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self) -> Result<Vec<u8>, DirectoryError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// One snapshot record as it appears upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInstrument {
    #[serde(default)]
    pub segment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instrument_type: String,
    #[serde(default)]
    pub expiry: Option<ExpiryInput>,
    #[serde(default)]
    pub strike_price: Option<f64>,
    pub instrument_key: String,
}

/// A snapshot record classified once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentRecord {
    Call {
        symbol: String,
        expiry: ExpiryDate,
        strike: i64,
        id: InstrumentId,
    },
    Put {
        symbol: String,
        expiry: ExpiryDate,
        strike: i64,
        id: InstrumentId,
    },
    Future {
        symbol: String,
        expiry: ExpiryDate,
        id: InstrumentId,
    },
    Unrecognized,
}

impl RawInstrument {
    /// Classify into a recognized kind. Records without a usable expiry
    /// (or options without a strike) are `Unrecognized`.
    pub fn classify(self) -> InstrumentRecord {
        let Some(side) = InstrumentSide::from_code(&self.instrument_type) else {
            return InstrumentRecord::Unrecognized;
        };
        let Some(expiry) = self.expiry.as_ref().and_then(|e| ExpiryDate::normalize(e).ok()) else {
            return InstrumentRecord::Unrecognized;
        };
        let symbol = normalize_symbol(&self.name);
        let id = InstrumentId::new(self.instrument_key);

        match side {
            InstrumentSide::Call | InstrumentSide::Put => {
                let Some(strike) = self.strike_price.filter(|s| s.is_finite() && *s > 0.0) else {
                    return InstrumentRecord::Unrecognized;
                };
                let strike = strike.round() as i64;
                if side == InstrumentSide::Call {
                    InstrumentRecord::Call { symbol, expiry, strike, id }
                } else {
                    InstrumentRecord::Put { symbol, expiry, strike, id }
                }
            }
            InstrumentSide::Future => InstrumentRecord::Future { symbol, expiry, id },
            InstrumentSide::Index => InstrumentRecord::Unrecognized,
        }
    }
}

/// Call and put identifiers at one strike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionPair {
    pub call: Option<InstrumentId>,
    pub put: Option<InstrumentId>,
}

/// Strike -> legs for one (symbol, expiry).
pub type StrikeLegs = BTreeMap<i64, OptionPair>;

/// The two nested mappings built by one load.
#[derive(Debug, Default)]
pub struct DirectoryData {
    options: HashMap<String, BTreeMap<ExpiryDate, StrikeLegs>>,
    futures: HashMap<String, BTreeMap<ExpiryDate, InstrumentId>>,
    records: usize,
}

impl DirectoryData {
    /// Build from parsed records, keeping the configured segment and
    /// underlyings. The first record wins on a duplicate key.
    pub fn build<I>(records: I, config: &DirectoryConfig) -> Self
    where
        I: IntoIterator<Item = RawInstrument>,
    {
        let mut data = DirectoryData::default();
        let mut dropped = 0usize;

        for raw in records {
            if raw.segment != config.segment || !config.underlyings.contains_key(&normalize_symbol(&raw.name)) {
                continue;
            }
            match raw.classify() {
                InstrumentRecord::Call { symbol, expiry, strike, id } => {
                    data.insert_leg(symbol, expiry, strike, InstrumentSide::Call, id);
                }
                InstrumentRecord::Put { symbol, expiry, strike, id } => {
                    data.insert_leg(symbol, expiry, strike, InstrumentSide::Put, id);
                }
                InstrumentRecord::Future { symbol, expiry, id } => {
                    let slot = data.futures.entry(symbol).or_default();
                    if slot.contains_key(&expiry) {
                        debug!(instrument = %id, %expiry, "Duplicate future ignored");
                    } else {
                        slot.insert(expiry, id);
                        data.records += 1;
                    }
                }
                InstrumentRecord::Unrecognized => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "Dropped unrecognized snapshot records");
        }
        data
    }

    fn insert_leg(&mut self, symbol: String, expiry: ExpiryDate, strike: i64, side: InstrumentSide, id: InstrumentId) {
        let pair = self
            .options
            .entry(symbol)
            .or_default()
            .entry(expiry)
            .or_default()
            .entry(strike)
            .or_default();
        let slot = match side {
            InstrumentSide::Call => &mut pair.call,
            _ => &mut pair.put,
        };
        if slot.is_some() {
            debug!(instrument = %id, strike, %side, "Duplicate option leg ignored");
            return;
        }
        *slot = Some(id);
        self.records += 1;
    }

    /// Number of retained instruments.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Decompress (when gzip) and parse a snapshot document.
///
/// The document is either a bare list of records or `{"data": [...]}`.
/// Records that do not deserialize are skipped.
pub fn parse_snapshot(bytes: &[u8]) -> Result<Vec<RawInstrument>, DirectoryError> {
    let json = if bytes.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::with_capacity(bytes.len() * 8);
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        out
    } else {
        bytes.to_vec()
    };

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Document {
        List(Vec<serde_json::Value>),
        Wrapped { data: Vec<serde_json::Value> },
    }

    let values = match serde_json::from_slice::<Document>(&json)? {
        Document::List(values) | Document::Wrapped { data: values } => values,
    };

    Ok(values
        .into_iter()
        .filter_map(|value| serde_json::from_value::<RawInstrument>(value).ok())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadPhase {
    Pending,
    Loading,
    Ready,
}

/// Returns the phase to `Pending` unless the load it guards completed.
struct LoadClaim<'a> {
    phase: &'a watch::Sender<LoadPhase>,
    done: bool,
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.phase.send_replace(LoadPhase::Pending);
        }
    }
}

pub struct InstrumentDirectory {
    config: DirectoryConfig,
    source: Arc<dyn SnapshotSource>,
    ready: AtomicBool,
    data: OnceLock<DirectoryData>,
    phase: watch::Sender<LoadPhase>,
}

impl InstrumentDirectory {
    pub fn new(config: DirectoryConfig, source: Arc<dyn SnapshotSource>) -> Self {
        let (phase, _) = watch::channel(LoadPhase::Pending);
        Self {
            config,
            source,
            ready: AtomicBool::new(false),
            data: OnceLock::new(),
            phase,
        }
    }

    /// Move `Pending` to `Loading`. Exactly one caller wins each round.
    fn claim_load(&self) -> Option<LoadClaim<'_>> {
        let won = self.phase.send_if_modified(|phase| {
            if *phase == LoadPhase::Pending {
                *phase = LoadPhase::Loading;
                true
            } else {
                false
            }
        });
        won.then_some(LoadClaim {
            phase: &self.phase,
            done: false,
        })
    }

    /// Load the snapshot once. Concurrent and later callers observe the
    /// first successful load without fetching again.
    pub async fn load(&self) -> Result<(), DirectoryError> {
        let mut claim = loop {
            if self.is_ready() {
                return Ok(());
            }
            if let Some(claim) = self.claim_load() {
                break claim;
            }

            // Another caller is fetching; its outcome decides ours.
            let mut rx = self.phase.subscribe();
            let _ = rx.wait_for(|phase| *phase != LoadPhase::Loading).await;
        };

        let bytes = self.source.fetch().await.map_err(|e| {
            warn!(error = %e, "Instrument snapshot fetch failed");
            e
        })?;
        let records = parse_snapshot(&bytes).map_err(|e| {
            warn!(error = %e, "Instrument snapshot parse failed");
            e
        })?;
        let data = DirectoryData::build(records, &self.config);

        info!(
            instruments = data.len(),
            underlyings = data.options.len(),
            segment = %self.config.segment,
            "Instrument directory loaded"
        );

        // Only reachable once: the claim is exclusive until the phase leaves Loading.
        let _ = self.data.set(data);
        self.ready.store(true, Ordering::Release);
        claim.done = true;
        self.phase.send_replace(LoadPhase::Ready);
        Ok(())
    }

    /// Suspend until a load has completed. Never triggers a load.
    pub async fn wait_until_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut rx = self.phase.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|phase| *phase == LoadPhase::Ready).await;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn data(&self) -> Option<&DirectoryData> {
        if self.is_ready() {
            self.data.get()
        } else {
            None
        }
    }

    /// Resolve a full instrument key.
    pub fn resolve(&self, key: &InstrumentKey) -> Option<InstrumentId> {
        match key.side {
            InstrumentSide::Index => self.underlying(&key.symbol),
            InstrumentSide::Future => self.future(&key.symbol, &key.expiry),
            side => {
                let pair = self
                    .data()?
                    .options
                    .get(&normalize_symbol(&key.symbol))?
                    .get(&key.expiry)?
                    .get(&key.strike?)?;
                if side == InstrumentSide::Call {
                    pair.call.clone()
                } else {
                    pair.put.clone()
                }
            }
        }
    }

    /// All strikes listed for a chain.
    pub fn option_chain(&self, key: &ChainKey) -> Option<StrikeLegs> {
        self.data()?
            .options
            .get(&key.symbol)?
            .get(&key.expiry)
            .cloned()
    }

    pub fn future(&self, symbol: &str, expiry: &ExpiryDate) -> Option<InstrumentId> {
        self.data()?
            .futures
            .get(&normalize_symbol(symbol))?
            .get(expiry)
            .cloned()
    }

    /// Index instrument of a configured underlying. Available before load.
    pub fn underlying(&self, symbol: &str) -> Option<InstrumentId> {
        self.config.underlyings.get(&normalize_symbol(symbol)).cloned()
    }

    /// Option expiries listed for a symbol, ascending.
    pub fn expiries(&self, symbol: &str) -> Vec<ExpiryDate> {
        self.data()
            .and_then(|data| data.options.get(&normalize_symbol(symbol)))
            .map(|by_expiry| by_expiry.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of retained instruments (0 before load).
    pub fn len(&self) -> usize {
        self.data().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Serves a fixed document and counts fetches.
    pub struct StaticSource {
        body: Vec<u8>,
        pub fetches: AtomicUsize,
        pub fail_first: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                body,
                fetches: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            })
        }

        pub fn failing(body: Vec<u8>, failures: usize) -> Arc<Self> {
            let source = Self::new(body);
            source.fail_first.store(failures, Ordering::SeqCst);
            source
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<u8>, DirectoryError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if n < self.fail_first.load(Ordering::SeqCst) {
                return Err(DirectoryError::Source {
                    message: "unavailable".to_string(),
                });
            }
            Ok(self.body.clone())
        }
    }

    /// NIFTY 2025-02-26 chain with strikes 21950/22000/22050 plus one future,
    /// and records that must be filtered or dropped.
    pub fn sample_snapshot() -> serde_json::Value {
        serde_json::json!([
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "CE", "expiry": 1740528000000i64, "strike_price": 22000.0, "instrument_key": "NSE_FO|X"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "PE", "expiry": "20250226", "strike_price": 22000.0, "instrument_key": "NSE_FO|Y"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "CE", "expiry": "2025-02-26", "strike_price": 22050.0, "instrument_key": "NSE_FO|C22050"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "PE", "expiry": "2025-02-26", "strike_price": 21950.0, "instrument_key": "NSE_FO|P21950"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "FUT", "expiry": 1740528000000i64, "instrument_key": "NSE_FO|FUT26FEB"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "CE", "expiry": "garbage", "strike_price": 22100.0, "instrument_key": "NSE_FO|BAD"},
            {"segment": "NSE_FO", "name": "RELIANCE", "instrument_type": "CE", "expiry": "2025-02-26", "strike_price": 1200.0, "instrument_key": "NSE_FO|REL"},
            {"segment": "NSE_EQ", "name": "NIFTY", "instrument_type": "EQ", "instrument_key": "NSE_EQ|N"},
            {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "CE"}
        ])
    }

    pub fn gzip(body: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap()
    }

    pub fn sample_source() -> Arc<StaticSource> {
        StaticSource::new(gzip(sample_snapshot().to_string().as_bytes()))
    }
}
