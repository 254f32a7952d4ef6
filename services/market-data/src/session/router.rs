//! Tick routing and latest-price board
//!
//! The router maps an instrument identifier to the queues of the builder
//! tasks interested in it. Dispatch snapshots the matching queues under the
//! lock and pushes outside it with `try_send`: the feed loop never waits on
//! a builder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use types::ids::InstrumentId;
use types::tick::Tick;

pub type RouteId = u64;

type Routes = HashMap<InstrumentId, HashMap<RouteId, mpsc::Sender<Tick>>>;

/// Routing outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct TickRouter {
    next_route: AtomicU64,
    routes: Mutex<Routes>,
}

impl TickRouter {
    pub fn new() -> Self {
        Self {
            next_route: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Register one queue for a set of instruments.
    pub fn register(&self, instruments: &[InstrumentId], queue: mpsc::Sender<Tick>) -> RouteId {
        let route = self.next_route.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.lock();
        for id in instruments {
            routes.entry(id.clone()).or_default().insert(route, queue.clone());
        }
        route
    }

    pub fn unregister(&self, route: RouteId, instruments: &[InstrumentId]) {
        let mut routes = self.lock();
        for id in instruments {
            remove_route(&mut routes, id, route);
        }
    }

    /// Hand a tick to every queue registered for its instrument.
    pub fn dispatch(&self, tick: &Tick) -> RouteOutcome {
        let queues: Vec<(RouteId, mpsc::Sender<Tick>)> = {
            let routes = self.lock();
            match routes.get(&tick.instrument_id) {
                Some(by_route) => by_route.iter().map(|(r, q)| (*r, q.clone())).collect(),
                None => return RouteOutcome::default(),
            }
        };

        let mut outcome = RouteOutcome::default();
        let mut closed = Vec::new();
        for (route, queue) in queues {
            match queue.try_send(tick.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    debug!(route, instrument = %tick.instrument_id, "Builder queue full, tick dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(route),
            }
        }

        if !closed.is_empty() {
            let mut routes = self.lock();
            for route in closed {
                remove_route(&mut routes, &tick.instrument_id, route);
            }
        }
        outcome
    }

    pub fn is_routed(&self, instrument: &InstrumentId) -> bool {
        self.lock().contains_key(instrument)
    }

    /// Number of instruments with at least one route.
    pub fn instrument_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TickRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_route(routes: &mut Routes, instrument: &InstrumentId, route: RouteId) {
    if let Some(by_route) = routes.get_mut(instrument) {
        by_route.remove(&route);
        if by_route.is_empty() {
            routes.remove(instrument);
        }
    }
}

/// Latest tick per instrument, for every decoded tick.
#[derive(Default)]
pub struct SpotBoard {
    latest: RwLock<HashMap<InstrumentId, Tick>>,
}

impl SpotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tick unless a newer one is already recorded.
    pub fn update(&self, tick: &Tick) {
        let mut latest = self.latest.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match latest.get(&tick.instrument_id) {
            Some(existing) if existing.observed_at > tick.observed_at => {}
            _ => {
                latest.insert(tick.instrument_id.clone(), tick.clone());
            }
        }
    }

    pub fn latest(&self, instrument: &InstrumentId) -> Option<Tick> {
        self.latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(instrument)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.latest.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
