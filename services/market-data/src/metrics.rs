//! Counters for the streaming core
//!
//! Tracks frames received from upstream, decode outcomes, routing drops,
//! fan-out results and reconnects. Plain atomics; reading them never
//! blocks the feed loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the feed session and fan-out.
pub struct FeedMetrics {
    // Upstream
    pub frames_received: AtomicU64,
    pub ticks_decoded: AtomicU64,
    pub entries_skipped: AtomicU64,
    pub reconnects: AtomicU64,
    pub decode_latency_ns: Mutex<LatencyTracker>,

    // Routing
    pub ticks_routed: AtomicU64,
    pub ticks_dropped: AtomicU64,

    // Fan-out
    pub messages_delivered: AtomicU64,
    pub subscribers_dropped: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            ticks_decoded: AtomicU64::new(0),
            entries_skipped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            decode_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            ticks_routed: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
        }
    }

    /// Record one decoded frame.
    pub fn record_frame(&self, ticks: usize, skipped: usize, latency_ns: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.ticks_decoded.fetch_add(ticks as u64, Ordering::Relaxed);
        self.entries_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        if let Ok(mut tracker) = self.decode_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    /// Record the routing outcome of one tick.
    pub fn record_route(&self, delivered: usize, dropped: usize) {
        self.ticks_routed.fetch_add(delivered as u64, Ordering::Relaxed);
        self.ticks_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Record a fan-out pass.
    pub fn record_broadcast(&self, delivered: usize, dropped: usize) {
        self.messages_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.subscribers_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Export counters keyed by name.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("frames_received".to_string(), self.frames_received.load(Ordering::Relaxed));
        m.insert("ticks_decoded".to_string(), self.ticks_decoded.load(Ordering::Relaxed));
        m.insert("entries_skipped".to_string(), self.entries_skipped.load(Ordering::Relaxed));
        m.insert("reconnects".to_string(), self.reconnects.load(Ordering::Relaxed));
        m.insert("ticks_routed".to_string(), self.ticks_routed.load(Ordering::Relaxed));
        m.insert("ticks_dropped".to_string(), self.ticks_dropped.load(Ordering::Relaxed));
        m.insert("messages_delivered".to_string(), self.messages_delivered.load(Ordering::Relaxed));
        m.insert("subscribers_dropped".to_string(), self.subscribers_dropped.load(Ordering::Relaxed));
        if let Ok(tracker) = self.decode_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("decode_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of the most recent latency samples.
pub struct LatencyTracker {
    window: VecDeque<u64>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Add a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Nearest-rank percentile over the window (`p` in 0..=100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();

        let rank = p.min(100) * (sorted.len() - 1) / 100;
        sorted.get(rank).copied()
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_recording() {
        let metrics = FeedMetrics::new();

        metrics.record_frame(3, 1, 500);
        metrics.record_frame(2, 0, 700);

        let exported = metrics.export();
        assert_eq!(exported["frames_received"], 2);
        assert_eq!(exported["ticks_decoded"], 5);
        assert_eq!(exported["entries_skipped"], 1);
        assert!(exported.contains_key("decode_p99_ns"));
    }

    #[test]
    fn test_route_and_broadcast_recording() {
        let metrics = FeedMetrics::new();
        metrics.record_route(2, 1);
        metrics.record_broadcast(4, 1);
        metrics.record_reconnect();

        let exported = metrics.export();
        assert_eq!(exported["ticks_routed"], 2);
        assert_eq!(exported["ticks_dropped"], 1);
        assert_eq!(exported["messages_delivered"], 4);
        assert_eq!(exported["subscribers_dropped"], 1);
        assert_eq!(exported["reconnects"], 1);
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);

        tracker.record(10);
        tracker.record(20);
        tracker.record(30);
        tracker.record(40); // evicts 10

        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.percentile(0), Some(20));
        assert_eq!(tracker.percentile(100), Some(40));
        assert_eq!(LatencyTracker::new(4).percentile(50), None);
    }
}
