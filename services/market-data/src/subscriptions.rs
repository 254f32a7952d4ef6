//! Subscription registry (channel fan-out)
//!
//! Maps a channel key to the live subscriber handles registered under it.
//!
//! Broadcast works in three steps:
//! 1. snapshot the channel's membership under the lock,
//! 2. send to every handle concurrently with no lock held,
//! 3. remove the handles whose send failed under a second short lock.
//!
//! A slow subscriber therefore delays only the broadcast it is part of,
//! never a concurrent `connect` or `disconnect`. Channel entries exist only
//! while they have at least one member.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};
use types::ids::ConnectionId;

use crate::error::DeliveryError;

/// Fixed channel key of the broadcast market-data endpoint.
pub const MARKET_DATA_CHANNEL: &str = "market_data";

/// Opaque subscriber connection handle.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> ConnectionId;

    async fn send(&self, message: &str) -> Result<(), DeliveryError>;

    fn is_alive(&self) -> bool;
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

type Members = HashMap<ConnectionId, Arc<dyn Subscriber>>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: Mutex<HashMap<String, Members>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle to a channel, creating the channel on first member.
    pub fn connect(&self, channel: &str, subscriber: Arc<dyn Subscriber>) {
        let id = subscriber.id();
        let members = {
            let mut channels = self.lock();
            let set = channels.entry(channel.to_string()).or_default();
            set.insert(id, subscriber);
            set.len()
        };
        debug!(channel, connection = %id, members, "Subscriber connected");
    }

    /// Remove a handle; the channel entry goes away with its last member.
    ///
    /// Returns whether the handle was registered.
    pub fn disconnect(&self, channel: &str, id: ConnectionId) -> bool {
        let removed = {
            let mut channels = self.lock();
            remove_member(&mut channels, channel, id)
        };
        if removed {
            debug!(channel, connection = %id, "Subscriber disconnected");
        }
        removed
    }

    /// Send `message` to every current member of `channel`.
    ///
    /// Handles whose send fails are removed after the pass completes.
    pub async fn broadcast(&self, channel: &str, message: &str) -> BroadcastReport {
        let members: Vec<Arc<dyn Subscriber>> = {
            let channels = self.lock();
            match channels.get(channel) {
                Some(set) => set.values().cloned().collect(),
                None => return BroadcastReport::default(),
            }
        };

        let results = join_all(members.iter().map(|subscriber| async move {
            let outcome = if subscriber.is_alive() {
                subscriber.send(message).await
            } else {
                Err(DeliveryError::Closed)
            };
            (subscriber.id(), outcome)
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, outcome) in results {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(channel, connection = %id, error = %e, "Dropping dead subscriber");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut channels = self.lock();
            for id in dead {
                if remove_member(&mut channels, channel, id) {
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Whether a channel currently has an entry.
    pub fn contains_channel(&self, channel: &str) -> bool {
        self.lock().contains_key(channel)
    }

    pub fn is_subscribed(&self, channel: &str, id: ConnectionId) -> bool {
        self.lock()
            .get(channel)
            .map(|set| set.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map(|set| set.len()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Members>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_member(channels: &mut HashMap<String, Members>, channel: &str, id: ConnectionId) -> bool {
    let Some(set) = channels.get_mut(channel) else {
        return false;
    };
    let removed = set.remove(&id).is_some();
    if set.is_empty() {
        channels.remove(channel);
    }
    removed
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Records every message it receives.
    pub struct RecordingSubscriber {
        id: ConnectionId,
        pub messages: Mutex<Vec<String>>,
        alive: AtomicBool,
    }

    impl RecordingSubscriber {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::next(),
                messages: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
            })
        }

        pub fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        pub fn received(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, message: &str) -> Result<(), DeliveryError> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(DeliveryError::Closed);
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    /// Blocks in `send` until released, then fails.
    pub struct StallingSubscriber {
        id: ConnectionId,
        pub entered: Notify,
        pub release: Notify,
    }

    impl StallingSubscriber {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::next(),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl Subscriber for StallingSubscriber {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, _message: &str) -> Result<(), DeliveryError> {
            self.entered.notify_one();
            self.release.notified().await;
            Err(DeliveryError::Timeout { millis: 5000 })
        }

        fn is_alive(&self) -> bool {
            true
        }
    }
}
