//! Chain builder registry
//!
//! Exactly one builder per normalized (symbol, expiry) for the process
//! lifetime. Keys are normalized before lookup, so every accepted expiry
//! encoding of the same date lands on the same entry. Creation goes
//! through the map's entry API: concurrent first requests for one key
//! construct a single builder.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use types::errors::KeyError;
use types::expiry::ExpiryInput;
use types::instrument::ChainKey;

use crate::chain::{ChainBuilder, ChainConfig};
use crate::directory::InstrumentDirectory;
use crate::session::FeedSession;
use crate::subscriptions::SubscriptionRegistry;

pub struct ChainRegistry {
    builders: DashMap<ChainKey, Arc<ChainBuilder>>,
    config: ChainConfig,
    directory: Arc<InstrumentDirectory>,
    session: Arc<FeedSession>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl ChainRegistry {
    pub fn new(
        config: ChainConfig,
        directory: Arc<InstrumentDirectory>,
        session: Arc<FeedSession>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            builders: DashMap::new(),
            config,
            directory,
            session,
            subscriptions,
        }
    }

    /// Shared builder for the normalized key, created on first request.
    pub fn get_or_create(&self, symbol: &str, expiry: &ExpiryInput) -> Result<Arc<ChainBuilder>, KeyError> {
        let key = ChainKey::normalize(symbol, expiry)?;
        Ok(self.get_or_create_key(key))
    }

    pub fn get_or_create_key(&self, key: ChainKey) -> Arc<ChainBuilder> {
        self.builders
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(chain = %key, "Creating chain builder");
                Arc::new(ChainBuilder::new(
                    key,
                    self.config.clone(),
                    self.directory.clone(),
                    self.session.clone(),
                    self.subscriptions.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// Builder for the key and one more attached subscriber; starts it on
    /// the first.
    pub fn attach(&self, key: ChainKey) -> Arc<ChainBuilder> {
        let builder = self.get_or_create_key(key);
        builder.retain();
        builder
    }

    /// Detach one subscriber; the builder stops with the last. Returns the
    /// remaining count.
    pub fn detach(&self, key: &ChainKey) -> usize {
        let builder = self.builders.get(key).map(|entry| entry.value().clone());
        builder.map(|b| b.release()).unwrap_or(0)
    }

    pub fn get(&self, key: &ChainKey) -> Option<Arc<ChainBuilder>> {
        self.builders.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{harness, nifty_feb, Harness};
    use crate::chain::BuilderState;

    fn registry(h: &Harness) -> Arc<ChainRegistry> {
        Arc::new(ChainRegistry::new(
            ChainConfig::default(),
            h.directory.clone(),
            h.session.clone(),
            h.subscriptions.clone(),
        ))
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_builder() {
        let h = harness().await;
        let registry = registry(&h);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .get_or_create("NIFTY", &ExpiryInput::from("2025-02-26"))
                        .unwrap()
                })
            })
            .collect();

        let mut builders = Vec::new();
        for handle in handles {
            builders.push(handle.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert!(builders.iter().all(|b| Arc::ptr_eq(b, &builders[0])));
    }

    #[tokio::test]
    async fn test_expiry_encodings_hit_one_entry() {
        let h = harness().await;
        let registry = registry(&h);

        let a = registry.get_or_create("NIFTY", &ExpiryInput::Millis(1_740_528_000_000)).unwrap();
        let b = registry.get_or_create("nifty", &ExpiryInput::from("20250226")).unwrap();
        let c = registry.get_or_create("NIFTY", &ExpiryInput::from("2025-02-26")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.channel(), "NIFTY:2025-02-26");
    }

    #[tokio::test]
    async fn test_bad_keys_are_rejected() {
        let h = harness().await;
        let registry = registry(&h);

        assert_eq!(
            registry.get_or_create("NIFTY", &ExpiryInput::from("")).err(),
            Some(KeyError::MissingExpiry)
        );
        assert!(registry.get_or_create("NIFTY", &ExpiryInput::from("undefined")).is_err());
        assert!(registry.get_or_create("  ", &ExpiryInput::from("2025-02-26")).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_same_instance_after_restart() {
        let h = harness().await;
        let registry = registry(&h);

        let first = registry.attach(nifty_feb());
        assert_eq!(registry.detach(&nifty_feb()), 0);
        assert_eq!(first.state(), BuilderState::Stopped);

        let second = registry.attach(nifty_feb());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), BuilderState::Running);
        registry.detach(&nifty_feb());
    }

    #[tokio::test]
    async fn test_attach_detach_counts_subscribers() {
        let h = harness().await;
        let registry = registry(&h);

        let builder = registry.attach(nifty_feb());
        registry.attach(nifty_feb());
        assert_eq!(builder.subscriber_count(), 2);

        assert_eq!(registry.detach(&nifty_feb()), 1);
        assert_eq!(builder.state(), BuilderState::Running);
        assert_eq!(registry.detach(&nifty_feb()), 0);
        assert_eq!(builder.state(), BuilderState::Stopped);

        // Unknown keys are harmless
        let other = ChainKey::new("BANKNIFTY", nifty_feb().expiry).unwrap();
        assert_eq!(registry.detach(&other), 0);
        assert_eq!(registry.len(), 1);
    }
}
