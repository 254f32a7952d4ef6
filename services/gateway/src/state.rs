use std::sync::Arc;

use market_data::directory::{HttpSnapshotSource, InstrumentDirectory, SnapshotSource};
use market_data::registry::ChainRegistry;
use market_data::session::{FeedAuthorizer, FeedSession, HttpFeedAuthorizer, StaticTokenProvider};
use market_data::subscriptions::SubscriptionRegistry;

use crate::config::GatewayConfig;

/// Core instances shared by every connection handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub directory: Arc<InstrumentDirectory>,
    pub session: Arc<FeedSession>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub chains: Arc<ChainRegistry>,
}

impl AppState {
    /// Wire the core against the broker endpoints named in `config`.
    pub fn new(config: GatewayConfig) -> Self {
        let source = Arc::new(HttpSnapshotSource::new(config.instruments_url.clone()));
        let tokens = Arc::new(StaticTokenProvider::new(config.access_token.clone().unwrap_or_default()));
        let authorizer = Arc::new(HttpFeedAuthorizer::new(config.authorize_url.clone(), tokens));
        Self::with_components(config, source, authorizer)
    }

    pub fn with_components(
        config: GatewayConfig,
        source: Arc<dyn SnapshotSource>,
        authorizer: Arc<dyn FeedAuthorizer>,
    ) -> Self {
        let directory = Arc::new(InstrumentDirectory::new(config.directory.clone(), source));
        let session = Arc::new(FeedSession::new(config.feed.clone(), authorizer));
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let chains = Arc::new(ChainRegistry::new(
            config.chain.clone(),
            directory.clone(),
            session.clone(),
            subscriptions.clone(),
        ));

        Self {
            config: Arc::new(config),
            directory,
            session,
            subscriptions,
            chains,
        }
    }
}
