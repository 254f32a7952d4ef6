//! Upstream collaborators of the feed session
//!
//! The bearer credential and the authorized websocket URL come from
//! outside the core; both sit behind traits so the session can be driven
//! by a local server in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ids::InstrumentId;
use uuid::Uuid;

use crate::error::FeedError;

/// Broker endpoint that exchanges a bearer token for a one-time feed URL.
pub const DEFAULT_AUTHORIZE_URL: &str = "https://api.upstox.com/v3/feed/market-data-feed/authorize";

/// Yields a valid bearer credential.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, FeedError>;
}

/// Token supplied by configuration.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, FeedError> {
        if self.token.trim().is_empty() {
            return Err(FeedError::Token {
                message: "empty access token".to_string(),
            });
        }
        Ok(self.token.clone())
    }
}

/// Resolves the websocket URL to connect to.
#[async_trait]
pub trait FeedAuthorizer: Send + Sync {
    async fn authorize(&self) -> Result<String, FeedError>;
}

/// Always connects to the same URL.
pub struct FixedFeedUrl {
    url: String,
}

impl FixedFeedUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedAuthorizer for FixedFeedUrl {
    async fn authorize(&self) -> Result<String, FeedError> {
        Ok(self.url.clone())
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    data: AuthorizeData,
}

#[derive(Debug, Deserialize)]
struct AuthorizeData {
    #[serde(alias = "authorizedRedirectUri")]
    authorized_redirect_uri: String,
}

/// Calls the broker's authorize endpoint with the bearer credential.
pub struct HttpFeedAuthorizer {
    client: reqwest::Client,
    authorize_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpFeedAuthorizer {
    pub fn new(authorize_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            authorize_url: authorize_url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl FeedAuthorizer for HttpFeedAuthorizer {
    async fn authorize(&self) -> Result<String, FeedError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(&self.authorize_url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FeedError::Authorize { message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Authorize {
                message: format!("authorize endpoint returned {}", status),
            });
        }

        let body: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Authorize { message: e.to_string() })?;
        debug!("Feed URL authorized");
        Ok(body.data.authorized_redirect_uri)
    }
}

/// Subscription request sent upstream as a binary frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    pub guid: String,
    pub method: &'static str,
    pub data: SubscriptionData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionData {
    pub mode: &'static str,
    #[serde(rename = "instrumentKeys")]
    pub instrument_keys: Vec<String>,
}

impl SubscriptionRequest {
    pub fn subscribe(instruments: &[InstrumentId]) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            method: "sub",
            data: SubscriptionData {
                mode: "full",
                instrument_keys: instruments.iter().map(|id| id.as_str().to_string()).collect(),
            },
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        // Serializing plain strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_frame_shape() {
        let request = SubscriptionRequest::subscribe(&[InstrumentId::new("NSE_FO|X"), InstrumentId::new("NSE_FO|Y")]);
        let value: serde_json::Value = serde_json::from_slice(&request.to_frame()).unwrap();

        assert_eq!(value["method"], "sub");
        assert_eq!(value["data"]["mode"], "full");
        assert_eq!(value["data"]["instrumentKeys"][1], "NSE_FO|Y");
        assert!(!value["guid"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_authorize_response_accepts_both_casings() {
        let snake: AuthorizeResponse =
            serde_json::from_str(r#"{"status":"success","data":{"authorized_redirect_uri":"wss://a"}}"#).unwrap();
        let camel: AuthorizeResponse =
            serde_json::from_str(r#"{"status":"success","data":{"authorizedRedirectUri":"wss://b"}}"#).unwrap();
        assert_eq!(snake.data.authorized_redirect_uri, "wss://a");
        assert_eq!(camel.data.authorized_redirect_uri, "wss://b");
    }

    #[tokio::test]
    async fn test_static_token_rejects_empty() {
        assert!(StaticTokenProvider::new("  ").access_token().await.is_err());
        assert_eq!(StaticTokenProvider::new("abc").access_token().await.unwrap(), "abc");
    }
}
