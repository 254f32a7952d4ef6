use crate::error::AppError;
use crate::state::AppState;
use crate::subscriber::WsSubscriber;
use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, close_code, rejection::WebSocketUpgradeRejection},
    },
    response::Response,
};
use futures::stream::{SplitStream, StreamExt};
use market_data::session::keepalive;
use market_data::subscriptions::{MARKET_DATA_CHANNEL, Subscriber};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use types::expiry::ExpiryInput;
use types::instrument::ChainKey;

#[derive(Debug, Deserialize)]
pub struct ChainQuery {
    pub expiry: Option<String>,
}

/// `GET /ws/chain/{symbol}?expiry=...`
///
/// The key is validated before the upgrade; a missing or sentinel expiry
/// never opens a socket, and neither does a chain the loaded directory
/// does not list.
pub async fn chain_handler(
    Path(symbol): Path<String>,
    Query(query): Query<ChainQuery>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let raw = query.expiry.unwrap_or_default();
    let key = ChainKey::normalize(&symbol, &ExpiryInput::from(raw.as_str()))?;
    if state.directory.is_ready() && !is_listed(&state, &key) {
        return Err(AppError::UnknownChain(key.to_string()));
    }
    let ws = ws.map_err(|e| AppError::BadRequest(e.body_text()))?;

    Ok(ws.on_upgrade(move |socket| serve_chain(socket, state, key)))
}

fn is_listed(state: &AppState, key: &ChainKey) -> bool {
    state
        .directory
        .option_chain(key)
        .is_some_and(|strikes| !strikes.is_empty())
}

async fn serve_chain(socket: WebSocket, state: AppState, key: ChainKey) {
    let (sink, mut inbound) = socket.split();
    let (subscriber, writer) = WsSubscriber::spawn(sink, state.config.send_timeout);
    let channel = key.channel();

    state.subscriptions.connect(&channel, subscriber.clone());
    info!(chain = %key, connection = %subscriber.id(), "Chain subscriber connected");

    let ready = tokio::select! {
        _ = state.directory.wait_until_ready() => true,
        _ = drain(&mut inbound) => false,
    };

    if ready && !is_listed(&state, &key) {
        // Accepted while the directory was still loading
        info!(chain = %key, "Chain not listed; closing connection");
        subscriber.close_with(close_code::POLICY, "unknown chain");
    } else if ready {
        let builder = state.chains.attach(key.clone());
        match builder.build_payload() {
            Ok(payload) => {
                if let Err(e) = subscriber.send(&payload).await {
                    debug!(chain = %key, error = %e, "Initial payload not delivered");
                }
            }
            Err(e) => debug!(chain = %key, error = %e, "Initial payload not serialized"),
        }

        tokio::select! {
            _ = drain(&mut inbound) => {}
            _ = subscriber.closed() => {}
        }
        state.chains.detach(&key);
    }

    state.subscriptions.disconnect(&channel, subscriber.id());
    let connection = subscriber.id();
    finish(subscriber, writer, state.config.send_timeout).await;
    info!(chain = %key, connection = %connection, "Chain subscriber disconnected");
}

/// `GET /ws/market-data`
pub async fn market_data_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_market_data(socket, state))
}

async fn serve_market_data(socket: WebSocket, state: AppState) {
    let (sink, mut inbound) = socket.split();
    let (subscriber, writer) = WsSubscriber::spawn(sink, state.config.send_timeout);

    state.subscriptions.connect(MARKET_DATA_CHANNEL, subscriber.clone());
    debug!(connection = %subscriber.id(), "Market data subscriber connected");

    tokio::select! {
        e = keepalive(subscriber.clone(), state.config.keepalive_interval) => {
            debug!(connection = %subscriber.id(), error = %e, "Keepalive send failed");
        }
        _ = drain(&mut inbound) => {}
        _ = subscriber.closed() => {}
    }

    state.subscriptions.disconnect(MARKET_DATA_CHANNEL, subscriber.id());
    finish(subscriber, writer, state.config.send_timeout).await;
}

/// Drop the handle so the writer flushes and closes; abort it if it hangs.
async fn finish(subscriber: Arc<WsSubscriber>, writer: JoinHandle<()>, grace: Duration) {
    drop(subscriber);
    let abort = writer.abort_handle();
    if tokio::time::timeout(grace * 2, writer).await.is_err() {
        abort.abort();
    }
}

/// Discard client payloads until the client goes away.
async fn drain(inbound: &mut SplitStream<WebSocket>) {
    while let Some(Ok(message)) = inbound.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::router::create_router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use market_data::chain::BuilderState;
    use market_data::directory::SnapshotSource;
    use market_data::error::DirectoryError;
    use market_data::session::FixedFeedUrl;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite};
    use tower::ServiceExt;

    struct StaticSource;

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<u8>, DirectoryError> {
            let body = serde_json::json!([
                {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "CE", "expiry": "2025-02-26", "strike_price": 22000.0, "instrument_key": "NSE_FO|X"},
                {"segment": "NSE_FO", "name": "NIFTY", "instrument_type": "PE", "expiry": "2025-02-26", "strike_price": 22000.0, "instrument_key": "NSE_FO|Y"}
            ]);
            Ok(body.to_string().into_bytes())
        }
    }

    fn state() -> AppState {
        state_with(GatewayConfig {
            keepalive_interval: Duration::from_millis(50),
            ..GatewayConfig::default()
        })
    }

    fn state_with(config: GatewayConfig) -> AppState {
        AppState::with_components(
            config,
            Arc::new(StaticSource),
            Arc::new(FixedFeedUrl::new("ws://127.0.0.1:9/unused")),
        )
    }

    async fn serve(state: AppState) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_missing_expiry_rejected_before_upgrade() {
        let app = create_router(state());
        let response = app
            .oneshot(Request::builder().uri("/ws/chain/NIFTY").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "INVALID_KEY");
    }

    #[tokio::test]
    async fn test_sentinel_expiry_rejected() {
        for expiry in ["undefined", "null", "NaN"] {
            let app = create_router(state());
            let uri = format!("/ws/chain/NIFTY?expiry={}", expiry);
            let response = app
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_rejected_upgrade_over_the_wire() {
        let addr = serve(state()).await;
        let result = connect_async(format!("ws://{}/ws/chain/NIFTY", addr)).await;
        match result {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
            other => panic!("expected http rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unlisted_chain_rejected_before_upgrade() {
        let state = state();
        state.directory.load().await.unwrap();

        for uri in ["/ws/chain/FOOBAR?expiry=2031-07-09", "/ws/chain/NIFTY?expiry=2031-07-09"] {
            let response = create_router(state.clone())
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["error"], "UNKNOWN_CHAIN");
        }
        assert!(state.chains.is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_chain_closed_once_directory_loads() {
        let state = state();
        let addr = serve(state.clone()).await;

        // Accepted because the directory cannot answer yet
        let (mut client, _) = connect_async(format!("ws://{}/ws/chain/FOOBAR?expiry=2031-07-09", addr))
            .await
            .unwrap();
        state.directory.load().await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, tungstenite::protocol::frame::coding::CloseCode::Policy);
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        let key = ChainKey::normalize("FOOBAR", &ExpiryInput::from("2031-07-09")).unwrap();
        eventually(|| !state.subscriptions.contains_channel(&key.channel())).await;
        assert!(state.chains.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_disconnects_chain_subscriber() {
        let state = state_with(GatewayConfig {
            send_timeout: Duration::from_millis(20),
            ..GatewayConfig::default()
        });
        state.directory.load().await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws/chain/NIFTY?expiry=2025-02-26", addr))
            .await
            .unwrap();
        // Initial payload, then the client stops reading
        tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let key = ChainKey::normalize("NIFTY", &ExpiryInput::from("2025-02-26")).unwrap();
        let builder = state.chains.get(&key).unwrap();
        assert_eq!(builder.subscriber_count(), 1);

        let bulk = "x".repeat(1 << 20);
        let mut dropped = 0;
        for _ in 0..1_000 {
            dropped += state.subscriptions.broadcast(&key.channel(), &bulk).await.dropped;
            if dropped > 0 {
                break;
            }
        }
        assert_eq!(dropped, 1);

        eventually(|| builder.state() == BuilderState::Stopped).await;
        assert_eq!(builder.subscriber_count(), 0);
        assert!(!state.subscriptions.contains_channel(&key.channel()));
        drop(client);
    }

    #[tokio::test]
    async fn test_chain_connection_lifecycle() {
        let state = state();
        state.directory.load().await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws/chain/nifty?expiry=20250226", addr))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let payload: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(payload["symbol"], "NIFTY");
        assert_eq!(payload["expiry"], "2025-02-26");
        assert_eq!(payload["strikes"][0]["strike"], 22000);

        let key = ChainKey::normalize("NIFTY", &ExpiryInput::from("2025-02-26")).unwrap();
        let builder = state.chains.get(&key).unwrap();
        assert_eq!(builder.state(), BuilderState::Running);
        assert!(state.subscriptions.contains_channel(&key.channel()));

        client.close(None).await.unwrap();
        eventually(|| builder.state() == BuilderState::Stopped).await;
        eventually(|| !state.subscriptions.contains_channel(&key.channel())).await;
        // The builder outlives its subscribers
        assert_eq!(state.chains.len(), 1);
    }

    #[tokio::test]
    async fn test_market_data_keepalive() {
        let state = state();
        let addr = serve(state.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws/market-data", addr)).await.unwrap();
        let beat = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(beat.to_text().unwrap().contains("heartbeat"));
        assert_eq!(state.subscriptions.subscriber_count(MARKET_DATA_CHANNEL), 1);

        client.close(None).await.unwrap();
        eventually(|| !state.subscriptions.contains_channel(MARKET_DATA_CHANNEL)).await;
    }
}
