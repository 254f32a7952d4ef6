use crate::handlers::ws;
use crate::state::AppState;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/chain/{symbol}", get(ws::chain_handler))
        .route("/market-data", get(ws::market_data_handler));

    Router::new()
        .nest("/ws", ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
