pub mod dbot;

use crate::middleware::balance_proof_middleware;
use crate::state::dbot::DbotState;
use axum::{
    routing::{any, get},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Routes of a DBot: price lookup, channel status, cooperative close and the
/// paid call endpoint.
pub fn create_dbot_router(state: DbotState) -> Router {
    let verifier = state.clone();
    let paid = Router::new()
        .route("/call/:receiver/*endpoint", any(dbot::paid_call_handler))
        .layer(axum::middleware::from_fn(move |req, next| {
            let state = verifier.clone();
            balance_proof_middleware(state, req, next)
        }));

    Router::new()
        .route("/api/v1/dbots/:receiver/price", get(dbot::price_handler))
        .route(
            "/api/v1/dbots/:receiver/channels/:sender/:open_block",
            get(dbot::channel_handler).delete(dbot::close_handler),
        )
        .with_state(state)
        .merge(paid)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
