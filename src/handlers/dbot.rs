use crate::state::dbot::{AcceptedPayment, DbotState};
use crate::types::{ChannelId, EndpointPrice, SyncStatus};
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    Extension, Json,
};
use ethers::types::{Address, U256};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    pub uri: String,
    pub method: String,
}

fn own_receiver(state: &DbotState, receiver: &str) -> Result<(), StatusCode> {
    match receiver.parse::<Address>() {
        Ok(address) if address == state.receiver() => Ok(()),
        Ok(_) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::BAD_REQUEST),
    }
}

pub async fn price_handler(
    State(state): State<DbotState>,
    Path(receiver): Path<String>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<EndpointPrice>, StatusCode> {
    own_receiver(&state, &receiver)?;
    state
        .price(&query.uri, &query.method)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// The DBot's view of a channel, refreshed from the ledger first.
pub async fn channel_handler(
    State(state): State<DbotState>,
    Path((receiver, sender, open_block_number)): Path<(String, String, u32)>,
) -> Result<Json<SyncStatus>, StatusCode> {
    let channel = channel_id(&state, &receiver, &sender, open_block_number)?;

    state
        .sync_channel(&channel)
        .await
        .map_err(|e| {
            warn!(error = %e, "channel sync failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
pub struct CloseQuery {
    pub balance: String,
}

fn channel_id(
    state: &DbotState,
    receiver: &str,
    sender: &str,
    open_block_number: u32,
) -> Result<ChannelId, StatusCode> {
    own_receiver(state, receiver)?;
    let sender = sender
        .parse::<Address>()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(ChannelId {
        sender,
        receiver: state.receiver(),
        open_block_number,
    })
}

/// Signs the DBot's side of a cooperative close at the requested balance.
pub async fn close_handler(
    State(state): State<DbotState>,
    Path((receiver, sender, open_block_number)): Path<(String, String, u32)>,
    Query(query): Query<CloseQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let channel = channel_id(&state, &receiver, &sender, open_block_number)?;
    let balance = U256::from_dec_str(&query.balance).map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = state
        .closing_signature(&channel, balance)
        .await
        .map_err(|e| {
            warn!(error = %e, "refused cooperative close");
            StatusCode::from(e)
        })?;
    Ok(Json(serde_json::json!({
        "close_signature": format!("0x{}", hex::encode(signature.to_vec())),
    })))
}

pub async fn paid_call_handler(
    method: Method,
    Extension(payment): Extension<AcceptedPayment>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "method": method.as_str(),
        "price": payment.price.to_string(),
        "balance": payment.proof.balance.to_string(),
        "nonce": payment.proof.nonce,
        "charged": payment.charged.to_string(),
    }))
}
