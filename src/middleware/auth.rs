use crate::state::dbot::{AcceptedPayment, DbotState};
use crate::types::channel::{
    HEADER_BALANCE, HEADER_CONTRACT, HEADER_NONCE, HEADER_OPEN_BLOCK, HEADER_RECEIVER,
    HEADER_SENDER, HEADER_SIGNATURE,
};
use crate::types::{BalanceProof, ChannelId, ProofError};
use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use ethers::types::{Address, Signature, U256};
use tracing::{debug, warn};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProofError> {
    headers
        .get(name)
        .ok_or(ProofError::Missing)?
        .to_str()
        .map_err(|_| ProofError::Malformed(name.to_string()))
}

fn parse_address(headers: &HeaderMap, name: &str) -> Result<Address, ProofError> {
    header(headers, name)?
        .parse()
        .map_err(|_| ProofError::Malformed(name.to_string()))
}

/// Reads a balance proof from request headers.
pub fn parse_balance_proof(headers: &HeaderMap) -> Result<BalanceProof, ProofError> {
    let signature = header(headers, HEADER_SIGNATURE)?;
    let signature = hex::decode(signature.trim_start_matches("0x"))
        .ok()
        .and_then(|bytes| Signature::try_from(bytes.as_slice()).ok())
        .ok_or_else(|| ProofError::Malformed(HEADER_SIGNATURE.to_string()))?;

    let open_block_number = header(headers, HEADER_OPEN_BLOCK)?
        .parse::<u32>()
        .map_err(|_| ProofError::Malformed(HEADER_OPEN_BLOCK.to_string()))?;
    let balance = U256::from_dec_str(header(headers, HEADER_BALANCE)?)
        .map_err(|_| ProofError::Malformed(HEADER_BALANCE.to_string()))?;
    let nonce = header(headers, HEADER_NONCE)?
        .parse::<u64>()
        .map_err(|_| ProofError::Malformed(HEADER_NONCE.to_string()))?;

    Ok(BalanceProof {
        channel: ChannelId {
            sender: parse_address(headers, HEADER_SENDER)?,
            receiver: parse_address(headers, HEADER_RECEIVER)?,
            open_block_number,
        },
        contract: parse_address(headers, HEADER_CONTRACT)?,
        balance,
        nonce,
        signature,
    })
}

/// `/call/{receiver}/{endpoint}` -> `/{endpoint}`
fn endpoint_uri(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/call/")?;
    let (_, endpoint) = rest.split_once('/')?;
    Some(format!("/{}", endpoint))
}

async fn verify_balance_proof(
    state: &DbotState,
    proof: &BalanceProof,
    uri: &str,
    method: &str,
) -> Result<AcceptedPayment, StatusCode> {
    let price = state
        .price(uri, method)
        .await
        .ok_or(StatusCode::NOT_FOUND)?
        .value;

    if state.record(&proof.channel).await.is_none() {
        state.sync_channel(&proof.channel).await.map_err(|e| {
            warn!(error = %e, "channel sync failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    }

    match state.accept(proof, price).await {
        Ok(charged) => Ok(AcceptedPayment {
            proof: proof.clone(),
            price,
            charged,
        }),
        Err(e) => {
            debug!(error = %e, nonce = proof.nonce, "rejected balance proof");
            Err(StatusCode::from(e))
        }
    }
}

/// Admits a paid call only with an acceptable balance proof for the
/// endpoint's price. The accepted payment is passed on as an extension.
pub async fn balance_proof_middleware(
    state: DbotState,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let proof = parse_balance_proof(request.headers()).map_err(StatusCode::from)?;
    let uri = endpoint_uri(request.uri().path()).ok_or(StatusCode::NOT_FOUND)?;
    let method = request.method().as_str().to_string();

    let payment = verify_balance_proof(&state, &proof, &uri, &method).await?;
    request.extensions_mut().insert(payment);
    Ok(next.run(request).await)
}
