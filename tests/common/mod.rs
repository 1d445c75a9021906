#![allow(dead_code)]

use atn_client::{AtnClient, DbotInfo, Funding, InMemoryDbot, InMemoryLedger, SyncPolicy};
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use std::{sync::Arc, time::Duration};

pub const PRICE: u64 = 10;
pub const SETTLE_TIMEOUT: u32 = 5;
pub const STARTING_FUNDS: u64 = 10_000;

pub struct Harness {
    pub client: Arc<AtnClient>,
    pub ledger: Arc<InMemoryLedger>,
    pub dbot: Arc<InMemoryDbot>,
    pub wallet: LocalWallet,
    pub sender: Address,
    pub receiver: Address,
}

pub fn random_wallet() -> LocalWallet {
    LocalWallet::new(&mut rand::thread_rng())
}

pub fn fast_sync() -> SyncPolicy {
    SyncPolicy {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
    }
}

pub async fn ledger_for(sender: Address) -> Arc<InMemoryLedger> {
    let ledger = Arc::new(InMemoryLedger::new(
        Address::from_low_u64_be(0xc0de),
        SETTLE_TIMEOUT,
    ));
    ledger.fund(sender, U256::from(STARTING_FUNDS)).await;
    ledger
}

/// Client and DBot sharing one in-memory ledger; `POST /reg` costs `PRICE`.
pub async fn harness(funding: Funding) -> Harness {
    harness_with_sync(funding, fast_sync()).await
}

pub async fn harness_with_sync(funding: Funding, sync: SyncPolicy) -> Harness {
    build(funding, sync, None).await
}

/// A DBot whose owner signs cooperative closes. The owner is registered on
/// the ledger only when `registered` is set.
pub async fn cooperative_harness(funding: Funding, registered: bool) -> Harness {
    let owner = random_wallet();
    let h = build(funding, fast_sync(), Some(owner.clone())).await;
    if registered {
        h.ledger.register_dbot(dbot_info(h.receiver, owner.address())).await;
    }
    h
}

pub fn dbot_info(address: Address, owner: Address) -> DbotInfo {
    DbotInfo {
        address,
        name: "moon-names".to_string(),
        domain: "dbot.example.com".to_string(),
        owner,
    }
}

async fn build(funding: Funding, sync: SyncPolicy, closer: Option<LocalWallet>) -> Harness {
    let wallet = random_wallet();
    let sender = wallet.address();
    let receiver = random_wallet().address();

    let ledger = ledger_for(sender).await;
    let mut dbot = InMemoryDbot::new(receiver, ledger.clone());
    if let Some(owner) = closer {
        dbot = dbot.with_closer(owner);
    }
    let dbot = Arc::new(dbot);
    dbot.set_price("POST", "/reg", U256::from(PRICE)).await;

    let client = AtnClient::new(wallet.clone(), ledger.clone(), dbot.clone())
        .with_funding(funding)
        .with_sync_policy(sync);

    Harness {
        client: Arc::new(client),
        ledger,
        dbot,
        wallet,
        sender,
        receiver,
    }
}

pub fn reg_request() -> atn_client::ApiRequest {
    atn_client::ApiRequest::new("POST", "/reg").json(serde_json::json!({"theme": "moon"}))
}
