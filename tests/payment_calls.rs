use atn_client::{AtnError, Funding, LedgerGateway, Multiplier};
use ethers::types::U256;
use std::collections::BTreeSet;

mod common;
use common::{harness, reg_request, PRICE, STARTING_FUNDS};

#[tokio::test]
async fn exhausted_channel_without_funding_fails_before_touching_ledger() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();

    for _ in 0..10 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }
    let transactions = h.ledger.transaction_count().await;

    let err = h.client.call(h.receiver, reg_request()).await.unwrap_err();
    match err {
        AtnError::InsufficientChannelBalance {
            required,
            remaining,
        } => {
            assert_eq!(required, U256::from(PRICE));
            assert_eq!(remaining, U256::zero());
        }
        other => panic!("expected InsufficientChannelBalance, got {:?}", other),
    }
    assert_eq!(h.ledger.transaction_count().await, transactions);

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.balance, channel.deposit);
    assert_eq!(channel.nonce, 10);
}

#[tokio::test]
async fn call_without_channel_and_funding_is_refused() {
    let h = harness(Funding::Disabled).await;

    let err = h.client.call(h.receiver, reg_request()).await.unwrap_err();
    assert!(matches!(err, AtnError::ChannelNotOpen { .. }));
    assert_eq!(h.ledger.transaction_count().await, 0);
}

#[tokio::test]
async fn first_call_opens_channel_with_strategy_deposit() {
    let h = harness(Funding::auto(Multiplier(3))).await;

    h.client.call(h.receiver, reg_request()).await.unwrap();

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.deposit, U256::from(3 * PRICE));
    assert_eq!(channel.balance, U256::from(PRICE));
    assert_eq!(channel.nonce, 1);
}

#[tokio::test]
async fn exhausted_channel_is_topped_up_automatically() {
    let h = harness(Funding::default()).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    for _ in 0..10 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }
    assert_eq!(h.ledger.transaction_count().await, 1);

    h.client.call(h.receiver, reg_request()).await.unwrap();

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.deposit, U256::from(100 + 10 * PRICE));
    assert_eq!(channel.balance, U256::from(11 * PRICE));
    assert_eq!(channel.nonce, 11);
    assert!(!channel.awaiting_provider_sync);
    assert_eq!(h.ledger.transaction_count().await, 2);
    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 200)
    );
}

#[tokio::test]
async fn closure_strategy_drives_topups() {
    let h = harness(Funding::auto(|price: U256| price * U256::from(2))).await;

    for _ in 0..3 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.deposit, U256::from(4 * PRICE));
    assert_eq!(channel.balance, U256::from(3 * PRICE));
    assert!(channel.balance <= channel.deposit);
}

#[tokio::test]
async fn concurrent_calls_get_distinct_increasing_nonces() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = h.client.clone();
            let receiver = h.receiver;
            tokio::spawn(async move { client.call(receiver, reg_request()).await })
        })
        .collect();

    let mut nonces = BTreeSet::new();
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        let body: serde_json::Value = response.json().unwrap();
        nonces.insert(body["nonce"].as_u64().unwrap());
    }
    assert_eq!(nonces, (1..=8).collect::<BTreeSet<u64>>());

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.nonce, 8);
    assert_eq!(channel.balance, U256::from(8 * PRICE));
}

#[tokio::test]
async fn rejected_proof_is_retried_once_with_same_nonce() {
    let h = harness(Funding::default()).await;
    h.client.call(h.receiver, reg_request()).await.unwrap();
    h.dbot.reject_next_calls(1);

    let response = h.client.call(h.receiver, reg_request()).await.unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["nonce"].as_u64(), Some(2));

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.nonce, 2);
    assert_eq!(channel.balance, U256::from(2 * PRICE));
}

#[tokio::test]
async fn second_rejection_is_surfaced_and_rolled_back() {
    let h = harness(Funding::default()).await;
    h.client.call(h.receiver, reg_request()).await.unwrap();
    h.dbot.reject_next_calls(2);

    let err = h.client.call(h.receiver, reg_request()).await.unwrap_err();
    assert!(matches!(err, AtnError::InvalidBalanceProof { .. }));

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.nonce, 1);
    assert_eq!(channel.balance, U256::from(PRICE));

    let response = h.client.call(h.receiver, reg_request()).await.unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["nonce"].as_u64(), Some(2));
}

#[tokio::test]
async fn unknown_endpoint_is_reported_before_paying() {
    let h = harness(Funding::default()).await;

    let err = h
        .client
        .call(h.receiver, atn_client::ApiRequest::new("GET", "/missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::EndpointNotFound { .. }));
    assert!(h.client.get_channel(h.receiver).await.unwrap().is_none());
}

#[tokio::test]
async fn disabling_funding_at_runtime_stops_topups() {
    let mut h = harness(Funding::default()).await;
    h.client.call(h.receiver, reg_request()).await.unwrap();

    let client = std::sync::Arc::get_mut(&mut h.client).unwrap();
    client.set_funding(Funding::Disabled);
    assert!(!client.funding().is_enabled());

    for _ in 0..9 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }
    let err = h.client.call(h.receiver, reg_request()).await.unwrap_err();
    assert!(matches!(err, AtnError::InsufficientChannelBalance { .. }));
    assert_eq!(h.ledger.transaction_count().await, 1);
}
