use atn_client::{AtnClient, AtnError, ChannelState, Funding, LedgerGateway, SyncPolicy};
use ethers::{signers::Signer, types::U256};
use std::time::Duration;

mod common;
use common::{
    cooperative_harness, dbot_info, harness, harness_with_sync, random_wallet, reg_request,
    PRICE, SETTLE_TIMEOUT, STARTING_FUNDS,
};

#[tokio::test]
async fn open_channel_starts_empty_and_first_call_pays_price() {
    let h = harness(Funding::Disabled).await;

    let channel = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    assert_eq!(channel.state, ChannelState::Open);
    assert_eq!(channel.deposit, U256::from(100));
    assert_eq!(channel.balance, U256::zero());
    assert_eq!(channel.nonce, 0);

    let response = h.client.call(h.receiver, reg_request()).await.unwrap();
    assert!(response.is_success());

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.balance, U256::from(PRICE));
    assert_eq!(channel.nonce, 1);
    assert!(!channel.awaiting_provider_sync);

    let record = h.client.get_dbot_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(record.balance, U256::from(PRICE));
    assert_eq!(record.nonce, 1);
}

#[tokio::test]
async fn open_channel_is_idempotent() {
    let h = harness(Funding::Disabled).await;

    let first = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    let second = h
        .client
        .open_channel(h.receiver, U256::from(500))
        .await
        .unwrap();

    assert_eq!(first.open_block_number, second.open_block_number);
    assert_eq!(second.deposit, U256::from(100));
    assert_eq!(h.ledger.transaction_count().await, 1);
}

#[tokio::test]
async fn open_channel_without_funds_leaves_no_channel() {
    let h = harness(Funding::Disabled).await;

    let err = h
        .client
        .open_channel(h.receiver, U256::from(STARTING_FUNDS + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::InsufficientFunds { .. }));
    assert!(h.client.get_channel(h.receiver).await.unwrap().is_none());
    assert_eq!(h.ledger.transaction_count().await, 0);
}

#[tokio::test]
async fn reverted_open_restores_previous_state() {
    let h = harness(Funding::Disabled).await;
    h.ledger.fail_next_transaction("out of gas").await;

    let err = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::LedgerTransaction { .. }));
    assert!(h.client.channels().cached(h.receiver).await.is_none());

    let channel = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    assert_eq!(channel.state, ChannelState::Open);
}

#[tokio::test]
async fn topup_requires_an_open_channel() {
    let h = harness(Funding::Disabled).await;

    let err = h
        .client
        .topup_channel(h.receiver, U256::from(50))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::ChannelNotOpen { .. }));
}

#[tokio::test]
async fn topup_waits_for_sync_before_next_proof() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    h.client.call(h.receiver, reg_request()).await.unwrap();

    let channel = h
        .client
        .topup_channel(h.receiver, U256::from(50))
        .await
        .unwrap();
    assert_eq!(channel.deposit, U256::from(150));
    assert!(channel.awaiting_provider_sync);

    let channel = h.client.wait_dbot_sync(h.receiver).await.unwrap();
    assert!(!channel.awaiting_provider_sync);
    assert_eq!(channel.deposit, U256::from(150));
    assert_eq!(channel.balance, U256::from(PRICE));
    assert_eq!(channel.nonce, 1);
}

#[tokio::test]
async fn close_and_settle_split_the_deposit() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    for _ in 0..7 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }

    let closed = h.client.close_channel(h.receiver).await.unwrap();
    assert_eq!(closed.state, ChannelState::Closed);
    assert_eq!(closed.balance, U256::from(70));
    let settle_block = closed.settle_block_number.unwrap();

    let err = h.client.settle_channel(h.receiver).await.unwrap_err();
    match err {
        AtnError::SettlePeriodActive { remaining_blocks } => {
            let current = h.ledger.block_number().await.unwrap();
            assert_eq!(remaining_blocks, settle_block - current);
        }
        other => panic!("expected SettlePeriodActive, got {:?}", other),
    }

    let current = h.ledger.block_number().await.unwrap();
    h.ledger.advance_blocks(settle_block - current).await;
    let settled = h.client.settle_channel(h.receiver).await.unwrap();
    assert_eq!(settled.state, ChannelState::Settled);

    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 70)
    );
    assert_eq!(h.ledger.balance_of(h.receiver).await.unwrap(), U256::from(70));
    assert!(h.client.get_channel(h.receiver).await.unwrap().is_none());
}

#[tokio::test]
async fn settle_requires_a_closed_channel() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();

    let err = h.client.settle_channel(h.receiver).await.unwrap_err();
    assert!(matches!(err, AtnError::ChannelNotClosed { .. }));
}

#[tokio::test]
async fn failed_close_keeps_channel_open() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    h.ledger.fail_next_transaction("reverted").await;

    let err = h.client.close_channel(h.receiver).await.unwrap_err();
    assert!(matches!(err, AtnError::LedgerTransaction { .. }));

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.state, ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn lagging_dbot_times_out_and_blocks_new_proofs() {
    let sync = SyncPolicy {
        poll_interval: Duration::from_secs(5),
        timeout: Duration::from_secs(25),
    };
    let h = harness_with_sync(Funding::Disabled, sync).await;
    h.dbot.set_lagging(true);
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();

    let err = h.client.wait_dbot_sync(h.receiver).await.unwrap_err();
    match err {
        AtnError::SyncTimeout { waited, .. } => assert_eq!(waited, Duration::from_secs(25)),
        other => panic!("expected SyncTimeout, got {:?}", other),
    }

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert!(channel.awaiting_provider_sync);
    assert_eq!(channel.deposit, U256::from(100));

    let err = h
        .client
        .channels()
        .next_balance_proof(h.receiver, U256::from(PRICE))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::AwaitingProviderSync { .. }));

    let err = h.client.call(h.receiver, reg_request()).await.unwrap_err();
    assert!(matches!(err, AtnError::SyncTimeout { .. }));
    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.nonce, 0);
    assert_eq!(channel.balance, U256::zero());
}

#[tokio::test]
async fn ledger_deposit_wins_when_sync_times_out() {
    let h = harness(Funding::Disabled).await;
    let channel = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    h.client.call(h.receiver, reg_request()).await.unwrap();

    // Deposit made outside this client while the DBot stops reading the ledger.
    h.dbot.set_lagging(true);
    h.ledger
        .deposit(&channel.id(), U256::from(50))
        .await
        .unwrap();

    let err = h.client.wait_dbot_sync(h.receiver).await.unwrap_err();
    assert!(matches!(err, AtnError::SyncTimeout { .. }));

    let channel = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(channel.deposit, U256::from(150));
    assert_eq!(channel.balance, U256::from(PRICE));
    assert_eq!(channel.nonce, 1);
    assert!(channel.awaiting_provider_sync);

    h.dbot.set_lagging(false);
    let channel = h.client.wait_dbot_sync(h.receiver).await.unwrap();
    assert!(!channel.awaiting_provider_sync);
    assert_eq!(channel.deposit, U256::from(150));
}

#[tokio::test]
async fn reopened_pair_still_settles_closed_channel() {
    let h = harness(Funding::default()).await;
    let first = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    for _ in 0..7 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }
    let closed = h.client.close_channel(h.receiver).await.unwrap();
    assert_eq!(closed.state, ChannelState::Closed);

    // The next call funds a fresh channel with the same DBot.
    h.client.call(h.receiver, reg_request()).await.unwrap();
    let current = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_ne!(current.open_block_number, first.open_block_number);
    assert_eq!(current.balance, U256::from(PRICE));

    let pending = h.client.pending_settlement(h.receiver).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].open_block_number, first.open_block_number);

    h.ledger.advance_blocks(u64::from(SETTLE_TIMEOUT)).await;
    let settled = h.client.settle_channel(h.receiver).await.unwrap();
    assert_eq!(settled.open_block_number, first.open_block_number);
    assert_eq!(settled.state, ChannelState::Settled);

    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 100 - 100 + 30)
    );
    assert_eq!(h.ledger.balance_of(h.receiver).await.unwrap(), U256::from(70));
    assert!(h.client.pending_settlement(h.receiver).await.is_empty());

    let current = h.client.get_channel(h.receiver).await.unwrap().unwrap();
    assert_eq!(current.state, ChannelState::Open);
    assert_eq!(current.balance, U256::from(PRICE));
}

#[tokio::test]
async fn closed_channel_found_only_on_ledger_is_settled() {
    let h = harness(Funding::Disabled).await;
    let first = h
        .client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    h.client.call(h.receiver, reg_request()).await.unwrap();
    h.client.close_channel(h.receiver).await.unwrap();
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();

    // A restarted client for the same sender starts with an empty cache.
    let restarted = AtnClient::new(h.wallet.clone(), h.ledger.clone(), h.dbot.clone())
        .with_funding(Funding::Disabled);
    assert!(restarted.pending_settlement(h.receiver).await.is_empty());

    h.ledger.advance_blocks(u64::from(SETTLE_TIMEOUT)).await;
    let settled = restarted.settle_channel(h.receiver).await.unwrap();
    assert_eq!(settled.open_block_number, first.open_block_number);
    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 100 - 100 + (100 - PRICE))
    );

    let err = restarted.settle_channel(h.receiver).await.unwrap_err();
    assert!(matches!(err, AtnError::ChannelNotClosed { .. }));
}

#[tokio::test]
async fn cooperative_close_settles_immediately() {
    let h = cooperative_harness(Funding::Disabled, true).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    for _ in 0..7 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }

    let closed = h.client.close_channel(h.receiver).await.unwrap();
    assert_eq!(closed.state, ChannelState::Settled);
    assert_eq!(closed.balance, U256::from(70));

    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 70)
    );
    assert_eq!(h.ledger.balance_of(h.receiver).await.unwrap(), U256::from(70));
    assert!(h.client.get_channel(h.receiver).await.unwrap().is_none());
    assert!(h.client.pending_settlement(h.receiver).await.is_empty());

    let err = h.client.settle_channel(h.receiver).await.unwrap_err();
    assert!(matches!(err, AtnError::ChannelNotClosed { .. }));
}

#[tokio::test]
async fn unrecognized_closing_signer_falls_back_to_uncooperative_close() {
    // The DBot signs, but its owner is not registered on the ledger.
    let h = cooperative_harness(Funding::Disabled, false).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    h.client.call(h.receiver, reg_request()).await.unwrap();

    let closed = h.client.close_channel(h.receiver).await.unwrap();
    assert_eq!(closed.state, ChannelState::Closed);
    assert_eq!(closed.balance, U256::from(PRICE));
    assert!(closed.settle_block_number.is_some());
    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 100)
    );
}

#[tokio::test]
async fn uncooperative_close_claims_chosen_balance() {
    let h = harness(Funding::Disabled).await;
    h.client
        .open_channel(h.receiver, U256::from(100))
        .await
        .unwrap();
    for _ in 0..3 {
        h.client.call(h.receiver, reg_request()).await.unwrap();
    }

    let err = h
        .client
        .uncooperative_close_channel(h.receiver, U256::from(101))
        .await
        .unwrap_err();
    assert!(matches!(err, AtnError::InsufficientChannelBalance { .. }));

    let closed = h
        .client
        .uncooperative_close_channel(h.receiver, U256::from(20))
        .await
        .unwrap();
    assert_eq!(closed.state, ChannelState::Closed);
    assert_eq!(closed.balance, U256::from(20));

    h.ledger.advance_blocks(u64::from(SETTLE_TIMEOUT)).await;
    h.client.settle_channel(h.receiver).await.unwrap();
    assert_eq!(
        h.ledger.balance_of(h.sender).await.unwrap(),
        U256::from(STARTING_FUNDS - 20)
    );
    assert_eq!(h.ledger.balance_of(h.receiver).await.unwrap(), U256::from(20));
}

#[tokio::test]
async fn dbot_info_comes_from_the_ledger() {
    let h = cooperative_harness(Funding::Disabled, true).await;

    let info = h.client.get_dbot_info(h.receiver).await.unwrap();
    assert_eq!(info, dbot_info(h.receiver, info.owner));
    assert_ne!(info.owner, h.receiver);

    let unknown = random_wallet().address();
    let err = h.client.get_dbot_info(unknown).await.unwrap_err();
    assert!(matches!(err, AtnError::DbotNotFound { address } if address == unknown));
}
