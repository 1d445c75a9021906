use crate::network::LedgerGateway;
use crate::types::{BalanceProof, ChannelId, EndpointPrice, ProofError, Result, SyncStatus};
use crate::utils::crypto::{sign_closing, verify_balance_proof};
use ethers::{
    signers::LocalWallet,
    types::{Address, Signature, U256},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Handed to paid handlers once the proof for the request was accepted.
#[derive(Clone, Debug)]
pub struct AcceptedPayment {
    pub proof: BalanceProof,
    pub price: U256,
    /// Increment over the previously held balance.
    pub charged: U256,
}

/// Off-chain channel records of a DBot. Only the highest-nonce proof per
/// channel is kept.
#[derive(Clone)]
pub struct DbotState {
    receiver: Address,
    contract: Address,
    channels: Arc<RwLock<HashMap<ChannelId, SyncStatus>>>,
    prices: Arc<RwLock<HashMap<(String, String), U256>>>,
    ledger: Arc<dyn LedgerGateway>,
    closer: Option<LocalWallet>,
}

fn endpoint_key(uri: &str, method: &str) -> (String, String) {
    (
        format!("/{}", uri.trim_start_matches('/')),
        method.to_uppercase(),
    )
}

impl DbotState {
    pub fn new(receiver: Address, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self {
            receiver,
            contract: ledger.contract_address(),
            channels: Arc::new(RwLock::new(HashMap::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            ledger,
            closer: None,
        }
    }

    /// Lets the DBot agree to cooperative closes, signing with the owner key.
    pub fn with_closer(mut self, owner: LocalWallet) -> Self {
        self.closer = Some(owner);
        self
    }

    pub fn receiver(&self) -> Address {
        self.receiver
    }

    pub async fn set_price(&self, method: &str, uri: &str, value: U256) {
        self.prices
            .write()
            .await
            .insert(endpoint_key(uri, method), value);
    }

    pub async fn price(&self, uri: &str, method: &str) -> Option<EndpointPrice> {
        let prices = self.prices.read().await;
        prices
            .get(&endpoint_key(uri, method))
            .map(|value| EndpointPrice {
                value: *value,
                token: self.contract,
            })
    }

    pub async fn record(&self, channel: &ChannelId) -> Option<SyncStatus> {
        self.channels.read().await.get(channel).copied()
    }

    /// Pulls the channel's deposit from the ledger into the local record.
    pub async fn sync_channel(&self, channel: &ChannelId) -> Result<Option<SyncStatus>> {
        let view = self
            .ledger
            .get_channel(channel.sender, channel.receiver)
            .await?;

        let mut channels = self.channels.write().await;
        match view {
            Some(view) if view.id() == *channel && view.is_open() => {
                let record = channels.entry(*channel).or_default();
                if record.deposit != view.deposit {
                    info!(
                        sender = ?channel.sender,
                        open_block = channel.open_block_number,
                        deposit = %view.deposit,
                        "synced channel deposit"
                    );
                    record.deposit = view.deposit;
                }
                Ok(Some(*record))
            }
            _ => Ok(channels.get(channel).copied()),
        }
    }

    /// Takes `proof` as payment of `price`. The stored record only ever
    /// advances, so a replayed proof is refused rather than served twice.
    pub async fn accept(
        &self,
        proof: &BalanceProof,
        price: U256,
    ) -> std::result::Result<U256, ProofError> {
        if proof.contract != self.contract || proof.channel.receiver != self.receiver {
            return Err(ProofError::WrongChannel);
        }

        let signer = verify_balance_proof(proof).map_err(|_| ProofError::InvalidSignature)?;
        if signer != proof.channel.sender {
            debug!(?signer, sender = ?proof.channel.sender, "signer mismatch");
            return Err(ProofError::InvalidSignature);
        }

        let mut channels = self.channels.write().await;
        let record = channels
            .get_mut(&proof.channel)
            .ok_or(ProofError::UnknownChannel)?;

        if proof.nonce == record.nonce && proof.balance == record.balance && proof.nonce > 0 {
            return Err(ProofError::Replayed);
        }
        if proof.nonce <= record.nonce {
            return Err(ProofError::StaleNonce {
                held: record.nonce,
                received: proof.nonce,
            });
        }
        if proof.balance > record.deposit {
            return Err(ProofError::InsufficientBalance);
        }
        if proof.balance < record.balance.saturating_add(price) {
            return Err(ProofError::Underpaid);
        }

        let charged = proof.balance - record.balance;
        record.balance = proof.balance;
        record.nonce = proof.nonce;
        debug!(nonce = proof.nonce, balance = %proof.balance, "accepted balance proof");
        Ok(charged)
    }

    /// Signs the DBot's agreement to close `channel` at `balance`. Closing
    /// below the balance already redeemed is refused.
    pub async fn closing_signature(
        &self,
        channel: &ChannelId,
        balance: U256,
    ) -> std::result::Result<Signature, ProofError> {
        let owner = self.closer.as_ref().ok_or(ProofError::CloseUnsupported)?;
        if channel.receiver != self.receiver {
            return Err(ProofError::WrongChannel);
        }
        if self.record(channel).await.is_none() {
            self.sync_channel(channel)
                .await
                .map_err(|_| ProofError::UnknownChannel)?;
        }

        let record = self
            .record(channel)
            .await
            .ok_or(ProofError::UnknownChannel)?;
        if balance < record.balance {
            return Err(ProofError::Underpaid);
        }
        if balance > record.deposit {
            return Err(ProofError::InsufficientBalance);
        }

        info!(
            sender = ?channel.sender,
            open_block = channel.open_block_number,
            %balance,
            "signing cooperative close"
        );
        sign_closing(self.contract, channel, balance, owner)
            .map_err(|_| ProofError::CloseUnsupported)
    }
}
