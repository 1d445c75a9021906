//! In-process ledger and DBot. They keep the same rules as the real parties
//! (deposits, settle timeout, highest-nonce proofs) without a chain or a server.

use crate::network::{DbotGateway, LedgerGateway};
use crate::state::dbot::DbotState;
use crate::types::{
    ApiRequest, ApiResponse, AtnError, BalanceProof, ChannelId, ChannelView, DbotInfo,
    EndpointPrice, Result, SyncStatus, TxReceipt,
};
use crate::utils::crypto::{recover_closing_signer, verify_balance_proof};
use async_trait::async_trait;
use ethers::{
    signers::LocalWallet,
    types::{Address, Signature, H256, U256},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
struct LedgerChannel {
    deposit: U256,
    settle_block_number: Option<u64>,
    closing_balance: U256,
}

#[derive(Default)]
struct LedgerInner {
    block: u64,
    balances: HashMap<Address, U256>,
    channels: HashMap<ChannelId, LedgerChannel>,
    dbots: HashMap<Address, DbotInfo>,
    transactions: u64,
    fail_next: Option<String>,
}

impl LedgerInner {
    fn balance(&self, account: Address) -> U256 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn mine(&mut self) -> Result<TxReceipt> {
        if let Some(reason) = self.fail_next.take() {
            return Err(AtnError::ledger(reason));
        }
        self.block += 1;
        self.transactions += 1;
        Ok(TxReceipt {
            tx_hash: H256::from_low_u64_be(self.transactions),
            block_number: self.block,
        })
    }

    fn credit(&mut self, account: Address, amount: U256) {
        let balance = self.balance(account);
        self.balances.insert(account, balance + amount);
    }

    fn open_channel(&mut self, id: &ChannelId) -> Result<&mut LedgerChannel> {
        match self.channels.get_mut(id) {
            Some(channel) if channel.settle_block_number.is_none() => Ok(channel),
            Some(_) => Err(AtnError::ledger("channel is closed")),
            None => Err(AtnError::ledger("no such channel")),
        }
    }
}

/// Ledger kept in memory. Every transaction mines one block.
pub struct InMemoryLedger {
    contract: Address,
    settle_timeout: u32,
    inner: RwLock<LedgerInner>,
}

impl InMemoryLedger {
    pub fn new(contract: Address, settle_timeout: u32) -> Self {
        Self {
            contract,
            settle_timeout,
            inner: RwLock::new(LedgerInner {
                block: 1,
                ..Default::default()
            }),
        }
    }

    pub async fn fund(&self, account: Address, amount: U256) {
        self.inner.write().await.credit(account, amount);
    }

    /// Deploys DBot metadata at `info.address`.
    pub async fn register_dbot(&self, info: DbotInfo) {
        self.inner.write().await.dbots.insert(info.address, info);
    }

    pub async fn advance_blocks(&self, blocks: u64) {
        self.inner.write().await.block += blocks;
    }

    pub async fn transaction_count(&self) -> u64 {
        self.inner.read().await.transactions
    }

    /// The next mutating call fails as if its transaction reverted.
    pub async fn fail_next_transaction(&self, reason: impl Into<String>) {
        self.inner.write().await.fail_next = Some(reason.into());
    }

    fn view(&self, id: &ChannelId, channel: &LedgerChannel) -> ChannelView {
        ChannelView {
            sender: id.sender,
            receiver: id.receiver,
            open_block_number: id.open_block_number,
            deposit: channel.deposit,
            settle_block_number: channel.settle_block_number,
            closing_balance: channel.closing_balance,
            settle_timeout: self.settle_timeout,
        }
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.inner.read().await.block)
    }

    async fn balance_of(&self, account: Address) -> Result<U256> {
        Ok(self.inner.read().await.balance(account))
    }

    async fn open_channel(
        &self,
        sender: Address,
        receiver: Address,
        deposit: U256,
    ) -> Result<TxReceipt> {
        let mut inner = self.inner.write().await;
        let available = inner.balance(sender);
        if available < deposit {
            return Err(AtnError::ledger("insufficient balance for deposit"));
        }

        let receipt = inner.mine()?;
        let id = ChannelId {
            sender,
            receiver,
            open_block_number: receipt.block_number as u32,
        };
        inner.balances.insert(sender, available - deposit);
        inner.channels.insert(
            id,
            LedgerChannel {
                deposit,
                settle_block_number: None,
                closing_balance: U256::zero(),
            },
        );
        Ok(receipt)
    }

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<TxReceipt> {
        let mut inner = self.inner.write().await;
        inner.open_channel(channel)?;
        let available = inner.balance(channel.sender);
        if available < amount {
            return Err(AtnError::ledger("insufficient balance for top-up"));
        }

        let receipt = inner.mine()?;
        inner.balances.insert(channel.sender, available - amount);
        inner.open_channel(channel)?.deposit += amount;
        Ok(receipt)
    }

    async fn close(&self, channel: &ChannelId, proof: &BalanceProof) -> Result<TxReceipt> {
        let mut inner = self.inner.write().await;
        let deposit = inner.open_channel(channel)?.deposit;
        if proof.channel != *channel || proof.contract != self.contract {
            return Err(AtnError::ledger("balance proof is for another channel"));
        }
        if verify_balance_proof(proof)? != channel.sender {
            return Err(AtnError::ledger("balance proof not signed by sender"));
        }
        if proof.balance > deposit {
            return Err(AtnError::ledger("closing balance exceeds deposit"));
        }

        let receipt = inner.mine()?;
        let settle_block = receipt.block_number + u64::from(self.settle_timeout);
        let entry = inner.open_channel(channel)?;
        entry.closing_balance = proof.balance;
        entry.settle_block_number = Some(settle_block);
        Ok(receipt)
    }

    async fn settle(&self, channel: &ChannelId) -> Result<TxReceipt> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .channels
            .get(channel)
            .cloned()
            .ok_or_else(|| AtnError::ledger("no such channel"))?;
        let settle_block = entry
            .settle_block_number
            .ok_or_else(|| AtnError::ledger("channel is not closed"))?;
        if inner.block < settle_block {
            return Err(AtnError::ledger("settle period not over"));
        }

        let receipt = inner.mine()?;
        inner.credit(channel.sender, entry.deposit - entry.closing_balance);
        inner.credit(channel.receiver, entry.closing_balance);
        inner.channels.remove(channel);
        Ok(receipt)
    }

    async fn cooperative_close(
        &self,
        channel: &ChannelId,
        proof: &BalanceProof,
        closing_signature: &Signature,
    ) -> Result<TxReceipt> {
        let mut inner = self.inner.write().await;
        let deposit = inner.open_channel(channel)?.deposit;
        if proof.channel != *channel || proof.contract != self.contract {
            return Err(AtnError::ledger("balance proof is for another channel"));
        }
        if verify_balance_proof(proof)? != channel.sender {
            return Err(AtnError::ledger("balance proof not signed by sender"));
        }
        let closer =
            recover_closing_signer(self.contract, channel, proof.balance, closing_signature)?;
        let owner = inner.dbots.get(&channel.receiver).map(|info| info.owner);
        if closer != channel.receiver && Some(closer) != owner {
            return Err(AtnError::ledger("closing signature not from receiver"));
        }
        if proof.balance > deposit {
            return Err(AtnError::ledger("closing balance exceeds deposit"));
        }

        let receipt = inner.mine()?;
        inner.credit(channel.sender, deposit - proof.balance);
        inner.credit(channel.receiver, proof.balance);
        inner.channels.remove(channel);
        Ok(receipt)
    }

    async fn get_channel(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Option<ChannelView>> {
        let inner = self.inner.read().await;
        let latest = inner
            .channels
            .iter()
            .filter(|(id, _)| id.sender == sender && id.receiver == receiver)
            .max_by_key(|(id, _)| id.open_block_number);

        Ok(latest.map(|(id, channel)| self.view(id, channel)))
    }

    async fn closed_channels(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Vec<ChannelView>> {
        let inner = self.inner.read().await;
        let mut closed: Vec<ChannelView> = inner
            .channels
            .iter()
            .filter(|(id, channel)| {
                id.sender == sender
                    && id.receiver == receiver
                    && channel.settle_block_number.is_some()
            })
            .map(|(id, channel)| self.view(id, channel))
            .collect();
        closed.sort_by_key(|view| view.open_block_number);
        Ok(closed)
    }

    async fn dbot_info(&self, dbot: Address) -> Result<Option<DbotInfo>> {
        Ok(self.inner.read().await.dbots.get(&dbot).cloned())
    }
}

/// DBot answering from a [`DbotState`] directly.
pub struct InMemoryDbot {
    state: DbotState,
    lagging: AtomicBool,
    reject_calls: AtomicUsize,
}

impl InMemoryDbot {
    pub fn new(receiver: Address, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self {
            state: DbotState::new(receiver, ledger),
            lagging: AtomicBool::new(false),
            reject_calls: AtomicUsize::new(0),
        }
    }

    /// Agrees to cooperative closes, signing with `owner`.
    pub fn with_closer(mut self, owner: LocalWallet) -> Self {
        self.state = self.state.with_closer(owner);
        self
    }

    pub fn state(&self) -> &DbotState {
        &self.state
    }

    pub async fn set_price(&self, method: &str, uri: &str, value: U256) {
        self.state.set_price(method, uri, value).await;
    }

    /// While lagging the DBot stops reading the ledger, so its view of new
    /// deposits never catches up.
    pub fn set_lagging(&self, lagging: bool) {
        self.lagging.store(lagging, Ordering::SeqCst);
    }

    /// Rejects the next `n` calls as if their proofs were invalid.
    pub fn reject_next_calls(&self, n: usize) {
        self.reject_calls.store(n, Ordering::SeqCst);
    }

    fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DbotGateway for InMemoryDbot {
    async fn price(&self, receiver: Address, uri: &str, method: &str) -> Result<EndpointPrice> {
        let not_found = || AtnError::EndpointNotFound {
            uri: uri.to_string(),
            method: method.to_string(),
        };
        if receiver != self.state.receiver() {
            return Err(not_found());
        }
        self.state.price(uri, method).await.ok_or_else(not_found)
    }

    async fn call(
        &self,
        receiver: Address,
        request: &ApiRequest,
        proof: &BalanceProof,
    ) -> Result<ApiResponse> {
        let price = self.price(receiver, &request.uri, &request.method).await?;
        let rejected = self
            .reject_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(AtnError::invalid_proof("rejected by DBot"));
        }

        if !self.is_lagging() && self.state.record(&proof.channel).await.is_none() {
            self.state.sync_channel(&proof.channel).await?;
        }
        let charged = self.state.accept(proof, price.value).await?;

        let body = serde_json::json!({
            "uri": request.uri,
            "method": request.method,
            "nonce": proof.nonce,
            "charged": charged.to_string(),
        });
        Ok(ApiResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(&body)?,
        })
    }

    async fn channel_sync_status(&self, channel: &ChannelId) -> Result<Option<SyncStatus>> {
        if self.is_lagging() {
            return Ok(self.state.record(channel).await);
        }
        self.state.sync_channel(channel).await
    }

    async fn closing_signature(&self, channel: &ChannelId, balance: U256) -> Result<Signature> {
        self.state
            .closing_signature(channel, balance)
            .await
            .map_err(|e| AtnError::close_denied(e.to_string()))
    }
}
