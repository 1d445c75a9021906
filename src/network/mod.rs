//! Boundaries to the two external parties: the ledger holding channel
//! deposits and the DBot serving paid API calls.

pub mod chain;
pub mod http;
pub mod memory;

use crate::types::{
    ApiRequest, ApiResponse, BalanceProof, ChannelId, ChannelView, DbotInfo, EndpointPrice,
    Result, SyncStatus, TxReceipt,
};
use async_trait::async_trait;
use ethers::types::{Address, Signature, U256};

pub use self::chain::EthersLedger;
pub use self::http::HttpDbotGateway;
pub use self::memory::{InMemoryDbot, InMemoryLedger};

/// On-chain channel operations. Mutating calls return once the transaction
/// is mined and fail with `LedgerTransaction` on revert or confirmation timeout.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Channel manager contract; also identifies the token channels are funded in.
    fn contract_address(&self) -> Address;

    async fn block_number(&self) -> Result<u64>;

    async fn balance_of(&self, account: Address) -> Result<U256>;

    async fn open_channel(
        &self,
        sender: Address,
        receiver: Address,
        deposit: U256,
    ) -> Result<TxReceipt>;

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<TxReceipt>;

    async fn close(&self, channel: &ChannelId, proof: &BalanceProof) -> Result<TxReceipt>;

    /// Closes and settles in one transaction, skipping the challenge period.
    /// `closing_signature` is the DBot's agreement to `proof.balance`.
    async fn cooperative_close(
        &self,
        channel: &ChannelId,
        proof: &BalanceProof,
        closing_signature: &Signature,
    ) -> Result<TxReceipt>;

    async fn settle(&self, channel: &ChannelId) -> Result<TxReceipt>;

    /// Latest channel for the pair that has not been settled yet.
    async fn get_channel(&self, sender: Address, receiver: Address)
        -> Result<Option<ChannelView>>;

    /// Channels of the pair that were closed but not settled yet, oldest first.
    async fn closed_channels(&self, sender: Address, receiver: Address)
        -> Result<Vec<ChannelView>>;

    /// `None` when no DBot contract lives at `dbot`.
    async fn dbot_info(&self, dbot: Address) -> Result<Option<DbotInfo>>;
}

/// The DBot's HTTP surface as seen by a paying client.
#[async_trait]
pub trait DbotGateway: Send + Sync {
    async fn price(&self, receiver: Address, uri: &str, method: &str) -> Result<EndpointPrice>;

    /// Rejected proofs surface as `InvalidBalanceProof`; any other response
    /// means the DBot consumed the proof.
    async fn call(
        &self,
        receiver: Address,
        request: &ApiRequest,
        proof: &BalanceProof,
    ) -> Result<ApiResponse>;

    /// `None` when the DBot holds no record of the channel yet.
    async fn channel_sync_status(&self, channel: &ChannelId) -> Result<Option<SyncStatus>>;

    /// Asks the DBot to sign off on closing `channel` at `balance`. A refusal
    /// surfaces as `CloseDenied`.
    async fn closing_signature(&self, channel: &ChannelId, balance: U256) -> Result<Signature>;
}
