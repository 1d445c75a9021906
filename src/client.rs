//! Paying API client: one balance proof per DBot call.

use crate::network::{DbotGateway, LedgerGateway};
use crate::state::channel::ChannelManager;
use crate::strategy::Funding;
use crate::types::{
    ApiRequest, ApiResponse, AtnError, Channel, DbotInfo, EndpointPrice, Result, SyncStatus,
};
use ethers::{
    signers::LocalWallet,
    types::{Address, U256},
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Poll interval and timeout for DBot sync waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(25),
        }
    }
}

/// Calls DBot APIs, opening and topping up channels as `funding` allows.
///
/// ```no_run
/// # use atn_client::{AtnClient, ApiRequest, Funding, Multiplier};
/// # async fn demo(client: AtnClient, dbot: ethers::types::Address) -> atn_client::Result<()> {
/// let response = client
///     .call(dbot, ApiRequest::new("POST", "/reg").json(serde_json::json!({"theme": "moon"})))
///     .await?;
/// println!("{}", response.text());
/// # Ok(())
/// # }
/// ```
pub struct AtnClient {
    channels: ChannelManager,
    ledger: Arc<dyn LedgerGateway>,
    dbot: Arc<dyn DbotGateway>,
    funding: Funding,
    sync: SyncPolicy,
}

impl AtnClient {
    pub fn new(
        wallet: LocalWallet,
        ledger: Arc<dyn LedgerGateway>,
        dbot: Arc<dyn DbotGateway>,
    ) -> Self {
        Self {
            channels: ChannelManager::new(wallet, ledger.clone(), dbot.clone()),
            ledger,
            dbot,
            funding: Funding::default(),
            sync: SyncPolicy::default(),
        }
    }

    pub fn with_funding(mut self, funding: Funding) -> Self {
        self.funding = funding;
        self
    }

    pub fn with_sync_policy(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    /// `Funding::Disabled` stops calls from opening or topping up channels.
    pub fn set_funding(&mut self, funding: Funding) {
        self.funding = funding;
    }

    pub fn funding(&self) -> &Funding {
        &self.funding
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn address(&self) -> Address {
        self.channels.sender()
    }

    pub async fn get_price(&self, receiver: Address, uri: &str, method: &str) -> Result<EndpointPrice> {
        self.dbot.price(receiver, uri, method).await
    }

    /// Metadata of the DBot contract at `receiver`.
    pub async fn get_dbot_info(&self, receiver: Address) -> Result<DbotInfo> {
        self.ledger
            .dbot_info(receiver)
            .await?
            .ok_or(AtnError::DbotNotFound { address: receiver })
    }

    pub async fn get_channel(&self, receiver: Address) -> Result<Option<Channel>> {
        self.channels.get_channel(receiver).await
    }

    /// The DBot's record of the current channel, if it has one.
    pub async fn get_dbot_channel(&self, receiver: Address) -> Result<Option<SyncStatus>> {
        match self.channels.get_channel(receiver).await? {
            Some(channel) => self.dbot.channel_sync_status(&channel.id()).await,
            None => Ok(None),
        }
    }

    pub async fn open_channel(&self, receiver: Address, deposit: U256) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels.open_channel(receiver, deposit).await
    }

    pub async fn topup_channel(&self, receiver: Address, amount: U256) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels.topup_channel(receiver, amount).await
    }

    pub async fn wait_dbot_sync(&self, receiver: Address) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels
            .wait_dbot_sync(receiver, self.sync.poll_interval, self.sync.timeout)
            .await
    }

    pub async fn close_channel(&self, receiver: Address) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels.close_channel(receiver).await
    }

    pub async fn uncooperative_close_channel(
        &self,
        receiver: Address,
        balance: U256,
    ) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels
            .uncooperative_close_channel(receiver, balance)
            .await
    }

    pub async fn settle_channel(&self, receiver: Address) -> Result<Channel> {
        let _lane = self.channels.lock_lane(receiver).await;
        self.channels.settle_channel(receiver).await
    }

    /// Closed channels with `receiver` that still need `settle_channel`.
    pub async fn pending_settlement(&self, receiver: Address) -> Vec<Channel> {
        self.channels.pending_settlement(receiver).await
    }

    /// Pays for and performs one API call.
    ///
    /// A rejected proof triggers one refresh of the channel from the ledger
    /// and the DBot followed by one retry. Channels are never closed here.
    pub async fn call(&self, receiver: Address, request: ApiRequest) -> Result<ApiResponse> {
        let price = self
            .dbot
            .price(receiver, &request.uri, &request.method)
            .await?
            .value;
        let _lane = self.channels.lock_lane(receiver).await;

        self.ensure_channel(receiver, price).await?;
        match self.pay_and_call(receiver, &request, price).await {
            Err(AtnError::InvalidBalanceProof { reason }) => {
                warn!(?receiver, %reason, "balance proof rejected, refreshing channel");
                self.channels.refresh_channel(receiver).await?;
                self.ensure_channel(receiver, price).await?;
                self.pay_and_call(receiver, &request, price).await
            }
            result => result,
        }
    }

    /// Makes sure an open, synced channel can pay `price`.
    async fn ensure_channel(&self, receiver: Address, price: U256) -> Result<Channel> {
        let existing = self
            .channels
            .get_channel(receiver)
            .await?
            .filter(Channel::is_open);

        let mut channel = match (existing, self.funding.amount_for(price)) {
            (Some(channel), _) => channel,
            (None, Some(deposit)) => {
                info!(?receiver, %deposit, "no open channel, creating one");
                self.channels.open_channel(receiver, deposit).await?
            }
            (None, None) => {
                warn!(?receiver, "no open channel and auto funding disabled");
                return Err(AtnError::ChannelNotOpen { receiver });
            }
        };

        if channel.awaiting_provider_sync {
            channel = self.sync_with_retry(receiver).await?;
        }

        if !channel.can_pay(price) {
            let Some(amount) = self.funding.amount_for(price) else {
                warn!(?receiver, remaining = %channel.remaining(), "insufficient channel balance, top up first");
                return Err(AtnError::InsufficientChannelBalance {
                    required: price,
                    remaining: channel.remaining(),
                });
            };
            self.channels.topup_channel(receiver, amount).await?;
            channel = self.sync_with_retry(receiver).await?;
        }

        Ok(channel)
    }

    async fn sync_with_retry(&self, receiver: Address) -> Result<Channel> {
        let SyncPolicy {
            poll_interval,
            timeout,
        } = self.sync;
        match self
            .channels
            .wait_dbot_sync(receiver, poll_interval, timeout)
            .await
        {
            Err(AtnError::SyncTimeout { .. }) => {
                warn!(?receiver, "DBot sync timed out, waiting once more");
                self.channels
                    .wait_dbot_sync(receiver, poll_interval, timeout)
                    .await
            }
            result => result,
        }
    }

    async fn pay_and_call(
        &self,
        receiver: Address,
        request: &ApiRequest,
        price: U256,
    ) -> Result<ApiResponse> {
        let proof = self.channels.next_balance_proof(receiver, price).await?;
        match self.dbot.call(receiver, request, &proof).await {
            Ok(response) => {
                self.channels.commit_balance_proof(receiver, &proof).await;
                Ok(response)
            }
            Err(e) if e.is_timeout() => {
                warn!(?receiver, nonce = proof.nonce, "DBot call timed out, keeping proof");
                self.channels.commit_balance_proof(receiver, &proof).await;
                Err(e)
            }
            Err(e) => {
                self.channels
                    .rollback_balance_proof(receiver, &proof, price)
                    .await;
                Err(e)
            }
        }
    }
}
