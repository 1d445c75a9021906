use crate::network::{DbotGateway, LedgerGateway};
use crate::types::{AtnError, BalanceProof, Channel, ChannelState, Result, SyncStatus, TxReceipt};
use crate::utils::crypto::{recover_closing_signer, sign_balance_proof};
use crate::utils::poll::poll_until;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct ChannelSlot {
    channel: Mutex<Option<Channel>>,
    /// Closed channels replaced by a newer one, kept until settled.
    /// Locked after `channel`.
    closing: Mutex<Vec<Channel>>,
    /// Proof handed to the DBot whose outcome is not known yet.
    in_flight: Mutex<Option<BalanceProof>>,
    /// Held by a paying call from channel resolution until the proof is
    /// committed or rolled back.
    lane: Arc<Mutex<()>>,
}

impl ChannelSlot {
    async fn retire(&self, channel: Channel) {
        if channel.state != ChannelState::Closed {
            return;
        }
        info!(
            receiver = ?channel.receiver,
            open_block = channel.open_block_number,
            settle_block = ?channel.settle_block_number,
            "keeping closed channel until settled"
        );
        self.closing.lock().await.push(channel);
    }
}

/// Takes the DBot's balance and nonce unless the balance exceeds the deposit.
fn adopt_status(channel: &mut Channel, status: &SyncStatus) {
    if status.balance > channel.deposit {
        warn!(
            receiver = ?channel.receiver,
            dbot_balance = %status.balance,
            deposit = %channel.deposit,
            "DBot balance exceeds deposit, keeping local state"
        );
        return;
    }
    channel.balance = status.balance;
    channel.nonce = status.nonce;
}

/// Owns the local channel cache and drives every channel state transition.
///
/// Each receiver gets its own slot, so work on different channels runs in
/// parallel while nonce allocation within one channel is serialized.
pub struct ChannelManager {
    wallet: LocalWallet,
    ledger: Arc<dyn LedgerGateway>,
    dbot: Arc<dyn DbotGateway>,
    slots: RwLock<HashMap<Address, Arc<ChannelSlot>>>,
}

impl ChannelManager {
    pub fn new(
        wallet: LocalWallet,
        ledger: Arc<dyn LedgerGateway>,
        dbot: Arc<dyn DbotGateway>,
    ) -> Self {
        Self {
            wallet,
            ledger,
            dbot,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn sender(&self) -> Address {
        self.wallet.address()
    }

    pub fn contract(&self) -> Address {
        self.ledger.contract_address()
    }

    async fn slot(&self, receiver: Address) -> Arc<ChannelSlot> {
        if let Some(slot) = self.slots.read().await.get(&receiver) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(receiver)
            .or_default()
            .clone()
    }

    /// Serializes paying calls to `receiver`.
    pub async fn lock_lane(&self, receiver: Address) -> OwnedMutexGuard<()> {
        let lane = self.slot(receiver).await.lane.clone();
        lane.lock_owned().await
    }

    /// Cached snapshot without touching the ledger.
    pub async fn cached(&self, receiver: Address) -> Option<Channel> {
        self.slot(receiver).await.channel.lock().await.clone()
    }

    /// Fills an empty or settled cache entry from the ledger.
    async fn resolve(&self, receiver: Address, cached: &mut Option<Channel>) -> Result<()> {
        let stale = cached
            .as_ref()
            .map_or(true, |c| c.state == ChannelState::Settled);
        if !stale {
            return Ok(());
        }
        if let Some(view) = self.ledger.get_channel(self.sender(), receiver).await? {
            let channel = Channel::from_view(&view, self.contract());
            info!(
                ?receiver,
                open_block = channel.open_block_number,
                deposit = %channel.deposit,
                state = ?channel.state,
                "loaded channel from ledger"
            );
            *cached = Some(channel);
        }
        Ok(())
    }

    async fn ensure_funds(&self, amount: U256) -> Result<()> {
        let available = self.ledger.balance_of(self.sender()).await?;
        if available < amount {
            warn!(%available, %amount, "insufficient funds");
            return Err(AtnError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        Ok(())
    }

    /// The channel with `receiver`, unless it has been settled.
    pub async fn get_channel(&self, receiver: Address) -> Result<Option<Channel>> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        Ok(cached
            .as_ref()
            .filter(|c| c.state != ChannelState::Settled)
            .cloned())
    }

    /// Opens a channel and blocks until the transaction is mined. An already
    /// open channel is returned unchanged.
    pub async fn open_channel(&self, receiver: Address, deposit: U256) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        if let Some(existing) = cached.as_ref().filter(|c| c.is_open()) {
            warn!(?receiver, open_block = existing.open_block_number, "channel already open");
            return Ok(existing.clone());
        }

        self.ensure_funds(deposit).await?;

        let sender = self.sender();
        let previous = cached.replace(Channel {
            sender,
            receiver,
            contract: self.contract(),
            deposit,
            balance: U256::zero(),
            nonce: 0,
            open_block_number: 0,
            settle_timeout: 0,
            settle_block_number: None,
            state: ChannelState::PendingOpen,
            awaiting_provider_sync: true,
        });
        info!(?receiver, %deposit, "opening channel");

        let opened = async {
            let receipt = self.ledger.open_channel(sender, receiver, deposit).await?;
            let view = self
                .ledger
                .get_channel(sender, receiver)
                .await?
                .filter(|v| u64::from(v.open_block_number) == receipt.block_number)
                .ok_or_else(|| {
                    AtnError::ledger(format!(
                        "channel opened by {:?} not found on ledger",
                        receipt.tx_hash
                    ))
                })?;
            Ok::<_, AtnError>(Channel::from_view(&view, self.contract()))
        }
        .await;

        match opened {
            Ok(channel) => {
                info!(
                    ?receiver,
                    open_block = channel.open_block_number,
                    deposit = %channel.deposit,
                    "channel open"
                );
                *cached = Some(channel.clone());
                if let Some(previous) = previous {
                    slot.retire(previous).await;
                }
                Ok(channel)
            }
            Err(e) => {
                *cached = previous;
                Err(e)
            }
        }
    }

    /// Increases the deposit of the open channel and blocks until mined.
    pub async fn topup_channel(&self, receiver: Address, amount: U256) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        let id = cached
            .as_ref()
            .filter(|c| c.is_open())
            .map(Channel::id)
            .ok_or(AtnError::ChannelNotOpen { receiver })?;

        self.ensure_funds(amount).await?;
        info!(?receiver, %amount, open_block = id.open_block_number, "topping up channel");
        self.ledger.deposit(&id, amount).await?;

        let channel = cached
            .as_mut()
            .ok_or(AtnError::ChannelNotOpen { receiver })?;
        channel.deposit += amount;
        channel.awaiting_provider_sync = true;
        info!(?receiver, deposit = %channel.deposit, "channel topped up");
        Ok(channel.clone())
    }

    /// Closes the channel at the latest balance. The DBot is asked to agree
    /// first, which settles the channel in the same transaction; if it
    /// refuses or anything else fails the channel is closed uncooperatively
    /// and must be settled after the challenge period.
    pub async fn close_channel(&self, receiver: Address) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        let channel = cached
            .as_mut()
            .filter(|c| c.is_open())
            .ok_or(AtnError::ChannelNotOpen { receiver })?;

        // Re-signing the current state reproduces the last issued proof.
        let proof = sign_balance_proof(channel, channel.balance, channel.nonce, &self.wallet)?;
        channel.state = ChannelState::PendingClose;
        info!(?receiver, balance = %proof.balance, nonce = proof.nonce, "closing channel");

        match self.close_cooperatively(&proof).await {
            Ok(receipt) => {
                channel.state = ChannelState::Settled;
                channel.awaiting_provider_sync = false;
                channel.settle_block_number = Some(receipt.block_number);
                info!(
                    ?receiver,
                    receiver_share = %channel.balance,
                    refund = %channel.remaining(),
                    "channel closed cooperatively"
                );
                return Ok(channel.clone());
            }
            Err(e) => warn!(?receiver, error = %e, "cooperative close failed, closing uncooperatively"),
        }
        self.submit_close(channel, &proof).await
    }

    /// Closes the channel claiming `balance` for the receiver, without asking
    /// the DBot. The DBot may dispute it with a later proof until the
    /// challenge period ends.
    pub async fn uncooperative_close_channel(
        &self,
        receiver: Address,
        balance: U256,
    ) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        let channel = cached
            .as_mut()
            .filter(|c| c.is_open())
            .ok_or(AtnError::ChannelNotOpen { receiver })?;
        if balance > channel.deposit {
            return Err(AtnError::InsufficientChannelBalance {
                required: balance,
                remaining: channel.deposit,
            });
        }

        let proof = sign_balance_proof(channel, balance, channel.nonce, &self.wallet)?;
        channel.state = ChannelState::PendingClose;
        info!(?receiver, %balance, "closing channel uncooperatively");
        self.submit_close(channel, &proof).await
    }

    async fn close_cooperatively(&self, proof: &BalanceProof) -> Result<TxReceipt> {
        let id = &proof.channel;
        let closing_signature = self.dbot.closing_signature(id, proof.balance).await?;
        let closer =
            recover_closing_signer(self.contract(), id, proof.balance, &closing_signature)?;
        if closer != id.receiver {
            let owner = self.ledger.dbot_info(id.receiver).await?.map(|info| info.owner);
            if owner != Some(closer) {
                return Err(AtnError::close_denied(format!(
                    "closing signature from {:?}, not the DBot",
                    closer
                )));
            }
        }
        self.ledger.cooperative_close(id, proof, &closing_signature).await
    }

    async fn submit_close(&self, channel: &mut Channel, proof: &BalanceProof) -> Result<Channel> {
        match self.ledger.close(&proof.channel, proof).await {
            Ok(receipt) => {
                channel.state = ChannelState::Closed;
                channel.balance = proof.balance;
                channel.awaiting_provider_sync = false;
                channel.settle_block_number =
                    Some(receipt.block_number + u64::from(channel.settle_timeout));
                info!(
                    receiver = ?channel.receiver,
                    settle_block = ?channel.settle_block_number,
                    "channel closed"
                );
                Ok(channel.clone())
            }
            Err(e) => {
                channel.state = ChannelState::Open;
                Err(e)
            }
        }
    }

    /// Settles the oldest closed channel with `receiver` once its challenge
    /// period has passed. Closed channels superseded by a reopen are found
    /// both in the local cache and on the ledger.
    pub async fn settle_channel(&self, receiver: Address) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        let mut closing = slot.closing.lock().await;

        let on_ledger = self.ledger.closed_channels(self.sender(), receiver).await?;
        closing.retain(|c| {
            let listed = on_ledger.iter().any(|view| view.id() == c.id());
            if !listed {
                debug!(?receiver, open_block = c.open_block_number, "closed channel already settled");
            }
            listed
        });
        for view in &on_ledger {
            let known = closing
                .iter()
                .chain(cached.iter())
                .any(|c| c.id() == view.id());
            if !known {
                closing.push(Channel::from_view(view, self.contract()));
            }
        }

        let mut target = closing
            .iter()
            .chain(cached.iter())
            .filter(|c| c.state == ChannelState::Closed)
            .min_by_key(|c| c.settle_block_number.unwrap_or_default())
            .cloned()
            .ok_or(AtnError::ChannelNotClosed { receiver })?;

        let current = self.ledger.block_number().await?;
        let settle_block = target.settle_block_number.unwrap_or_default();
        if current < settle_block {
            return Err(AtnError::SettlePeriodActive {
                remaining_blocks: settle_block - current,
            });
        }

        target.state = ChannelState::PendingSettle;
        info!(?receiver, open_block = target.open_block_number, "settling channel");
        self.ledger.settle(&target.id()).await?;
        target.state = ChannelState::Settled;

        let id = target.id();
        match cached.as_mut().filter(|c| c.id() == id) {
            Some(channel) => channel.state = ChannelState::Settled,
            None => closing.retain(|c| c.id() != id),
        }
        info!(
            ?receiver,
            open_block = target.open_block_number,
            receiver_share = %target.balance,
            refund = %target.remaining(),
            "channel settled"
        );
        Ok(target)
    }

    /// Closed channels with `receiver` still waiting to be settled, as far as
    /// the local cache knows.
    pub async fn pending_settlement(&self, receiver: Address) -> Vec<Channel> {
        let slot = self.slot(receiver).await;
        let cached = slot.channel.lock().await;
        let closing = slot.closing.lock().await;
        closing
            .iter()
            .chain(cached.iter())
            .filter(|c| c.state == ChannelState::Closed)
            .cloned()
            .collect()
    }

    /// Polls the DBot until its deposit for the channel matches the ledger.
    ///
    /// On success the DBot's balance and nonce are adopted unless they lag
    /// behind the local ones. On timeout the cache is rebuilt from the ledger
    /// and the channel keeps waiting for sync.
    pub async fn wait_dbot_sync(
        &self,
        receiver: Address,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Channel> {
        let slot = self.slot(receiver).await;
        let id = {
            let mut cached = slot.channel.lock().await;
            self.resolve(receiver, &mut cached).await?;
            cached
                .as_ref()
                .filter(|c| c.is_open())
                .map(Channel::id)
                .ok_or(AtnError::ChannelNotOpen { receiver })?
        };

        let view = self
            .ledger
            .get_channel(id.sender, id.receiver)
            .await?
            .filter(|v| v.id() == id && v.is_open())
            .ok_or(AtnError::ChannelNotOpen { receiver })?;
        let deposit = view.deposit;

        let status = poll_until(poll_interval, timeout, || async {
            match self.dbot.channel_sync_status(&id).await? {
                Some(status) if status.deposit == deposit => Ok::<_, AtnError>(Some(status)),
                status => {
                    debug!(
                        ?receiver,
                        dbot_deposit = ?status.map(|s| s.deposit),
                        ledger_deposit = %deposit,
                        "DBot has not synced channel yet"
                    );
                    Ok(None)
                }
            }
        })
        .await?;

        let mut cached = slot.channel.lock().await;
        let channel = cached
            .as_mut()
            .filter(|c| c.id() == id)
            .ok_or(AtnError::ChannelNotOpen { receiver })?;
        channel.deposit = deposit;

        match status {
            Some(status) => {
                if status.nonce >= channel.nonce {
                    adopt_status(channel, &status);
                }
                channel.awaiting_provider_sync = false;
                info!(
                    ?receiver,
                    deposit = %channel.deposit,
                    balance = %channel.balance,
                    nonce = channel.nonce,
                    "DBot synced channel"
                );
                Ok(channel.clone())
            }
            None => {
                channel.awaiting_provider_sync = true;
                warn!(?receiver, ?timeout, "DBot did not sync channel");
                Err(AtnError::SyncTimeout {
                    receiver,
                    waited: timeout,
                })
            }
        }
    }

    /// Allocates the next nonce and signs `balance + call_price`. The cache
    /// is updated right away; see [`Self::rollback_balance_proof`].
    pub async fn next_balance_proof(
        &self,
        receiver: Address,
        call_price: U256,
    ) -> Result<BalanceProof> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        self.resolve(receiver, &mut cached).await?;
        let channel = cached
            .as_mut()
            .filter(|c| c.is_open())
            .ok_or(AtnError::ChannelNotOpen { receiver })?;
        if channel.awaiting_provider_sync {
            return Err(AtnError::AwaitingProviderSync { receiver });
        }

        let new_balance = channel
            .balance
            .checked_add(call_price)
            .filter(|b| *b <= channel.deposit)
            .ok_or(AtnError::InsufficientChannelBalance {
                required: call_price,
                remaining: channel.remaining(),
            })?;
        let nonce = channel.nonce + 1;

        let proof = sign_balance_proof(channel, new_balance, nonce, &self.wallet)?;
        channel.balance = new_balance;
        channel.nonce = nonce;
        *slot.in_flight.lock().await = Some(proof.clone());
        debug!(?receiver, %new_balance, nonce, "issued balance proof");
        Ok(proof)
    }

    /// The proof most recently issued for `receiver` whose delivery has been
    /// neither committed nor rolled back.
    pub async fn in_flight_proof(&self, receiver: Address) -> Option<BalanceProof> {
        self.slot(receiver).await.in_flight.lock().await.clone()
    }

    /// Marks `proof` as held by the DBot. The cache already carries it, so
    /// a later rollback of the same proof is refused.
    pub async fn commit_balance_proof(&self, receiver: Address, proof: &BalanceProof) {
        let slot = self.slot(receiver).await;
        let mut in_flight = slot.in_flight.lock().await;
        if in_flight.as_ref() == Some(proof) {
            *in_flight = None;
            debug!(?receiver, nonce = proof.nonce, "committed balance proof");
        } else {
            warn!(?receiver, nonce = proof.nonce, "committed proof was not in flight");
        }
    }

    /// Undoes the optimistic update of `proof` so a retry reuses its nonce.
    /// Ignored if another proof was issued since.
    pub async fn rollback_balance_proof(
        &self,
        receiver: Address,
        proof: &BalanceProof,
        call_price: U256,
    ) {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        let mut in_flight = slot.in_flight.lock().await;
        if in_flight.as_ref() != Some(proof) {
            warn!(?receiver, nonce = proof.nonce, "cannot roll back proof that is not in flight");
            return;
        }
        *in_flight = None;
        match cached.as_mut() {
            Some(channel)
                if channel.id() == proof.channel
                    && channel.nonce == proof.nonce
                    && channel.balance == proof.balance =>
            {
                channel.nonce -= 1;
                channel.balance = channel.balance.saturating_sub(call_price);
                info!(?receiver, nonce = channel.nonce, balance = %channel.balance, "rolled back balance proof");
            }
            _ => warn!(?receiver, nonce = proof.nonce, "cannot roll back superseded proof"),
        }
    }

    /// Rebuilds the cache entry: deposit and state from the ledger, balance
    /// and nonce from the DBot.
    pub async fn refresh_channel(&self, receiver: Address) -> Result<Option<Channel>> {
        let slot = self.slot(receiver).await;
        let mut cached = slot.channel.lock().await;
        let Some(view) = self.ledger.get_channel(self.sender(), receiver).await? else {
            *cached = None;
            return Ok(None);
        };

        let mut channel = match cached.take() {
            Some(mut channel) if channel.id() == view.id() => {
                channel.deposit = view.deposit;
                if !view.is_open() {
                    channel.state = ChannelState::Closed;
                    channel.settle_block_number = view.settle_block_number;
                }
                channel
            }
            previous => {
                if let Some(previous) = previous {
                    slot.retire(previous).await;
                }
                Channel::from_view(&view, self.contract())
            }
        };

        if channel.is_open() {
            let status = match self.dbot.channel_sync_status(&channel.id()).await {
                Ok(status) => status,
                Err(e) => {
                    channel.awaiting_provider_sync = true;
                    *cached = Some(channel);
                    return Err(e);
                }
            };
            match status {
                Some(status) if status.deposit == channel.deposit => {
                    adopt_status(&mut channel, &status);
                    channel.awaiting_provider_sync = false;
                }
                _ => channel.awaiting_provider_sync = true,
            }
        }

        info!(
            ?receiver,
            deposit = %channel.deposit,
            balance = %channel.balance,
            nonce = channel.nonce,
            awaiting_sync = channel.awaiting_provider_sync,
            "refreshed channel"
        );
        *cached = Some(channel.clone());
        Ok(Some(channel))
    }
}
