use crate::network::LedgerGateway;
use crate::types::{AtnError, BalanceProof, ChannelId, ChannelView, DbotInfo, Result, TxReceipt};
use async_trait::async_trait;
use ethers::{
    contract::{abigen, ContractCall},
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, Signature, H256, U256, U64},
};
use std::{cmp::Reverse, sync::Arc, time::Duration};
use tracing::{debug, info};

abigen!(
    ChannelManagerContract,
    r#"[
        function createChannel(address _receiver_address) payable
        function topUp(address _receiver_address, uint32 _open_block_number) payable
        function uncooperativeClose(address _receiver_address, uint32 _open_block_number, uint256 _balance)
        function cooperativeClose(address _receiver_address, uint32 _open_block_number, uint256 _balance, bytes _balance_msg_sig, bytes _closing_sig)
        function settle(address _receiver_address, uint32 _open_block_number)
        function getChannelInfo(address _sender_address, address _receiver_address, uint32 _open_block_number) view returns (bytes32, uint192, uint32, uint192, uint192)
        function challengePeriod() view returns (uint32)
        event ChannelCreated(address indexed _sender_address, address indexed _receiver_address, uint192 _deposit)
    ]"#
);

abigen!(
    DbotContract,
    r#"[
        function name() view returns (bytes32)
        function domain() view returns (bytes32)
        function getOwner() view returns (address)
    ]"#
);

fn bytes32_text(raw: [u8; 32]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Ledger gateway backed by a JSON-RPC node and the channel manager contract.
pub struct EthersLedger {
    client: Arc<Client>,
    contract: ChannelManagerContract<Client>,
    confirmation_interval: Duration,
    confirmation_timeout: Duration,
}

impl EthersLedger {
    pub async fn connect(
        rpc_url: &str,
        wallet: LocalWallet,
        contract: Address,
        confirmation_interval: Duration,
        confirmation_timeout: Duration,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| AtnError::config(format!("invalid RPC url {}: {}", rpc_url, e)))?
            .interval(confirmation_interval);
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| AtnError::ledger(format!("eth_chainId failed: {}", e)))?;
        info!(rpc_url, chain_id = %chain_id, "connected to ledger");

        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = ChannelManagerContract::new(contract, client.clone());

        Ok(Self {
            client,
            contract,
            confirmation_interval,
            confirmation_timeout,
        })
    }

    pub fn address(&self) -> Address {
        self.client.address()
    }

    fn ensure_sender(&self, sender: Address) -> Result<()> {
        if sender != self.address() {
            return Err(AtnError::ledger(format!(
                "cannot sign for {:?}, wallet is {:?}",
                sender,
                self.address()
            )));
        }
        Ok(())
    }

    async fn submit(&self, call: ContractCall<Client, ()>, what: &str) -> Result<TxReceipt> {
        let pending = call
            .send()
            .await
            .map_err(|e| AtnError::ledger(format!("{} rejected: {}", what, e)))?;
        let tx_hash: H256 = *pending;
        debug!(%what, ?tx_hash, "waiting for confirmation");

        let receipt = tokio::time::timeout(
            self.confirmation_timeout,
            pending.interval(self.confirmation_interval),
        )
        .await
        .map_err(|_| {
            AtnError::ledger(format!(
                "{} {:?} not mined within {:?}",
                what, tx_hash, self.confirmation_timeout
            ))
        })?
        .map_err(|e| AtnError::ledger(format!("{} {:?}: {}", what, tx_hash, e)))?
        .ok_or_else(|| AtnError::ledger(format!("{} {:?} dropped", what, tx_hash)))?;

        if receipt.status != Some(U64::from(1)) {
            return Err(AtnError::ledger(format!("{} {:?} reverted", what, tx_hash)));
        }
        let block_number = receipt
            .block_number
            .ok_or_else(|| AtnError::ledger(format!("{} {:?} has no block", what, tx_hash)))?
            .as_u64();

        debug!(%what, ?tx_hash, block_number, "transaction mined");
        Ok(TxReceipt {
            tx_hash,
            block_number,
        })
    }
}

#[async_trait]
impl LedgerGateway for EthersLedger {
    fn contract_address(&self) -> Address {
        self.contract.address()
    }

    async fn block_number(&self) -> Result<u64> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| AtnError::ledger(format!("eth_blockNumber failed: {}", e)))
    }

    async fn balance_of(&self, account: Address) -> Result<U256> {
        self.client
            .get_balance(account, None)
            .await
            .map_err(|e| AtnError::ledger(format!("eth_getBalance failed: {}", e)))
    }

    async fn open_channel(
        &self,
        sender: Address,
        receiver: Address,
        deposit: U256,
    ) -> Result<TxReceipt> {
        self.ensure_sender(sender)?;
        let call = self.contract.create_channel(receiver).value(deposit);
        self.submit(call, "createChannel").await
    }

    async fn deposit(&self, channel: &ChannelId, amount: U256) -> Result<TxReceipt> {
        self.ensure_sender(channel.sender)?;
        let call = self
            .contract
            .top_up(channel.receiver, channel.open_block_number)
            .value(amount);
        self.submit(call, "topUp").await
    }

    async fn close(&self, channel: &ChannelId, proof: &BalanceProof) -> Result<TxReceipt> {
        self.ensure_sender(channel.sender)?;
        let call = self.contract.uncooperative_close(
            channel.receiver,
            channel.open_block_number,
            proof.balance,
        );
        self.submit(call, "uncooperativeClose").await
    }

    async fn settle(&self, channel: &ChannelId) -> Result<TxReceipt> {
        self.ensure_sender(channel.sender)?;
        let call = self
            .contract
            .settle(channel.receiver, channel.open_block_number);
        self.submit(call, "settle").await
    }

    async fn cooperative_close(
        &self,
        channel: &ChannelId,
        proof: &BalanceProof,
        closing_signature: &Signature,
    ) -> Result<TxReceipt> {
        self.ensure_sender(channel.sender)?;
        let call = self.contract.cooperative_close(
            channel.receiver,
            channel.open_block_number,
            proof.balance,
            Bytes::from(proof.signature.to_vec()),
            Bytes::from(closing_signature.to_vec()),
        );
        self.submit(call, "cooperativeClose").await
    }

    async fn get_channel(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Option<ChannelView>> {
        Ok(self.channel_views(sender, receiver).await?.into_iter().next())
    }

    async fn closed_channels(
        &self,
        sender: Address,
        receiver: Address,
    ) -> Result<Vec<ChannelView>> {
        let mut closed: Vec<ChannelView> = self
            .channel_views(sender, receiver)
            .await?
            .into_iter()
            .filter(|view| view.settle_block_number.is_some())
            .collect();
        closed.reverse();
        Ok(closed)
    }

    async fn dbot_info(&self, dbot: Address) -> Result<Option<DbotInfo>> {
        let code = self
            .client
            .get_code(dbot, None)
            .await
            .map_err(|e| AtnError::ledger(format!("eth_getCode failed: {}", e)))?;
        if code.is_empty() {
            return Ok(None);
        }

        let contract = DbotContract::new(dbot, self.client.clone());
        let name = contract
            .name()
            .call()
            .await
            .map_err(|e| AtnError::ledger(format!("DBot name failed: {}", e)))?;
        let domain = contract
            .domain()
            .call()
            .await
            .map_err(|e| AtnError::ledger(format!("DBot domain failed: {}", e)))?;
        let owner = contract
            .get_owner()
            .call()
            .await
            .map_err(|e| AtnError::ledger(format!("DBot getOwner failed: {}", e)))?;

        Ok(Some(DbotInfo {
            address: dbot,
            name: bytes32_text(name),
            domain: bytes32_text(domain),
            owner,
        }))
    }
}

impl EthersLedger {
    /// Unsettled channels of the pair, newest first.
    async fn channel_views(&self, sender: Address, receiver: Address) -> Result<Vec<ChannelView>> {
        let mut created = self
            .contract
            .channel_created_filter()
            .topic1(H256::from(sender))
            .topic2(H256::from(receiver))
            .from_block(0u64)
            .query_with_meta()
            .await
            .map_err(|e| AtnError::ledger(format!("ChannelCreated query failed: {}", e)))?;
        if created.is_empty() {
            return Ok(Vec::new());
        }
        created.sort_by_key(|(_, meta)| Reverse(meta.block_number));

        let settle_timeout = self
            .contract
            .challenge_period()
            .call()
            .await
            .map_err(|e| AtnError::ledger(format!("challengePeriod failed: {}", e)))?;

        let mut views = Vec::new();
        for (_, meta) in created {
            let open_block_number = meta.block_number.as_u32();
            let info = self
                .contract
                .get_channel_info(sender, receiver, open_block_number)
                .call()
                .await;
            // Settled channels are deleted from the contract and the call reverts.
            let (_, deposit, settle_block, closing_balance, _) = match info {
                Ok(info) => info,
                Err(e) => {
                    debug!(open_block_number, error = %e, "skipping settled channel");
                    continue;
                }
            };
            if deposit.is_zero() {
                continue;
            }
            views.push(ChannelView {
                sender,
                receiver,
                open_block_number,
                deposit,
                settle_block_number: (settle_block != 0).then_some(u64::from(settle_block)),
                closing_balance,
                settle_timeout,
            });
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes32_text_stops_at_padding() {
        let mut raw = [0u8; 32];
        raw[..11].copy_from_slice(b"atn.example");
        assert_eq!(bytes32_text(raw), "atn.example");
        assert_eq!(bytes32_text([0u8; 32]), "");
    }
}
