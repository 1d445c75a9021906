use ethers::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};

pub const HEADER_CONTRACT: &str = "X-ATN-Contract-Address";
pub const HEADER_SENDER: &str = "X-ATN-Sender-Address";
pub const HEADER_RECEIVER: &str = "X-ATN-Receiver-Address";
pub const HEADER_OPEN_BLOCK: &str = "X-ATN-Open-Block";
pub const HEADER_BALANCE: &str = "X-ATN-Balance";
pub const HEADER_NONCE: &str = "X-ATN-Nonce";
pub const HEADER_SIGNATURE: &str = "X-ATN-Balance-Signature";

/// Key of a channel on the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub sender: Address,
    pub receiver: Address,
    pub open_block_number: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    PendingOpen,
    Open,
    PendingClose,
    Closed,
    PendingSettle,
    Settled,
}

/// Local view of the single channel between this client and a DBot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub sender: Address,
    pub receiver: Address,
    pub contract: Address,
    pub deposit: U256,
    pub balance: U256,
    pub nonce: u64,
    pub open_block_number: u32,
    pub settle_timeout: u32,
    pub settle_block_number: Option<u64>,
    pub state: ChannelState,
    /// Set after an on-chain mutation until the DBot reports the same deposit.
    pub awaiting_provider_sync: bool,
}

impl Channel {
    /// Builds a cache entry from a ledger snapshot. Balance and nonce live
    /// off-chain, so they start at zero and the entry waits for a provider sync.
    pub fn from_view(view: &ChannelView, contract: Address) -> Self {
        let (state, balance) = match view.settle_block_number {
            Some(_) => (ChannelState::Closed, view.closing_balance),
            None => (ChannelState::Open, U256::zero()),
        };
        Self {
            sender: view.sender,
            receiver: view.receiver,
            contract,
            deposit: view.deposit,
            balance,
            nonce: 0,
            open_block_number: view.open_block_number,
            settle_timeout: view.settle_timeout,
            settle_block_number: view.settle_block_number,
            state,
            awaiting_provider_sync: state == ChannelState::Open,
        }
    }

    pub fn id(&self) -> ChannelId {
        ChannelId {
            sender: self.sender,
            receiver: self.receiver,
            open_block_number: self.open_block_number,
        }
    }

    pub fn remaining(&self) -> U256 {
        self.deposit.saturating_sub(self.balance)
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn can_pay(&self, price: U256) -> bool {
        self.remaining() >= price
    }
}

/// Channel as the ledger reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelView {
    pub sender: Address,
    pub receiver: Address,
    pub open_block_number: u32,
    pub deposit: U256,
    /// Block after which a closed channel may be settled; `None` while open.
    pub settle_block_number: Option<u64>,
    pub closing_balance: U256,
    pub settle_timeout: u32,
}

impl ChannelView {
    pub fn id(&self) -> ChannelId {
        ChannelId {
            sender: self.sender,
            receiver: self.receiver,
            open_block_number: self.open_block_number,
        }
    }

    pub fn is_open(&self) -> bool {
        self.settle_block_number.is_none()
    }
}

/// Signed authorization for the receiver to claim `balance` from the channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceProof {
    pub channel: ChannelId,
    pub contract: Address,
    pub balance: U256,
    pub nonce: u64,
    pub signature: Signature,
}

impl BalanceProof {
    /// Request metadata carrying this proof. Balance and nonce are decimal,
    /// addresses and signature `0x`-prefixed hex.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_CONTRACT, format!("{:?}", self.contract)),
            (HEADER_SENDER, format!("{:?}", self.channel.sender)),
            (HEADER_RECEIVER, format!("{:?}", self.channel.receiver)),
            (HEADER_OPEN_BLOCK, self.channel.open_block_number.to_string()),
            (HEADER_BALANCE, self.balance.to_string()),
            (HEADER_NONCE, self.nonce.to_string()),
            (
                HEADER_SIGNATURE,
                format!("0x{}", hex::encode(self.signature.to_vec())),
            ),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// Quoted cost of one call to a DBot endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPrice {
    pub value: U256,
    pub token: Address,
}

/// Registration of a DBot contract. `domain` is where its HTTP API is
/// served, with or without a scheme.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbotInfo {
    pub address: Address,
    pub name: String,
    pub domain: String,
    /// Account that signs cooperative closes for the DBot.
    pub owner: Address,
}

/// The DBot's off-chain record of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub deposit: U256,
    pub balance: U256,
    pub nonce: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApiRequest {
    pub uri: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
