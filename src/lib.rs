//! Micropayment channel client for paid DBot APIs.
//!
//! A sender locks a deposit in a unidirectional channel on the ledger and
//! pays each API call with an off-chain balance proof: the cumulative amount
//! owed plus a strictly increasing nonce, signed by the sender. The receiving
//! DBot redeems the latest proof when the channel is closed.
//!
//! [`AtnClient`] is the entry point for callers. [`create_dbot_router`] serves
//! the receiving side of the protocol.

pub mod client;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod network;
pub mod state;
pub mod strategy;
pub mod types;
pub mod utils;

pub use client::{AtnClient, SyncPolicy};
pub use config::Config;
pub use handlers::create_dbot_router;
pub use network::{
    DbotGateway, EthersLedger, HttpDbotGateway, InMemoryDbot, InMemoryLedger, LedgerGateway,
};
pub use state::{ChannelManager, DbotState};
pub use strategy::{DepositStrategy, Funding, Multiplier};
pub use types::{
    ApiRequest, ApiResponse, AtnError, BalanceProof, Channel, ChannelId, ChannelState,
    ChannelView, DbotInfo, EndpointPrice, Result, SyncStatus, TxReceipt,
};
