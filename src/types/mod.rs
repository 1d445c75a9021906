pub mod channel;
pub mod error;

pub use channel::{
    ApiRequest, ApiResponse, BalanceProof, Channel, ChannelId, ChannelState, ChannelView,
    DbotInfo, EndpointPrice, SyncStatus, TxReceipt,
};
pub use error::{AtnError, ProofError, Result};
