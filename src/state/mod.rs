pub mod channel;
pub mod dbot;

pub use channel::ChannelManager;
pub use dbot::{AcceptedPayment, DbotState};
