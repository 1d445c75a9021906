pub mod crypto;
pub mod poll;
