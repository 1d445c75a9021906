pub mod auth;

pub use auth::{balance_proof_middleware, parse_balance_proof};
