use ethers::types::U256;
use std::fmt;
use std::sync::Arc;

/// Maps an endpoint price to the amount deposited when a channel is opened
/// or topped up automatically.
pub trait DepositStrategy: Send + Sync {
    fn amount_for(&self, price: U256) -> U256;
}

impl<F> DepositStrategy for F
where
    F: Fn(U256) -> U256 + Send + Sync,
{
    fn amount_for(&self, price: U256) -> U256 {
        self(price)
    }
}

/// Deposits `n` times the price.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Multiplier(pub u64);

impl Default for Multiplier {
    fn default() -> Self {
        Multiplier(10)
    }
}

impl DepositStrategy for Multiplier {
    fn amount_for(&self, price: U256) -> U256 {
        price.saturating_mul(U256::from(self.0))
    }
}

/// Whether calls may open and top up channels on their own.
#[derive(Clone)]
pub enum Funding {
    Disabled,
    Auto(Arc<dyn DepositStrategy>),
}

impl Funding {
    pub fn auto(strategy: impl DepositStrategy + 'static) -> Self {
        Funding::Auto(Arc::new(strategy))
    }

    /// `Multiplier(0)` disables auto funding.
    pub fn from_multiplier(multiplier: u64) -> Self {
        match multiplier {
            0 => Funding::Disabled,
            n => Funding::auto(Multiplier(n)),
        }
    }

    pub fn amount_for(&self, price: U256) -> Option<U256> {
        match self {
            Funding::Disabled => None,
            Funding::Auto(strategy) => Some(strategy.amount_for(price)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Funding::Auto(_))
    }
}

impl Default for Funding {
    fn default() -> Self {
        Funding::auto(Multiplier::default())
    }
}

impl fmt::Debug for Funding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Funding::Disabled => f.write_str("Funding::Disabled"),
            Funding::Auto(_) => f.write_str("Funding::Auto(..)"),
        }
    }
}
