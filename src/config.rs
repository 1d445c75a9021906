use crate::client::SyncPolicy;
use crate::strategy::Funding;
use crate::types::{AtnError, Result};
use ethers::{signers::LocalWallet, types::Address};
use std::{env, str::FromStr, time::Duration};

pub const DEFAULT_RPC_URL: &str = "https://rpc-test.atnio.net";

/// Client settings read from `ATN_*` environment variables (and `.env`).
#[derive(Clone)]
pub struct Config {
    pub rpc_url: String,
    pub private_key: Option<String>,
    pub channel_manager: Option<Address>,
    /// Overrides the domain registered on the DBot contract.
    pub dbot_url: Option<String>,
    /// Deposit as a multiple of the endpoint price; 0 disables auto funding.
    pub deposit_multiplier: u64,
    pub confirmation_interval: Duration,
    pub confirmation_timeout: Duration,
    pub sync_interval: Duration,
    pub sync_timeout: Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |key: &str, default: &str| -> Result<u64> {
            let raw = lookup(key).unwrap_or_else(|| default.to_string());
            raw.trim()
                .parse()
                .map_err(|_| AtnError::config(format!("{} must be an integer, got {:?}", key, raw)))
        };
        let seconds = |key: &str, default: &str| parsed(key, default).map(Duration::from_secs);

        let channel_manager = lookup("ATN_CHANNEL_MANAGER")
            .map(|raw| {
                Address::from_str(raw.trim()).map_err(|_| {
                    AtnError::config(format!("ATN_CHANNEL_MANAGER is not an address: {}", raw))
                })
            })
            .transpose()?;

        Ok(Self {
            rpc_url: lookup("ATN_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            private_key: lookup("ATN_PRIVATE_KEY"),
            channel_manager,
            dbot_url: lookup("ATN_DBOT_URL"),
            deposit_multiplier: parsed("ATN_DEPOSIT_MULTIPLIER", "10")?,
            confirmation_interval: seconds("ATN_CONFIRMATION_INTERVAL_SECS", "3")?,
            confirmation_timeout: seconds("ATN_CONFIRMATION_TIMEOUT_SECS", "60")?,
            sync_interval: seconds("ATN_SYNC_INTERVAL_SECS", "5")?,
            sync_timeout: seconds("ATN_SYNC_TIMEOUT_SECS", "25")?,
            request_timeout: seconds("ATN_REQUEST_TIMEOUT_SECS", "30")?,
        })
    }

    pub fn wallet(&self) -> Result<LocalWallet> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| AtnError::config("ATN_PRIVATE_KEY must be set"))?;
        LocalWallet::from_str(key.trim().trim_start_matches("0x"))
            .map_err(|e| AtnError::config(format!("invalid ATN_PRIVATE_KEY: {}", e)))
    }

    pub fn channel_manager(&self) -> Result<Address> {
        self.channel_manager
            .ok_or_else(|| AtnError::config("ATN_CHANNEL_MANAGER must be set"))
    }

    pub fn funding(&self) -> Funding {
        Funding::from_multiplier(self.deposit_multiplier)
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            poll_interval: self.sync_interval,
            timeout: self.sync_timeout,
        }
    }
}
