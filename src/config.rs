use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::chain::ChainSettings;
use crate::model::{normalize_wallet, UserId};
use crate::service::ServiceSettings;

#[derive(Parser, Debug)]
#[command(name = "subscription-backend")]
#[command(about = "On-chain subscription status, sync and renewal service")]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the renewal worker until interrupted
    Run,
    /// Read a wallet's on-chain subscription
    Status {
        wallet: String,
        /// Skip the cache
        #[arg(long)]
        fresh: bool,
    },
    /// Copy on-chain status into the user's record
    Sync { user_id: UserId },
    /// Store a wallet on the user's record
    LinkWallet { user_id: UserId, wallet: String },
    /// Run a single renewal tick
    Renew,
    /// Print the contract's plan terms
    Plan,
    /// Probe the RPC endpoint and print the breaker state
    State,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value = "5")]
    pub db_max_connections: u32,

    /// JSON-RPC endpoint of the chain
    #[arg(long, env = "BSC_RPC_URL")]
    pub rpc_url: Option<String>,

    #[arg(long, env = "BSC_CHAIN_ID", default_value = "56")]
    pub chain_id: u64,

    /// Subscription contract address
    #[arg(long, env = "SUBSCRIPTION_CONTRACT")]
    pub contract_address: Option<String>,

    /// Operator key used to send renewals (hex, 0x prefix optional)
    #[arg(long, env = "OPERATOR_PRIVATE_KEY", hide_env_values = true)]
    pub operator_private_key: Option<String>,

    #[arg(long, env = "WEB3_RPC_TIMEOUT_MS", default_value = "2500")]
    pub rpc_timeout_ms: u64,

    /// Fail-fast window after an RPC failure
    #[arg(long, env = "WEB3_COOLDOWN_MS", default_value = "30000")]
    pub cooldown_ms: u64,

    #[arg(long, env = "SUBSCRIPTION_ONCHAIN_CACHE_MS", default_value = "45000")]
    pub cache_ttl_ms: u64,

    #[arg(long, env = "SUBSCRIPTION_CACHE_CAPACITY", default_value = "10000")]
    pub cache_capacity: u64,

    #[arg(long, env = "RENEWAL_INTERVAL_SECS", default_value = "600")]
    pub renewal_interval_secs: u64,

    #[arg(long, env = "RENEWAL_INITIAL_DELAY_SECS", default_value = "15")]
    pub renewal_initial_delay_secs: u64,

    #[arg(long, env = "RENEWAL_BATCH_SIZE", default_value = "50")]
    pub renewal_batch_size: u32,

    /// How long to wait for a renewal receipt
    #[arg(long, env = "RENEWAL_CONFIRM_TIMEOUT_SECS", default_value = "90")]
    pub renewal_confirm_timeout_secs: u64,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        for (flag, value) in [
            ("--rpc-timeout-ms", self.rpc_timeout_ms),
            ("--cooldown-ms", self.cooldown_ms),
            ("--cache-ttl-ms", self.cache_ttl_ms),
            ("--cache-capacity", self.cache_capacity),
            ("--renewal-interval-secs", self.renewal_interval_secs),
            ("--renewal-confirm-timeout-secs", self.renewal_confirm_timeout_secs),
        ] {
            if value == 0 {
                bail!("{flag} must be > 0");
            }
        }
        if self.renewal_batch_size == 0 {
            bail!("--renewal-batch-size must be > 0");
        }
        if self.db_max_connections == 0 {
            bail!("--db-max-connections must be > 0");
        }
        Ok(())
    }

    pub fn chain_settings(&self) -> Result<ChainSettings> {
        let contract = self
            .contract_address
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(parse_contract)
            .transpose()?;

        let operator = self
            .operator_private_key
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                raw.trim_start_matches("0x")
                    .parse::<PrivateKeySigner>()
                    .context("OPERATOR_PRIVATE_KEY is not a valid private key")
            })
            .transpose()?;

        Ok(ChainSettings {
            rpc_url: self.rpc_url.clone().filter(|url| !url.trim().is_empty()),
            chain_id: self.chain_id,
            contract,
            operator,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        })
    }

    pub fn service_settings(&self) -> Result<ServiceSettings> {
        self.validate()?;
        Ok(ServiceSettings {
            chain: self.chain_settings()?,
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            cache_capacity: self.cache_capacity,
            renewal_batch_size: self.renewal_batch_size,
        })
    }

    pub fn renewal_initial_delay(&self) -> Duration {
        Duration::from_secs(self.renewal_initial_delay_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    /// Receipt wait for renewals; submission gets the plain rpc timeout.
    pub fn renewal_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal_confirm_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn parse_contract(raw: &str) -> Result<Address> {
    normalize_wallet(raw).context("SUBSCRIPTION_CONTRACT is not a valid address")
}
