//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::events::{Bytes32, ChainId};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub evm: EvmChainConfig,
    pub solana: SolanaChainConfig,
    #[serde(default)]
    pub tokens: Vec<TokenMappingConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountLinkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    /// Namespace for the leadership lock; two relayers sharing it exclude each other
    pub instance_id: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: u64,
    pub queue_capacity: usize,
    pub retention_hours: u64,
    pub health_check_interval_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl RelayerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            confirmation_poll_interval: Duration::from_millis(self.confirmation_poll_interval_ms),
        }
    }
}

/// Bounded exponential backoff for submissions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub confirmation_timeout: Duration,
    pub confirmation_poll_interval: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    /// EIP-155 chain id used for signing
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    /// Defaults to the recommended depth for `chain_id`
    #[serde(default)]
    pub confirmation_blocks: Option<u64>,
    /// Use the node's `finalized` tag instead of counting confirmations
    #[serde(default)]
    pub use_finalized_tag: bool,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    /// First block to scan when no cursor is stored (bridge deployment block)
    #[serde(default)]
    pub start_block: u64,
    /// Environment variable holding the relayer's hex private key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaChainConfig {
    pub rpc_url: String,
    pub bridge_program_id: String,
    pub commitment: SolanaCommitment,
    /// First slot to scan when no cursor is stored
    #[serde(default)]
    pub start_slot: u64,
    /// Environment variable holding the relayer keypair as a JSON byte array
    pub keypair_env: String,
    #[serde(default = "default_signature_page_limit")]
    pub signature_page_limit: usize,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_signature_page_limit() -> usize {
    1000
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SolanaCommitment {
    Confirmed,
    Finalized,
}

/// A registered token pair, as populated on-chain by the registration tooling
#[derive(Debug, Clone, Deserialize)]
pub struct TokenMappingConfig {
    /// Chain whose burns are relayed
    pub source: ChainId,
    /// Token address on the source chain
    pub source_token: String,
    /// Token address on the destination chain
    pub destination_token: String,
    pub scale_numerator: Option<u128>,
    pub scale_denominator: Option<u128>,
    pub source_decimals: Option<u8>,
    pub destination_decimals: Option<u8>,
}

/// Pairs the same holder's wallet on both chains
#[derive(Debug, Clone, Deserialize)]
pub struct AccountLinkConfig {
    pub evm: String,
    pub solana: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings for a specific environment
    pub fn load_env(env_name: &str) -> Result<Self> {
        Self::load_from(Path::new(&format!("config/{}.toml", env_name)))
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse a TOML document after substituting `${VAR}` references
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.relayer.max_attempts == 0 {
            anyhow::bail!("relayer.max_attempts must be at least 1");
        }
        if self.relayer.batch_size == 0 {
            anyhow::bail!("relayer.batch_size must be at least 1");
        }
        if self.evm.rpc_urls.is_empty() {
            anyhow::bail!("EVM chain has no RPC URLs configured");
        }
        Bytes32::parse_for(ChainId::Evm, &self.evm.bridge_address)
            .context("evm.bridge_address")?;
        Bytes32::parse_for(ChainId::Solana, &self.solana.bridge_program_id)
            .context("solana.bridge_program_id")?;

        let mut seen = HashSet::new();
        for token in &self.tokens {
            let source = Bytes32::parse_for(token.source, &token.source_token)
                .with_context(|| format!("token {}", token.source_token))?;
            Bytes32::parse_for(token.source.counterpart(), &token.destination_token)
                .with_context(|| format!("token {}", token.destination_token))?;
            if token.scale_denominator == Some(0) {
                anyhow::bail!("Token {} has a zero scale denominator", token.source_token);
            }
            if !seen.insert((token.source, source)) {
                anyhow::bail!(
                    "Token {} on {} is mapped more than once",
                    token.source_token,
                    token.source
                );
            }
        }

        for account in &self.accounts {
            Bytes32::parse_for(ChainId::Evm, &account.evm)
                .with_context(|| format!("account {}", account.evm))?;
            Bytes32::parse_for(ChainId::Solana, &account.solana)
                .with_context(|| format!("account {}", account.solana))?;
        }

        if self.tokens.is_empty() {
            tracing::warn!("No token mappings configured - every burn will be skipped");
        }

        Ok(())
    }

    /// Stored cursor default for a chain
    pub fn start_position(&self, chain: ChainId) -> u64 {
        match chain {
            ChainId::Evm => self.evm.start_block,
            ChainId::Solana => self.solana.start_slot,
        }
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
