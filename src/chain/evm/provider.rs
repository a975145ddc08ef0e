//! EVM RPC provider with multi-endpoint failover

use crate::config::{EvmChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainId;

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    config: EvmChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmProvider {
    pub fn new(config: EvmChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Config(format!(
                "No valid RPC providers for EVM chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn transient(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::TransientNetwork {
            chain: ChainId::Evm,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.transient("All providers failed"))
    }

    /// Number of the block the node reports under the `finalized` tag
    pub async fn get_finalized_block_number(&self) -> RelayerResult<u64> {
        let block = self
            .http()
            .get_block(BlockNumber::Finalized)
            .await
            .map_err(|e| self.transient(e.to_string()))?
            .ok_or_else(|| self.transient("Node has no finalized block"))?;

        block
            .number
            .map(|n| n.as_u64())
            .ok_or_else(|| self.transient("Finalized block has no number"))
    }

    /// Hash of the canonical block at `number`
    pub async fn get_block_hash(&self, number: u64) -> RelayerResult<Option<H256>> {
        let block = self
            .http()
            .get_block(number)
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        Ok(block.and_then(|b| b.hash))
    }

    /// Unix timestamp of the canonical block at `number`
    pub async fn get_block_timestamp(&self, number: u64) -> RelayerResult<Option<i64>> {
        let block = self
            .http()
            .get_block(number)
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        Ok(block.map(|b| b.timestamp.low_u64() as i64))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.transient("All providers failed to get logs"))
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.transient(e.to_string()))
    }

    /// Transaction as known to the node, mined or still in its mempool
    pub async fn get_transaction(&self, tx_hash: H256) -> RelayerResult<Option<Transaction>> {
        self.http()
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.transient(e.to_string()))
    }

    /// Next nonce for `address`, counting transactions in the node's mempool
    pub async fn get_pending_nonce(&self, address: Address) -> RelayerResult<u64> {
        let nonce = self
            .http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    pub async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| self.transient(e.to_string()))
    }

    /// Estimate gas for a transaction; reverts are reported as rejections
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RelayerError::rejected(ChainId::Evm, &e.to_string()))
    }

    /// Broadcast signed bytes, returning the node-reported hash
    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| RelayerError::rejected(ChainId::Evm, &e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.transient(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.transient(e.to_string()))?
            .ok_or_else(|| self.transient("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::Config("Chain has no base fee, use legacy pricing".into()))?;

        // 2 gwei tip
        let priority_fee = U256::from(2_000_000_000u64);

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);
        let priority_fee = std::cmp::min(priority_fee, max_fee);

        Ok((max_fee, priority_fee))
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// EIP-155 chain id
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
