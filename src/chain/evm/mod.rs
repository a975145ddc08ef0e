//! EVM chain adapter
//!
//! Reads `BurnEvent`/`MintEvent` logs from the bridge contract and mints by
//! calling `mintAndBridge` with a locally signed transaction. Finality is a
//! confirmation depth, or the node's `finalized` tag when configured.

pub mod contract;
pub mod gas;
pub mod nonce;
pub mod provider;

use self::gas::GasEstimator;
use self::nonce::NonceManager;
use self::provider::{EvmProvider, GasPrice};
use super::finality::{recommended_confirmations, FinalityDepth};
use super::{
    ChainAdapter, ConfirmationStatus, DestinationCall, PreparedSubmission, SubmissionGuard,
    TxHandle,
};
use crate::config::EvmChainConfig;
use crate::error::{RejectionReason, RelayerError, RelayerResult};
use crate::events::{ChainEvent, ChainId, IdempotencyKey, Position};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub struct EvmAdapter {
    provider: EvmProvider,
    bridge: Address,
    wallet: LocalWallet,
    nonces: NonceManager,
    gas: GasEstimator,
    finality: FinalityDepth,
}

impl EvmAdapter {
    pub fn new(config: &EvmChainConfig) -> RelayerResult<Self> {
        let bridge = Address::from_str(&config.bridge_address).map_err(|e| {
            RelayerError::Config(format!("Invalid bridge address {}: {}", config.bridge_address, e))
        })?;
        let wallet = load_wallet(&config.private_key_env)?.with_chain_id(config.chain_id);

        let finality = if config.use_finalized_tag {
            FinalityDepth::FinalizedTag
        } else {
            FinalityDepth::Confirmations(
                config
                    .confirmation_blocks
                    .unwrap_or_else(|| recommended_confirmations(config.chain_id)),
            )
        };

        info!(
            "EVM adapter for chain {} using wallet {:?}, finality {}",
            config.chain_id,
            wallet.address(),
            finality
        );

        Ok(Self {
            provider: EvmProvider::new(config.clone())?,
            bridge,
            wallet,
            nonces: NonceManager::new(),
            gas: GasEstimator::new(),
            finality,
        })
    }

    async fn head(&self) -> RelayerResult<Position> {
        match self.finality {
            FinalityDepth::FinalizedTag => self.provider.get_finalized_block_number().await,
            _ => self.provider.get_block_number().await,
        }
    }

    fn build_mint_tx(
        &self,
        data: Vec<u8>,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let mut tx: TypedTransaction = match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .to(self.bridge)
                .from(self.wallet.address())
                .data(data)
                .nonce(nonce)
                .gas_price(*price)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .to(self.bridge)
                .from(self.wallet.address())
                .data(data)
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .into(),
        };
        tx.set_chain_id(self.provider.chain_id());
        tx
    }

    /// Price, estimate, fund-check and sign a mint at `nonce`
    async fn sign_mint(&self, data: Vec<u8>, nonce: u64) -> RelayerResult<PreparedSubmission> {
        let gas_price = self.gas.get_gas_price(&self.provider).await?;
        let mut tx = self.build_mint_tx(data, nonce, &gas_price);
        let gas_limit = self.gas.gas_limit(self.provider.estimate_gas(&tx).await?);
        tx.set_gas(gas_limit);

        let cost = GasEstimator::calculate_cost(gas_limit, &gas_price);
        let balance = self.provider.get_balance(self.wallet.address()).await?;
        if balance < cost {
            return Err(RelayerError::SubmissionRejected {
                chain: ChainId::Evm,
                reason: RejectionReason::InsufficientBalance,
            });
        }

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        Ok(PreparedSubmission {
            handle: TxHandle {
                chain: ChainId::Evm,
                id: format!("{:?}", hash),
                guard: Some(SubmissionGuard::Nonce(nonce)),
            },
            raw: raw.to_vec(),
        })
    }
}

/// Load the relayer key from the named environment variable
fn load_wallet(env_name: &str) -> RelayerResult<LocalWallet> {
    let key = std::env::var(env_name).map_err(|_| {
        RelayerError::Wallet(format!("No EVM key configured. Set {}", env_name))
    })?;
    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

/// Nonce a replacement must reuse, if the replaced transaction carried one
fn replacement_nonce(replacing: Option<&TxHandle>) -> Option<u64> {
    match &replacing?.guard {
        Some(SubmissionGuard::Nonce(nonce)) => Some(*nonce),
        _ => None,
    }
}

/// The node already holds these exact bytes
fn is_already_known(err: &RelayerError) -> bool {
    match err {
        RelayerError::SubmissionRejected {
            reason: RejectionReason::Other(msg),
            ..
        } => {
            let msg = msg.to_lowercase();
            msg.contains("already known") || msg.contains("known transaction")
        }
        _ => false,
    }
}

fn parse_hash(id: &str) -> RelayerResult<H256> {
    H256::from_str(id).map_err(|e| RelayerError::Internal(format!("Invalid tx hash {}: {}", id, e)))
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> ChainId {
        ChainId::Evm
    }

    fn finality_depth(&self) -> FinalityDepth {
        self.finality
    }

    async fn current_finalized_position(&self) -> RelayerResult<Position> {
        Ok(self.finality.finalized_from_head(self.head().await?))
    }

    async fn fetch_events(&self, from: Position, to: Position) -> RelayerResult<Vec<ChainEvent>> {
        let filter = Filter::new()
            .address(self.bridge)
            .events(vec![contract::BURN_EVENT, contract::MINT_EVENT])
            .from_block(from)
            .to_block(to);

        let logs = self.provider.get_logs(&filter).await?;

        let mut block_times = BTreeMap::new();
        for number in logs.iter().filter_map(|log| log.block_number) {
            let number = number.as_u64();
            if let Entry::Vacant(slot) = block_times.entry(number) {
                slot.insert(self.provider.get_block_timestamp(number).await?);
            }
        }

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            let block_time = log
                .block_number
                .and_then(|n| block_times.get(&n.as_u64()).copied().flatten());
            match contract::decode_log(&log, block_time) {
                Ok(event) => events.push(event),
                Err(e) => warn!(chain = "evm", "Skipping log: {}", e),
            }
        }
        events.sort_by_key(|e| (e.position, e.event_seq));

        debug!(chain = "evm", from, to, count = events.len(), "Fetched bridge events");
        Ok(events)
    }

    async fn prepare(
        &self,
        call: &DestinationCall,
        key: &IdempotencyKey,
        replacing: Option<&TxHandle>,
    ) -> RelayerResult<PreparedSubmission> {
        let receiver = call
            .beneficiary
            .as_ref()
            .and_then(|b| b.to_evm_address())
            .ok_or_else(|| {
                RelayerError::Mapping(format!("Action {} has no EVM beneficiary", key))
            })?;

        let data = contract::encode_mint(&call.foreign_token, receiver, call.amount);
        let nonce = match replacement_nonce(replacing) {
            // Same nonce as the dropped copy: if that copy is re-mined this
            // replacement is rejected, never minted twice.
            Some(nonce) => self.nonces.pin(nonce).await,
            None => {
                let on_chain = self.provider.get_pending_nonce(self.wallet.address()).await?;
                self.nonces.allocate(on_chain).await
            }
        };

        let prepared = match self.sign_mint(data, nonce).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.nonces.release(nonce).await;
                return Err(err);
            }
        };

        debug!(key = %key, tx = %prepared.handle.id, nonce, "Prepared EVM mint");
        Ok(prepared)
    }

    async fn broadcast(&self, prepared: &PreparedSubmission) -> RelayerResult<()> {
        let hash = parse_hash(&prepared.handle.id)?;
        match self
            .provider
            .send_raw_transaction(Bytes::from(prepared.raw.clone()))
            .await
        {
            Ok(sent) => {
                debug!(tx = ?sent, "Broadcast EVM mint");
                Ok(())
            }
            Err(err) if is_already_known(&err) => Ok(()),
            Err(err) => {
                // A mined copy of the same bytes reports its nonce as too low
                if let RelayerError::SubmissionRejected {
                    reason: RejectionReason::NonceRace,
                    ..
                } = &err
                {
                    if self.provider.get_transaction_receipt(hash).await?.is_some() {
                        return Ok(());
                    }
                }
                if let Some(SubmissionGuard::Nonce(nonce)) = &prepared.handle.guard {
                    self.nonces.release(*nonce).await;
                }
                Err(err)
            }
        }
    }

    async fn confirmation_status(&self, handle: &TxHandle) -> RelayerResult<ConfirmationStatus> {
        let hash = parse_hash(&handle.id)?;

        if let Some(receipt) = self.provider.get_transaction_receipt(hash).await? {
            if receipt.status == Some(U64::zero()) {
                return Ok(ConfirmationStatus::Failed("execution reverted".to_string()));
            }
            let Some(included) = receipt.block_number.map(|n| n.as_u64()) else {
                return Ok(ConfirmationStatus::Pending);
            };
            if let (Some(hash), Some(canonical)) = (
                receipt.block_hash,
                self.provider.get_block_hash(included).await?,
            ) {
                if hash != canonical {
                    return Ok(ConfirmationStatus::Reorged);
                }
            }
            let head = self.head().await?;
            return Ok(if self.finality.is_final(included, head) {
                ConfirmationStatus::Confirmed
            } else {
                ConfirmationStatus::Pending
            });
        }

        if handle.guard.is_some() && self.provider.get_transaction(hash).await?.is_some() {
            return Ok(ConfirmationStatus::Pending);
        }

        // Dropped. The replacement is pinned to this nonce, and the local
        // counter resyncs with the chain for everything after it.
        if handle.guard.is_some() {
            self.nonces.reset().await;
        }
        Ok(ConfirmationStatus::Reorged)
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}
