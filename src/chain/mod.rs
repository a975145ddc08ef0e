//! Chain module - adapters that normalize each ledger behind one interface
//!
//! This module provides:
//! - The [`ChainAdapter`] contract the relay engine is written against
//! - A restartable, lazy event subscription built on top of it
//! - Finality policies for block-count and commitment based chains
//! - The EVM and Solana adapter implementations

pub mod evm;
pub mod finality;
pub mod solana;
pub mod subscription;

#[cfg(test)]
pub mod mock;

pub use finality::FinalityDepth;
pub use subscription::{ChainItem, ChainListener, EventSubscription};

use crate::error::RelayerResult;
use crate::events::{Bytes32, ChainEvent, ChainId, IdempotencyKey, Position};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replay protection carried by a signed submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionGuard {
    /// EVM account nonce consumed by the transaction
    Nonce(u64),
    /// Solana recent blockhash the transaction was signed against
    Blockhash(String),
}

/// Reference to a transaction on a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub chain: ChainId,
    /// Transaction hash (EVM) or signature (Solana)
    pub id: String,
    pub guard: Option<SubmissionGuard>,
}

impl TxHandle {
    /// Handle for a transaction the relayer did not send, e.g. a source burn
    pub fn observed(chain: ChainId, id: impl Into<String>) -> Self {
        Self {
            chain,
            id: id.into(),
            guard: None,
        }
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Known to the chain but not yet at finality depth
    Pending,
    /// At or beyond finality depth and successful
    Confirmed,
    /// No longer part of the canonical chain, or dropped before inclusion
    Reorged,
    /// Included but reverted / errored
    Failed(String),
}

/// The mint the relayer must perform on the destination chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCall {
    pub chain: ChainId,
    /// Source-chain token, which the destination bridge knows as its foreign reference
    pub foreign_token: Bytes32,
    /// Token minted on the destination chain
    pub destination_token: Bytes32,
    /// Recipient on the destination chain; `None` when no linked account is known
    pub beneficiary: Option<Bytes32>,
    pub amount: U256,
}

/// A signed transaction whose identity is known before it is broadcast.
///
/// Persisting this before broadcasting lets a restarted relayer find out
/// whether the transaction landed, and re-broadcast the identical bytes
/// instead of signing a second mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedSubmission {
    pub handle: TxHandle,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

/// Common interface over one ledger's event stream and submission primitive
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> ChainId;

    /// Minimum confirmation/commitment before an event is actionable
    fn finality_depth(&self) -> FinalityDepth;

    /// Highest position that satisfies the finality depth
    async fn current_finalized_position(&self) -> RelayerResult<Position>;

    /// Bridge events within `[from, to]`, ordered by position then sequence.
    /// Malformed logs are reported and skipped, never returned.
    async fn fetch_events(&self, from: Position, to: Position) -> RelayerResult<Vec<ChainEvent>>;

    /// Build and sign the mint transaction without broadcasting it.
    ///
    /// `replacing` is the earlier submission for the same action that the
    /// chain reported as dropped. The new transaction must be mutually
    /// exclusive with it, so that at most one of the two can ever land.
    async fn prepare(
        &self,
        call: &DestinationCall,
        key: &IdempotencyKey,
        replacing: Option<&TxHandle>,
    ) -> RelayerResult<PreparedSubmission>;

    /// Broadcast a prepared transaction; re-broadcasting the same bytes is harmless
    async fn broadcast(&self, prepared: &PreparedSubmission) -> RelayerResult<()>;

    async fn confirmation_status(&self, handle: &TxHandle) -> RelayerResult<ConfirmationStatus>;

    async fn health_check(&self) -> bool;
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
