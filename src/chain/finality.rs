//! Chain finality policies
//!
//! The two ledgers finalize differently:
//! - EVM: probabilistic, a block is final once N blocks are built on top of it
//!   (or when the node reports it under the `finalized` tag)
//! - Solana: the cluster votes slots up to `confirmed` and then `finalized`
//!   commitment; the relayer reads the slot at its configured commitment

use crate::config::SolanaCommitment;
use crate::events::Position;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityDepth {
    /// Blocks that must be built on top of the event's block
    Confirmations(u64),
    /// Node-reported finalized block tag
    FinalizedTag,
    /// Solana commitment level
    Commitment(SolanaCommitment),
}

impl FinalityDepth {
    /// Highest final position given the chain head, for block-count policies
    pub fn finalized_from_head(&self, head: Position) -> Position {
        match self {
            FinalityDepth::Confirmations(depth) => head.saturating_sub(*depth),
            FinalityDepth::FinalizedTag | FinalityDepth::Commitment(_) => head,
        }
    }

    /// Whether an inclusion at `included` is final with the chain head at `head`
    pub fn is_final(&self, included: Position, head: Position) -> bool {
        match self {
            FinalityDepth::Confirmations(depth) => head.saturating_sub(included) >= *depth,
            FinalityDepth::FinalizedTag | FinalityDepth::Commitment(_) => included <= head,
        }
    }
}

impl fmt::Display for FinalityDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalityDepth::Confirmations(n) => write!(f, "{} confirmations", n),
            FinalityDepth::FinalizedTag => write!(f, "finalized tag"),
            FinalityDepth::Commitment(SolanaCommitment::Confirmed) => write!(f, "confirmed"),
            FinalityDepth::Commitment(SolanaCommitment::Finalized) => write!(f, "finalized"),
        }
    }
}

/// Get recommended confirmation blocks for an EVM chain id
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Local anvil / hardhat
        31337 => 1,
        // Default conservative
        _ => 64,
    }
}
