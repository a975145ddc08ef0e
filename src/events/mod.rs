//! Normalized bridge events shared by both chain adapters
//!
//! Both bridges emit the same logical schema: `{token, owner, amount}` for a
//! burn or a mint. Adapters translate their native logs into [`ChainEvent`],
//! which is what the relay engine and the action log operate on.

use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Block number on the EVM chain, slot on the Solana chain
pub type Position = u64;

/// The two ledgers bridged by this relayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Evm,
    Solana,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Evm => "evm",
            ChainId::Solana => "solana",
        }
    }

    /// The chain a burn on `self` is minted on
    pub fn counterpart(&self) -> ChainId {
        match self {
            ChainId::Evm => ChainId::Solana,
            ChainId::Solana => ChainId::Evm,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evm" => Ok(ChainId::Evm),
            "solana" => Ok(ChainId::Solana),
            other => Err(RelayerError::Config(format!("Unknown chain: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Burn,
    Mint,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Burn => "burn",
            EventKind::Mint => "mint",
        }
    }
}

/// Fixed-width 32-byte reference used to address tokens and accounts on
/// either ledger. EVM addresses are left-padded with zeros.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32([0u8; 32]);

    pub fn from_evm_address(address: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address.as_bytes());
        Bytes32(bytes)
    }

    /// Recover the EVM address, if the upper 12 bytes are zero
    pub fn to_evm_address(&self) -> Option<Address> {
        if self.0[..12].iter().all(|b| *b == 0) {
            Some(Address::from_slice(&self.0[12..]))
        } else {
            None
        }
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Parse a chain-native textual address (hex for EVM, base58 for Solana)
    pub fn parse_for(chain: ChainId, value: &str) -> RelayerResult<Self> {
        match chain {
            ChainId::Evm => {
                let address = Address::from_str(value).map_err(|e| {
                    RelayerError::Config(format!("Invalid EVM address {}: {}", value, e))
                })?;
                Ok(Self::from_evm_address(address))
            }
            ChainId::Solana => {
                let decoded = bs58::decode(value).into_vec().map_err(|e| {
                    RelayerError::Config(format!("Invalid Solana address {}: {}", value, e))
                })?;
                let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
                    RelayerError::Config(format!("Solana address {} is not 32 bytes", value))
                })?;
                Ok(Bytes32(bytes))
            }
        }
    }

    /// Render in the chain-native textual form
    pub fn display_for(&self, chain: ChainId) -> String {
        match (chain, self.to_evm_address()) {
            (ChainId::Evm, Some(address)) => format!("{:?}", address),
            (ChainId::Solana, _) => self.to_base58(),
            (ChainId::Evm, None) => self.to_string(),
        }
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes32({})", self)
    }
}

impl FromStr for Bytes32 {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| RelayerError::Internal(format!("Invalid bytes32 {}: {}", s, e)))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| RelayerError::Internal(format!("{} is not 32 bytes", s)))?;
        Ok(Bytes32(bytes))
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Bytes32::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A burn or mint observed on one chain. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: ChainId,
    /// Block number or slot containing the event
    pub position: Position,
    /// Transaction hash (EVM) or signature (Solana)
    pub tx_id: String,
    /// Log index (EVM) or event ordinal within the transaction (Solana)
    pub event_seq: u32,
    pub kind: EventKind,
    pub token: Bytes32,
    pub owner: Bytes32,
    pub amount: U256,
    /// Unix seconds, when the chain reports it
    pub timestamp: Option<i64>,
}

impl ChainEvent {
    /// Human readable unique identifier
    pub fn event_id(&self) -> String {
        format!("{}:{}:{}", self.chain, self.tx_id, self.event_seq)
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(self.chain, &self.tx_id, self.event_seq)
    }
}

/// Deterministic dedup key for a [`ChainEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// keccak256 over `chain || 0x00 || tx_id || 0x00 || seq_be`
    pub fn derive(chain: ChainId, tx_id: &str, event_seq: u32) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(tx_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(event_seq.to_be_bytes());
        IdempotencyKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
        if valid {
            Ok(IdempotencyKey(s.to_ascii_lowercase()))
        } else {
            Err(RelayerError::Internal(format!("Invalid idempotency key: {}", s)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burn(tx_id: &str, seq: u32) -> ChainEvent {
        ChainEvent {
            chain: ChainId::Evm,
            position: 10,
            tx_id: tx_id.to_string(),
            event_seq: seq,
            kind: EventKind::Burn,
            token: Bytes32::ZERO,
            owner: Bytes32::ZERO,
            amount: U256::from(5u64),
            timestamp: None,
        }
    }

    #[test]
    fn idempotency_key_depends_only_on_event_identity() {
        let a = burn("0xabc", 0);
        let mut b = burn("0xabc", 0);
        b.amount = U256::from(99u64);
        b.position = 11;
        assert_eq!(a.idempotency_key(), b.idempotency_key());

        assert_ne!(a.idempotency_key(), burn("0xabc", 1).idempotency_key());
        assert_ne!(a.idempotency_key(), burn("0xabd", 0).idempotency_key());

        let mut other_chain = burn("0xabc", 0);
        other_chain.chain = ChainId::Solana;
        assert_ne!(a.idempotency_key(), other_chain.idempotency_key());
    }

    #[test]
    fn idempotency_key_parses_back() {
        let key = burn("0xabc", 3).idempotency_key();
        let parsed: IdempotencyKey = key.as_str().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("not-a-key".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn evm_addresses_are_left_padded() {
        let address: Address = "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap();
        let padded = Bytes32::from_evm_address(address);
        assert!(padded.0[..12].iter().all(|b| *b == 0));
        assert_eq!(padded.to_evm_address(), Some(address));

        let parsed = Bytes32::parse_for(ChainId::Evm, "0x5FbDB2315678afecb367f032d93F642f64180aa3")
            .unwrap();
        assert_eq!(parsed, padded);
    }

    #[test]
    fn solana_addresses_round_trip_through_base58() {
        let text = "BNnLzXd4awDnxnycVseH2aN2dHV5grBQc6ucJJabtiZt";
        let parsed = Bytes32::parse_for(ChainId::Solana, text).unwrap();
        assert_eq!(parsed.to_base58(), text);
        assert!(Bytes32::parse_for(ChainId::Solana, "short").is_err());
    }

    #[test]
    fn event_serializes_with_hex_refs() {
        let event = burn("0xabc", 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["chain"], "evm");
        assert_eq!(json["kind"], "burn");
        let back: ChainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
