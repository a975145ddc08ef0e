//! Token pair registry and beneficiary address book
//!
//! Amounts are opaque integers in each token's smallest unit. When the two
//! sides of a pair use different precision the mapping carries a rational
//! scale factor, and conversion truncates toward zero: the fractional part of
//! a destination unit is forfeited, never rounded up into a mint.

use crate::config::{AccountLinkConfig, TokenMappingConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{Bytes32, ChainId};

use ethers::types::U256;
use std::collections::HashMap;
use std::fmt;

/// Destination units per source unit, as `numerator / denominator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleFactor {
    numerator: U256,
    denominator: U256,
}

/// Result of converting a source amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    pub amount: U256,
    /// Dropped fraction of one destination unit, in units of `1 / denominator`
    pub forfeited: U256,
}

impl ScaleFactor {
    pub const IDENTITY: ScaleFactor = ScaleFactor {
        numerator: U256([1, 0, 0, 0]),
        denominator: U256([1, 0, 0, 0]),
    };

    pub fn new(numerator: u128, denominator: u128) -> RelayerResult<Self> {
        if denominator == 0 {
            return Err(RelayerError::Mapping(
                "scale denominator must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            numerator: U256::from(numerator),
            denominator: U256::from(denominator),
        })
    }

    /// Scale between two decimal precisions, e.g. 18 -> 9 divides by 10^9
    pub fn from_decimals(source: u8, destination: u8) -> Self {
        let ten = U256::from(10u64);
        if destination >= source {
            Self {
                numerator: ten.pow(U256::from(destination - source)),
                denominator: U256::one(),
            }
        } else {
            Self {
                numerator: U256::one(),
                denominator: ten.pow(U256::from(source - destination)),
            }
        }
    }

    pub fn convert(&self, amount: U256) -> RelayerResult<Conversion> {
        let scaled = amount.checked_mul(self.numerator).ok_or_else(|| {
            RelayerError::Mapping(format!("amount {} overflows when scaled by {}", amount, self))
        })?;
        let (amount, forfeited) = scaled.div_mod(self.denominator);
        Ok(Conversion { amount, forfeited })
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// A registered token pair for one bridging direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMapping {
    pub source_chain: ChainId,
    pub source_token: Bytes32,
    pub destination_token: Bytes32,
    pub scale: ScaleFactor,
}

impl TokenMapping {
    pub fn destination_chain(&self) -> ChainId {
        self.source_chain.counterpart()
    }

    fn from_config(config: &TokenMappingConfig) -> RelayerResult<Self> {
        let source_token = Bytes32::parse_for(config.source, &config.source_token)?;
        let destination_token =
            Bytes32::parse_for(config.source.counterpart(), &config.destination_token)?;

        let scale = match (
            config.scale_numerator,
            config.scale_denominator,
            config.source_decimals,
            config.destination_decimals,
        ) {
            (Some(n), d, _, _) => ScaleFactor::new(n, d.unwrap_or(1))?,
            (None, Some(d), _, _) => ScaleFactor::new(1, d)?,
            (None, None, Some(s), Some(d)) => ScaleFactor::from_decimals(s, d),
            _ => ScaleFactor::IDENTITY,
        };

        Ok(Self {
            source_chain: config.source,
            source_token,
            destination_token,
            scale,
        })
    }
}

/// Read-only registry of token pairs, keyed by source chain and token
#[derive(Debug, Clone, Default)]
pub struct TokenMappings {
    pairs: HashMap<(ChainId, Bytes32), TokenMapping>,
}

impl TokenMappings {
    pub fn new(mappings: impl IntoIterator<Item = TokenMapping>) -> Self {
        Self {
            pairs: mappings
                .into_iter()
                .map(|m| ((m.source_chain, m.source_token), m))
                .collect(),
        }
    }

    pub fn from_config(configs: &[TokenMappingConfig]) -> RelayerResult<Self> {
        let mappings = configs
            .iter()
            .map(TokenMapping::from_config)
            .collect::<RelayerResult<Vec<_>>>()?;
        Ok(Self::new(mappings))
    }

    pub fn lookup(&self, chain: ChainId, token: &Bytes32) -> Option<&TokenMapping> {
        self.pairs.get(&(chain, *token))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Links a holder's EVM address with their Solana wallet
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    evm_to_solana: HashMap<Bytes32, Bytes32>,
    solana_to_evm: HashMap<Bytes32, Bytes32>,
}

impl AddressBook {
    pub fn link(&mut self, evm: Bytes32, solana: Bytes32) {
        self.evm_to_solana.insert(evm, solana);
        self.solana_to_evm.insert(solana, evm);
    }

    pub fn from_config(configs: &[AccountLinkConfig]) -> RelayerResult<Self> {
        let mut book = Self::default();
        for link in configs {
            book.link(
                Bytes32::parse_for(ChainId::Evm, &link.evm)?,
                Bytes32::parse_for(ChainId::Solana, &link.solana)?,
            );
        }
        Ok(book)
    }

    /// Account on the other chain for an owner on `chain`
    pub fn counterpart(&self, chain: ChainId, owner: &Bytes32) -> Option<Bytes32> {
        match chain {
            ChainId::Evm => self.evm_to_solana.get(owner).copied(),
            ChainId::Solana => self.solana_to_evm.get(owner).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_truncates_toward_zero() {
        let third = ScaleFactor::new(1, 3).unwrap();
        let result = third.convert(U256::from(7u64)).unwrap();
        assert_eq!(result.amount, U256::from(2u64));
        assert_eq!(result.forfeited, U256::from(1u64));

        // 2/3 of 7 is 4.67, never rounded up to 5
        let two_thirds = ScaleFactor::new(2, 3).unwrap();
        assert_eq!(two_thirds.convert(U256::from(7u64)).unwrap().amount, U256::from(4u64));
    }

    #[test]
    fn identity_preserves_amounts() {
        let result = ScaleFactor::IDENTITY.convert(U256::from(1000u64)).unwrap();
        assert_eq!(result.amount, U256::from(1000u64));
        assert!(result.forfeited.is_zero());
    }

    #[test]
    fn decimal_scaling_drops_sub_unit_dust() {
        // 18 decimals down to 9
        let down = ScaleFactor::from_decimals(18, 9);
        let result = down.convert(U256::from(1_500_000_001u64)).unwrap();
        assert_eq!(result.amount, U256::from(1u64));
        assert_eq!(result.forfeited, U256::from(500_000_001u64));

        // dust below one destination unit converts to zero
        assert!(down.convert(U256::from(999u64)).unwrap().amount.is_zero());

        let up = ScaleFactor::from_decimals(6, 9);
        assert_eq!(up.convert(U256::from(5u64)).unwrap().amount, U256::from(5000u64));
    }

    #[test]
    fn overflow_is_a_mapping_error() {
        let huge = ScaleFactor::new(u128::MAX, 1).unwrap();
        let err = huge.convert(U256::MAX).unwrap_err();
        assert!(matches!(err, RelayerError::Mapping(_)));
        assert!(ScaleFactor::new(1, 0).is_err());
    }

    #[test]
    fn builds_from_configuration() {
        std::env::set_var("TEST_DB_PASSWORD", "x");
        let settings = crate::config::Settings::parse(crate::config::tests::SAMPLE).unwrap();
        let mappings = TokenMappings::from_config(&settings.tokens).unwrap();
        assert_eq!(mappings.len(), 2);

        let evm_token =
            Bytes32::parse_for(ChainId::Evm, "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512").unwrap();
        let mapping = mappings.lookup(ChainId::Evm, &evm_token).unwrap();
        assert_eq!(mapping.destination_chain(), ChainId::Solana);
        assert_eq!(mapping.scale, ScaleFactor::IDENTITY);
        assert!(mappings.lookup(ChainId::Solana, &evm_token).is_none());

        let book = AddressBook::from_config(&settings.accounts).unwrap();
        let alice_evm =
            Bytes32::parse_for(ChainId::Evm, "0x70997970C51812dc3A010C7d01b50e0d17dc79C8").unwrap();
        let alice_sol = book.counterpart(ChainId::Evm, &alice_evm).unwrap();
        assert_eq!(book.counterpart(ChainId::Solana, &alice_sol), Some(alice_evm));
    }
}
