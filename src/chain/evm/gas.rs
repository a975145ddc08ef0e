//! Gas limit and price buffering for mint transactions

use super::provider::{EvmProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for mint transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Pad a node estimate
    pub fn gas_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for the chain
    pub async fn get_gas_price(&self, provider: &EvmProvider) -> RelayerResult<GasPrice> {
        let buffered = self.buffer_price(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(price + price * self.gas_price_buffer_percent / 100)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas
                    + max_fee_per_gas * self.gas_price_buffer_percent / 100,
                max_priority_fee_per_gas: max_priority_fee_per_gas
                    + max_priority_fee_per_gas * self.gas_price_buffer_percent / 100,
            },
        }
    }

    /// Worst case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_limit_and_prices() {
        let gas = GasEstimator::new();
        assert_eq!(gas.gas_limit(U256::from(100_000u64)), U256::from(120_000u64));

        let legacy = gas.buffer_price(GasPrice::Legacy(U256::from(100u64)));
        assert_eq!(legacy, GasPrice::Legacy(U256::from(110u64)));

        let eip1559 = gas.buffer_price(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(1_000u64),
            max_priority_fee_per_gas: U256::from(100u64),
        });
        assert_eq!(
            eip1559,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(1_100u64),
                max_priority_fee_per_gas: U256::from(110u64),
            }
        );
    }

    #[test]
    fn cost_uses_the_fee_cap() {
        let price = GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50u64),
            max_priority_fee_per_gas: U256::from(2u64),
        };
        assert_eq!(
            GasEstimator::calculate_cost(U256::from(21_000u64), &price),
            U256::from(1_050_000u64)
        );
    }
}
