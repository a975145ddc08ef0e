//! EVM bridge contract ABI: event decoding and mint calldata

use crate::error::{RelayerError, RelayerResult};
use crate::events::{Bytes32, ChainEvent, ChainId, EventKind};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use lazy_static::lazy_static;

pub const BURN_EVENT: &str = "BurnEvent(address,address,uint256)";
pub const MINT_EVENT: &str = "MintEvent(address,address,uint256)";
pub const MINT_AND_BRIDGE: &str = "mintAndBridge(bytes32,address,uint256)";

lazy_static! {
    static ref BURN_TOPIC: H256 = H256::from(keccak256(BURN_EVENT));
    static ref MINT_TOPIC: H256 = H256::from(keccak256(MINT_EVENT));
}

fn malformed(message: impl Into<String>) -> RelayerError {
    RelayerError::MalformedEvent {
        chain: ChainId::Evm,
        message: message.into(),
    }
}

/// Decode a bridge log into a normalized event.
///
/// Accepts both the plain layout (all fields in data) and the layout with
/// `token` and `owner` indexed. Logs carry no time, so the block's
/// timestamp is passed in by the caller.
pub fn decode_log(log: &Log, block_time: Option<i64>) -> RelayerResult<ChainEvent> {
    let topic0 = log.topics.first().ok_or_else(|| malformed("log has no topics"))?;
    let kind = if *topic0 == *BURN_TOPIC {
        EventKind::Burn
    } else if *topic0 == *MINT_TOPIC {
        EventKind::Mint
    } else {
        return Err(malformed(format!("unknown event topic {:?}", topic0)));
    };

    let (token, owner, amount) = match log.topics.len() {
        1 => {
            let tokens = abi::decode(
                &[ParamType::Address, ParamType::Address, ParamType::Uint(256)],
                &log.data,
            )
            .map_err(|e| malformed(format!("undecodable data: {}", e)))?;
            match tokens.as_slice() {
                [Token::Address(token), Token::Address(owner), Token::Uint(amount)] => {
                    (*token, *owner, *amount)
                }
                _ => return Err(malformed("unexpected data layout")),
            }
        }
        3 => {
            let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)
                .map_err(|e| malformed(format!("undecodable data: {}", e)))?;
            let amount = match tokens.as_slice() {
                [Token::Uint(amount)] => *amount,
                _ => return Err(malformed("unexpected data layout")),
            };
            (
                Address::from(log.topics[1]),
                Address::from(log.topics[2]),
                amount,
            )
        }
        n => return Err(malformed(format!("unexpected topic count {}", n))),
    };

    let position = log
        .block_number
        .ok_or_else(|| malformed("log has no block number"))?
        .as_u64();
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| malformed("log has no transaction hash"))?;
    let log_index = log
        .log_index
        .ok_or_else(|| malformed("log has no index"))?;

    Ok(ChainEvent {
        chain: ChainId::Evm,
        position,
        tx_id: format!("{:?}", tx_hash),
        event_seq: log_index.low_u32(),
        kind,
        token: Bytes32::from_evm_address(token),
        owner: Bytes32::from_evm_address(owner),
        amount,
        timestamp: block_time,
    })
}

/// Calldata for `mintAndBridge(foreignToken, receiver, amount)`
pub fn encode_mint(foreign_token: &Bytes32, receiver: Address, amount: U256) -> Vec<u8> {
    let mut data = keccak256(MINT_AND_BRIDGE)[..4].to_vec();
    data.extend(abi::encode(&[
        Token::FixedBytes(foreign_token.0.to_vec()),
        Token::Address(receiver),
        Token::Uint(amount),
    ]));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn token() -> Address {
        "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".parse().unwrap()
    }

    fn owner() -> Address {
        "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".parse().unwrap()
    }

    fn log_with(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(42u64)),
            transaction_hash: Some(H256::repeat_byte(0xab)),
            log_index: Some(U256::from(3u64)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_unindexed_burn() {
        let data = abi::encode(&[
            Token::Address(token()),
            Token::Address(owner()),
            Token::Uint(U256::from(1000u64)),
        ]);
        let event = decode_log(&log_with(vec![*BURN_TOPIC], data), Some(1_700_000_000)).unwrap();

        assert_eq!(event.kind, EventKind::Burn);
        assert_eq!(event.position, 42);
        assert_eq!(event.event_seq, 3);
        assert_eq!(event.token, Bytes32::from_evm_address(token()));
        assert_eq!(event.owner, Bytes32::from_evm_address(owner()));
        assert_eq!(event.amount, U256::from(1000u64));
        assert_eq!(event.tx_id, format!("{:?}", H256::repeat_byte(0xab)));
        assert_eq!(event.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn decodes_indexed_mint() {
        let topics = vec![*MINT_TOPIC, H256::from(token()), H256::from(owner())];
        let data = abi::encode(&[Token::Uint(U256::from(5u64))]);
        let event = decode_log(&log_with(topics, data), None).unwrap();

        assert_eq!(event.kind, EventKind::Mint);
        assert_eq!(event.owner, Bytes32::from_evm_address(owner()));
        assert_eq!(event.amount, U256::from(5u64));
    }

    #[test]
    fn rejects_foreign_and_truncated_logs() {
        let foreign = log_with(vec![H256::repeat_byte(1)], vec![]);
        assert!(matches!(
            decode_log(&foreign, None),
            Err(RelayerError::MalformedEvent { .. })
        ));

        let truncated = log_with(vec![*BURN_TOPIC], vec![0u8; 40]);
        assert!(decode_log(&truncated, None).is_err());
    }

    #[test]
    fn mint_calldata_has_selector_and_three_words() {
        let foreign = Bytes32([9u8; 32]);
        let data = encode_mint(&foreign, owner(), U256::from(7u64));

        assert_eq!(data.len(), 4 + 32 * 3);
        assert_eq!(&data[..4], &keccak256(MINT_AND_BRIDGE)[..4]);
        assert_eq!(&data[4..36], &foreign.0);
        assert_eq!(&data[48..68], owner().as_bytes());
        assert_eq!(data[99], 7);
    }
}
