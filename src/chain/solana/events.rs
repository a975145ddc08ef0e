//! Anchor event decoding from Solana transaction logs
//!
//! Anchor's `emit!` writes `Program data: <base64>` where the payload is an
//! 8-byte discriminator (`sha256("event:<Name>")[..8]`) followed by the
//! Borsh-encoded event. Both bridge events share the body
//! `{ token_mint: Pubkey, token_owner: Pubkey, amount: u64 }`.

use crate::error::{RelayerError, RelayerResult};
use crate::events::{Bytes32, ChainId, EventKind};

use base64::Engine;
use ethers::types::U256;
use sha2::{Digest, Sha256};

const PROGRAM_DATA: &str = "Program data: ";
const BODY_LEN: usize = 32 + 32 + 8;

/// Anchor discriminator for a named item in `namespace` ("event", "global")
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("{}:{}", namespace, name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// Event payload before it is placed on the chain timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLog {
    pub kind: EventKind,
    pub token: Bytes32,
    pub owner: Bytes32,
    pub amount: U256,
    /// Ordinal among this program's events in the transaction
    pub seq: u32,
}

fn malformed(message: impl Into<String>) -> RelayerError {
    RelayerError::MalformedEvent {
        chain: ChainId::Solana,
        message: message.into(),
    }
}

/// Decode one `Program data:` payload
pub fn decode_event(payload: &str) -> RelayerResult<Option<(EventKind, Bytes32, Bytes32, U256)>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| malformed(format!("invalid base64: {}", e)))?;
    if bytes.len() < 8 {
        return Err(malformed("payload shorter than a discriminator"));
    }

    let (tag, body) = bytes.split_at(8);
    let kind = if tag == discriminator("event", "BurnEvent") {
        EventKind::Burn
    } else if tag == discriminator("event", "MintEvent") {
        EventKind::Mint
    } else {
        return Ok(None);
    };

    if body.len() < BODY_LEN {
        return Err(malformed(format!(
            "{} body is {} bytes, expected {}",
            kind.as_str(),
            body.len(),
            BODY_LEN
        )));
    }

    let mut token = [0u8; 32];
    token.copy_from_slice(&body[..32]);
    let mut owner = [0u8; 32];
    owner.copy_from_slice(&body[32..64]);
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&body[64..72]);

    Ok(Some((
        kind,
        Bytes32(token),
        Bytes32(owner),
        U256::from(u64::from_le_bytes(amount)),
    )))
}

/// Bridge events emitted directly by `program_id` within one transaction's logs.
///
/// Tracks the invocation stack so data logged by other programs (including
/// CPIs made by the bridge) is ignored. Malformed payloads are returned as
/// errors alongside the good events.
pub fn parse_logs(logs: &[String], program_id: &str) -> (Vec<BridgeLog>, Vec<RelayerError>) {
    let invoke = format!("Program {} invoke", program_id);
    let mut stack: Vec<bool> = Vec::new();
    let mut events = Vec::new();
    let mut errors = Vec::new();
    let mut seq = 0u32;

    for line in logs {
        // "Program <id> ..." lines; "Program log:" / "Program data:" carry output
        let status_line = line
            .strip_prefix("Program ")
            .filter(|rest| rest.split(' ').next().is_some_and(|word| !word.ends_with(':')));
        if let Some(rest) = status_line {
            if rest.contains(" invoke [") {
                stack.push(line.starts_with(&invoke));
                continue;
            }
            if rest.ends_with(" success") || rest.contains(" failed") {
                stack.pop();
                continue;
            }
        }

        let Some(payload) = line.strip_prefix(PROGRAM_DATA) else {
            continue;
        };
        if stack.last() != Some(&true) {
            continue;
        }

        match decode_event(payload) {
            Ok(Some((kind, token, owner, amount))) => {
                events.push(BridgeLog {
                    kind,
                    token,
                    owner,
                    amount,
                    seq,
                });
                seq += 1;
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    (events, errors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PROGRAM: &str = "BNnLzXd4awDnxnycVseH2aN2dHV5grBQc6ucJJabtiZt";

    pub(crate) fn encode(name: &str, token: [u8; 32], owner: [u8; 32], amount: u64) -> String {
        let mut bytes = discriminator("event", name).to_vec();
        bytes.extend_from_slice(&token);
        bytes.extend_from_slice(&owner);
        bytes.extend_from_slice(&amount.to_le_bytes());
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn discriminators_differ_per_event() {
        assert_ne!(
            discriminator("event", "BurnEvent"),
            discriminator("event", "MintEvent")
        );
        assert_ne!(
            discriminator("event", "BurnEvent"),
            discriminator("global", "BurnEvent")
        );
    }

    #[test]
    fn decodes_burn_payload() {
        let payload = encode("BurnEvent", [1u8; 32], [2u8; 32], 5_000_000);
        let (kind, token, owner, amount) = decode_event(&payload).unwrap().unwrap();
        assert_eq!(kind, EventKind::Burn);
        assert_eq!(token, Bytes32([1u8; 32]));
        assert_eq!(owner, Bytes32([2u8; 32]));
        assert_eq!(amount, U256::from(5_000_000u64));
    }

    #[test]
    fn ignores_unknown_discriminators() {
        let payload = encode("SomethingElse", [1u8; 32], [2u8; 32], 1);
        assert_eq!(decode_event(&payload).unwrap(), None);
    }

    #[test]
    fn only_bridge_invocations_are_parsed() {
        let ours = encode("BurnEvent", [1u8; 32], [2u8; 32], 10);
        let theirs = encode("BurnEvent", [3u8; 32], [4u8; 32], 99);
        let mint = encode("MintEvent", [1u8; 32], [5u8; 32], 7);
        let logs: Vec<String> = vec![
            format!("Program {} invoke [1]", PROGRAM),
            "Program log: Instruction: BurnAndBridge".to_string(),
            "Program TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA invoke [2]".to_string(),
            format!("Program data: {}", theirs),
            "Program TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA success".to_string(),
            format!("Program data: {}", ours),
            format!("Program data: {}", mint),
            format!("Program {} success", PROGRAM),
        ];

        let (events, errors) = parse_logs(&logs, PROGRAM);
        assert!(errors.is_empty());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Burn);
        assert_eq!(events[0].amount, U256::from(10u64));
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].kind, EventKind::Mint);
        assert_eq!(events[1].seq, 1);
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut bytes = discriminator("event", "BurnEvent").to_vec();
        bytes.extend_from_slice(&[0u8; 10]);
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        let logs = vec![
            format!("Program {} invoke [1]", PROGRAM),
            format!("Program data: {}", payload),
            format!("Program {} success", PROGRAM),
        ];

        let (events, errors) = parse_logs(&logs, PROGRAM);
        assert!(events.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
