//! Solana chain adapter
//!
//! Discovers bridge events by walking `getSignaturesForAddress` over the
//! bridge program and decoding Anchor events from each transaction's logs.
//! Mints are `mint_and_bridge` instructions signed by the relayer keypair.
//! Finality is the configured commitment level.

pub mod events;
pub mod instruction;
pub mod signatures;

use self::instruction::MintAndBridge;
use self::signatures::{BridgeSignature, SignatureWindow};
use super::finality::FinalityDepth;
use super::{
    ChainAdapter, ConfirmationStatus, DestinationCall, PreparedSubmission, SubmissionGuard,
    TxHandle,
};
use crate::config::{SolanaChainConfig, SolanaCommitment};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, ChainId, IdempotencyKey, Position};

use async_trait::async_trait;
use ethers::types::U256;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcTransactionConfig};
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{TransactionStatus, UiTransactionEncoding};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct SolanaAdapter {
    rpc: RpcClient,
    program_id: Pubkey,
    keypair: Keypair,
    commitment: SolanaCommitment,
    page_limit: usize,
    window: Mutex<SignatureWindow>,
}

impl SolanaAdapter {
    pub fn new(config: &SolanaChainConfig) -> RelayerResult<Self> {
        let program_id = Pubkey::from_str(&config.bridge_program_id).map_err(|e| {
            RelayerError::Config(format!(
                "Invalid bridge program id {}: {}",
                config.bridge_program_id, e
            ))
        })?;
        let keypair = load_keypair(&config.keypair_env)?;
        let rpc = RpcClient::new_with_timeout_and_commitment(
            config.rpc_url.clone(),
            Duration::from_secs(config.rpc_timeout_secs),
            commitment_config(config.commitment),
        );

        info!(
            "Solana adapter for program {} using relayer {}, commitment {:?}",
            program_id,
            keypair.pubkey(),
            config.commitment
        );

        Ok(Self {
            rpc,
            program_id,
            keypair,
            commitment: config.commitment,
            page_limit: config.signature_page_limit,
            window: Mutex::new(SignatureWindow::default()),
        })
    }

    fn commitment_config(&self) -> CommitmentConfig {
        commitment_config(self.commitment)
    }

    /// Program history newer than `until` and at or above `from`, newest first
    async fn sweep(
        &self,
        from: Position,
        until: Option<Signature>,
    ) -> RelayerResult<Vec<BridgeSignature>> {
        let mut swept = Vec::new();
        let mut before = None;

        loop {
            let config = GetConfirmedSignaturesForAddress2Config {
                before,
                until,
                limit: Some(self.page_limit),
                commitment: Some(self.commitment_config()),
            };
            let page = self
                .rpc
                .get_signatures_for_address_with_config(&self.program_id, config)
                .await
                .map_err(transient)?;
            let exhausted = page.len() < self.page_limit;

            let mut reached_start = false;
            for entry in &page {
                if entry.slot < from {
                    reached_start = true;
                    break;
                }
                let signature = Signature::from_str(&entry.signature).map_err(|e| {
                    RelayerError::MalformedEvent {
                        chain: ChainId::Solana,
                        message: format!("bad signature {}: {}", entry.signature, e),
                    }
                })?;
                swept.push(BridgeSignature {
                    signature,
                    slot: entry.slot,
                    block_time: entry.block_time,
                    failed: entry.err.is_some(),
                });
            }

            if reached_start || exhausted {
                break;
            }
            match page.last() {
                Some(last) => before = Some(parse_signature(&last.signature)?),
                None => break,
            }
        }

        Ok(swept)
    }

    async fn transaction_logs(&self, signature: &Signature) -> RelayerResult<Vec<String>> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.commitment_config()),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .rpc
            .get_transaction_with_config(signature, config)
            .await
            .map_err(transient)?;

        Ok(match tx.transaction.meta.map(|meta| meta.log_messages) {
            Some(OptionSerializer::Some(logs)) => logs,
            _ => Vec::new(),
        })
    }

    /// Whether a transaction signed against `blockhash` can still be processed
    async fn blockhash_valid(&self, blockhash: &str) -> RelayerResult<bool> {
        let blockhash = Hash::from_str(blockhash)
            .map_err(|e| RelayerError::Internal(format!("Invalid blockhash {}: {}", blockhash, e)))?;
        self.rpc
            .is_blockhash_valid(&blockhash, CommitmentConfig::processed())
            .await
            .map_err(transient)
    }
}

/// Map a signature status to the relay view.
///
/// `expired` must be determined before `status` was fetched: an unknown
/// signature whose blockhash had already expired can never land, while one
/// that was still valid may yet be processed.
fn signature_outcome(
    status: Option<&TransactionStatus>,
    expired: bool,
    commitment: CommitmentConfig,
) -> ConfirmationStatus {
    match status {
        Some(status) => match &status.err {
            Some(err) => ConfirmationStatus::Failed(err.to_string()),
            None if status.satisfies_commitment(commitment) => ConfirmationStatus::Confirmed,
            None => ConfirmationStatus::Pending,
        },
        None if expired => ConfirmationStatus::Reorged,
        None => ConfirmationStatus::Pending,
    }
}

fn commitment_config(commitment: SolanaCommitment) -> CommitmentConfig {
    match commitment {
        SolanaCommitment::Confirmed => CommitmentConfig::confirmed(),
        SolanaCommitment::Finalized => CommitmentConfig::finalized(),
    }
}

/// Load the relayer keypair from an environment variable holding a JSON byte array
fn load_keypair(env_name: &str) -> RelayerResult<Keypair> {
    let raw = std::env::var(env_name).map_err(|_| {
        RelayerError::Wallet(format!("No Solana keypair configured. Set {}", env_name))
    })?;
    let bytes: Vec<u8> = serde_json::from_str(raw.trim())
        .map_err(|e| RelayerError::Wallet(format!("Keypair is not a JSON byte array: {}", e)))?;
    Keypair::try_from(bytes.as_slice())
        .map_err(|e| RelayerError::Wallet(format!("Invalid keypair: {}", e)))
}

fn transient(err: ClientError) -> RelayerError {
    RelayerError::TransientNetwork {
        chain: ChainId::Solana,
        message: err.to_string(),
    }
}

fn parse_signature(id: &str) -> RelayerResult<Signature> {
    Signature::from_str(id)
        .map_err(|e| RelayerError::Internal(format!("Invalid signature {}: {}", id, e)))
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain(&self) -> ChainId {
        ChainId::Solana
    }

    fn finality_depth(&self) -> FinalityDepth {
        FinalityDepth::Commitment(self.commitment)
    }

    async fn current_finalized_position(&self) -> RelayerResult<Position> {
        self.rpc
            .get_slot_with_commitment(self.commitment_config())
            .await
            .map_err(transient)
    }

    async fn fetch_events(&self, from: Position, to: Position) -> RelayerResult<Vec<ChainEvent>> {
        let program = self.program_id.to_string();
        let mut events = Vec::new();

        let mut window = self.window.lock().await;
        let until = window.begin(from);
        let swept = self.sweep(from, until).await?;
        window.extend(swept);

        for BridgeSignature {
            signature,
            slot,
            block_time,
            ..
        } in window.range(from, to)
        {
            let logs = self.transaction_logs(&signature).await?;
            let (decoded, errors) = events::parse_logs(&logs, &program);
            for e in errors {
                warn!(chain = "solana", tx = %signature, "Skipping event: {}", e);
            }

            events.extend(decoded.into_iter().map(|log| ChainEvent {
                chain: ChainId::Solana,
                position: slot,
                tx_id: signature.to_string(),
                event_seq: log.seq,
                kind: log.kind,
                token: log.token,
                owner: log.owner,
                amount: log.amount,
                timestamp: block_time,
            }));
        }

        window.commit(to);
        debug!(chain = "solana", from, to, count = events.len(), "Fetched bridge events");
        Ok(events)
    }

    /// A replacement is only prepared once the replaced transaction's
    /// blockhash has expired, so it needs no link to it.
    async fn prepare(
        &self,
        call: &DestinationCall,
        key: &IdempotencyKey,
        _replacing: Option<&TxHandle>,
    ) -> RelayerResult<PreparedSubmission> {
        let receiver = call.beneficiary.ok_or_else(|| {
            RelayerError::Mapping(format!("Action {} has no Solana beneficiary", key))
        })?;
        if call.amount > U256::from(u64::MAX) {
            return Err(RelayerError::Mapping(format!(
                "Amount {} for action {} exceeds the SPL u64 range",
                call.amount, key
            )));
        }

        let mint = MintAndBridge {
            program_id: self.program_id,
            relayer: self.keypair.pubkey(),
            receiver: Pubkey::new_from_array(receiver.0),
            token_mint: Pubkey::new_from_array(call.destination_token.0),
            foreign_address: call.foreign_token.0,
            amount: call.amount.low_u64(),
        };

        let (blockhash, _) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(transient)?;
        let tx = Transaction::new_signed_with_payer(
            &[mint.instruction()],
            Some(&self.keypair.pubkey()),
            &[&self.keypair],
            blockhash,
        );
        let signature = tx
            .signatures
            .first()
            .copied()
            .ok_or_else(|| RelayerError::Wallet("Transaction was not signed".to_string()))?;
        let raw = bincode::serialize(&tx)
            .map_err(|e| RelayerError::Internal(format!("Serializing transaction: {}", e)))?;

        debug!(key = %key, tx = %signature, "Prepared Solana mint");
        Ok(PreparedSubmission {
            handle: TxHandle {
                chain: ChainId::Solana,
                id: signature.to_string(),
                guard: Some(SubmissionGuard::Blockhash(blockhash.to_string())),
            },
            raw,
        })
    }

    async fn broadcast(&self, prepared: &PreparedSubmission) -> RelayerResult<()> {
        let tx: Transaction = bincode::deserialize(&prepared.raw)
            .map_err(|e| RelayerError::Internal(format!("Decoding prepared transaction: {}", e)))?;
        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            ..Default::default()
        };

        match self.rpc.send_transaction_with_config(&tx, config).await {
            Ok(signature) => {
                debug!(tx = %signature, "Broadcast Solana mint");
                Ok(())
            }
            Err(e) if e.to_string().contains("already been processed") => Ok(()),
            Err(e) => {
                let message = e.to_string();
                warn!(tx = %prepared.handle.id, "Solana broadcast failed: {}", message);
                Err(RelayerError::rejected(ChainId::Solana, &message))
            }
        }
    }

    async fn confirmation_status(&self, handle: &TxHandle) -> RelayerResult<ConfirmationStatus> {
        let signature = parse_signature(&handle.id)?;

        // Expiry first: a mint landing between the two calls still shows up
        // in the status lookup instead of being taken for a drop.
        let expired = match &handle.guard {
            Some(SubmissionGuard::Blockhash(blockhash)) => !self.blockhash_valid(blockhash).await?,
            _ => true,
        };

        let response = self
            .rpc
            .get_signature_statuses_with_history(&[signature])
            .await
            .map_err(transient)?;
        let status = response.value.into_iter().next().flatten();

        Ok(signature_outcome(status.as_ref(), expired, self.commitment_config()))
    }

    async fn health_check(&self) -> bool {
        match self.rpc.get_health().await {
            Ok(()) => true,
            Err(e) => {
                error!("Health check failed for Solana: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::transaction::TransactionError;
    use solana_transaction_status::TransactionConfirmationStatus;

    fn landed(err: Option<TransactionError>) -> TransactionStatus {
        TransactionStatus {
            slot: 42,
            confirmations: None,
            status: match &err {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
            err,
            confirmation_status: Some(TransactionConfirmationStatus::Finalized),
        }
    }

    #[test]
    fn unknown_signature_is_pending_while_its_blockhash_was_valid() {
        let outcome = signature_outcome(None, false, CommitmentConfig::finalized());
        assert_eq!(outcome, ConfirmationStatus::Pending);
    }

    #[test]
    fn unknown_signature_with_expired_blockhash_is_dropped() {
        let outcome = signature_outcome(None, true, CommitmentConfig::finalized());
        assert_eq!(outcome, ConfirmationStatus::Reorged);
    }

    #[test]
    fn landing_just_before_expiry_counts_as_confirmed() {
        let status = landed(None);
        let outcome = signature_outcome(Some(&status), true, CommitmentConfig::finalized());
        assert_eq!(outcome, ConfirmationStatus::Confirmed);
    }

    #[test]
    fn errored_transaction_is_failed() {
        let status = landed(Some(TransactionError::AccountNotFound));
        let outcome = signature_outcome(Some(&status), false, CommitmentConfig::confirmed());
        assert!(matches!(outcome, ConfirmationStatus::Failed(_)));
    }

    #[test]
    fn shallow_landing_is_pending() {
        let mut status = landed(None);
        status.confirmations = Some(1);
        status.confirmation_status = Some(TransactionConfirmationStatus::Processed);
        let outcome = signature_outcome(Some(&status), false, CommitmentConfig::finalized());
        assert_eq!(outcome, ConfirmationStatus::Pending);
    }
}
