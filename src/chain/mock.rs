//! In-process chain used by unit and scenario tests

use super::{
    ChainAdapter, ConfirmationStatus, DestinationCall, FinalityDepth, PreparedSubmission,
    SubmissionGuard, TxHandle,
};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{Bytes32, ChainEvent, ChainId, EventKind, IdempotencyKey, Position};

use async_trait::async_trait;
use ethers::types::U256;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

#[derive(Default)]
struct MockState {
    events: Vec<ChainEvent>,
    finalized: Position,
    fetch_failures: u32,
    fetch_ranges: Vec<(Position, Position)>,
    prepared: Vec<DestinationCall>,
    /// Guard of every signed transaction, in signing order
    guards: Vec<SubmissionGuard>,
    /// Nonces consumed by landed transactions
    used_nonces: HashSet<u64>,
    broadcast_attempts: usize,
    /// Transactions the chain accepted into its pool
    broadcasts: Vec<String>,
    /// Submissions that reached the chain, by tx id
    landed: HashMap<String, DestinationCall>,
    /// Errors returned by upcoming `broadcast` calls
    broadcast_errors: VecDeque<RelayerError>,
    /// Statuses returned for upcoming `confirmation_status` calls on submitted txs
    scripted_statuses: VecDeque<ConfirmationStatus>,
    /// Source transactions that a reorg removed
    reorged: HashSet<String>,
    /// Source transactions not yet at depth
    shallow: HashSet<String>,
    /// Broadcasts are accepted but never land
    swallow_broadcasts: bool,
    balances: HashMap<Bytes32, U256>,
    next_tx: u64,
}

pub struct MockChain {
    chain: ChainId,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn burn(&self, position: Position, tx_id: &str, seq: u32, amount: u64) -> ChainEvent {
        ChainEvent {
            chain: self.chain,
            position,
            tx_id: tx_id.to_string(),
            event_seq: seq,
            kind: EventKind::Burn,
            token: Bytes32([7u8; 32]),
            owner: Bytes32([1u8; 32]),
            amount: U256::from(amount),
            timestamp: Some(1_700_000_000),
        }
    }

    pub async fn add_event(&self, event: ChainEvent) {
        self.state.lock().await.events.push(event);
    }

    pub async fn add_burn_at(&self, position: Position, tx_id: &str, seq: u32, amount: u64) {
        let event = self.burn(position, tx_id, seq, amount);
        self.add_event(event).await;
    }

    pub async fn set_finalized(&self, position: Position) {
        self.state.lock().await.finalized = position;
    }

    pub async fn fail_next_fetches(&self, count: u32) {
        self.state.lock().await.fetch_failures = count;
    }

    pub async fn fetch_ranges(&self) -> Vec<(Position, Position)> {
        self.state.lock().await.fetch_ranges.clone()
    }

    pub async fn push_broadcast_error(&self, error: RelayerError) {
        self.state.lock().await.broadcast_errors.push_back(error);
    }

    pub async fn push_status(&self, status: ConfirmationStatus) {
        self.state.lock().await.scripted_statuses.push_back(status);
    }

    pub async fn mark_reorged(&self, tx_id: &str) {
        self.state.lock().await.reorged.insert(tx_id.to_string());
    }

    pub async fn mark_shallow(&self, tx_id: &str) {
        self.state.lock().await.shallow.insert(tx_id.to_string());
    }

    pub async fn clear_shallow(&self) {
        self.state.lock().await.shallow.clear();
    }

    pub async fn swallow_broadcasts(&self, swallow: bool) {
        self.state.lock().await.swallow_broadcasts = swallow;
    }

    /// Number of transactions signed for this chain
    pub async fn prepared_count(&self) -> usize {
        self.state.lock().await.prepared.len()
    }

    pub async fn prepared_guards(&self) -> Vec<SubmissionGuard> {
        self.state.lock().await.guards.clone()
    }

    pub async fn broadcast_attempts(&self) -> usize {
        self.state.lock().await.broadcast_attempts
    }

    /// Number of distinct mints that actually landed
    pub async fn landed_mints(&self) -> Vec<DestinationCall> {
        self.state.lock().await.landed.values().cloned().collect()
    }

    pub async fn balance_of(&self, account: Bytes32) -> U256 {
        self.state
            .lock()
            .await
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn chain(&self) -> ChainId {
        self.chain
    }

    fn finality_depth(&self) -> FinalityDepth {
        FinalityDepth::Confirmations(0)
    }

    async fn current_finalized_position(&self) -> RelayerResult<Position> {
        Ok(self.state.lock().await.finalized)
    }

    async fn fetch_events(&self, from: Position, to: Position) -> RelayerResult<Vec<ChainEvent>> {
        let mut state = self.state.lock().await;
        state.fetch_ranges.push((from, to));
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(RelayerError::TransientNetwork {
                chain: self.chain,
                message: "connection reset".to_string(),
            });
        }
        Ok(state
            .events
            .iter()
            .filter(|e| e.position >= from && e.position <= to)
            .cloned()
            .collect())
    }

    async fn prepare(
        &self,
        call: &DestinationCall,
        _key: &IdempotencyKey,
        replacing: Option<&TxHandle>,
    ) -> RelayerResult<PreparedSubmission> {
        let mut state = self.state.lock().await;
        state.next_tx += 1;
        state.prepared.push(call.clone());
        let guard = match replacing.and_then(|h| h.guard.clone()) {
            Some(SubmissionGuard::Nonce(nonce)) => SubmissionGuard::Nonce(nonce),
            _ => SubmissionGuard::Nonce(state.next_tx),
        };
        state.guards.push(guard.clone());
        let id = format!("{}-tx-{}", self.chain, state.next_tx);
        Ok(PreparedSubmission {
            handle: TxHandle {
                chain: self.chain,
                id,
                guard: Some(guard),
            },
            raw: serde_json::to_vec(call)?,
        })
    }

    async fn broadcast(&self, prepared: &PreparedSubmission) -> RelayerResult<()> {
        let mut state = self.state.lock().await;
        state.broadcast_attempts += 1;
        if let Some(error) = state.broadcast_errors.pop_front() {
            return Err(error);
        }
        if state.landed.contains_key(&prepared.handle.id) {
            return Ok(());
        }
        if let Some(SubmissionGuard::Nonce(nonce)) = &prepared.handle.guard {
            if state.used_nonces.contains(nonce) {
                return Err(RelayerError::rejected(self.chain, "nonce too low"));
            }
        }
        if !state.broadcasts.contains(&prepared.handle.id) {
            state.broadcasts.push(prepared.handle.id.clone());
        }
        if state.swallow_broadcasts {
            return Ok(());
        }
        if let Some(SubmissionGuard::Nonce(nonce)) = &prepared.handle.guard {
            state.used_nonces.insert(*nonce);
        }

        let call: DestinationCall = serde_json::from_slice(&prepared.raw)?;
        if let Some(beneficiary) = call.beneficiary {
            let balance = state.balances.entry(beneficiary).or_default();
            *balance += call.amount;
        }
        state.landed.insert(prepared.handle.id.clone(), call);
        Ok(())
    }

    async fn confirmation_status(&self, handle: &TxHandle) -> RelayerResult<ConfirmationStatus> {
        let mut state = self.state.lock().await;

        if handle.guard.is_none() {
            // A source transaction observed on this chain
            if state.reorged.contains(&handle.id) {
                return Ok(ConfirmationStatus::Reorged);
            }
            if state.shallow.contains(&handle.id) {
                return Ok(ConfirmationStatus::Pending);
            }
            return Ok(ConfirmationStatus::Confirmed);
        }

        if let Some(status) = state.scripted_statuses.pop_front() {
            return Ok(status);
        }
        if state.landed.contains_key(&handle.id) {
            Ok(ConfirmationStatus::Confirmed)
        } else if state.broadcasts.contains(&handle.id) {
            Ok(ConfirmationStatus::Pending)
        } else {
            Ok(ConfirmationStatus::Reorged)
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}
