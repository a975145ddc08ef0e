//! Durable relayer state
//!
//! Handles:
//! - The action log, the single dedup gate for cross-chain actions
//! - Per-chain event cursors for restart recovery
//! - The append-only transition history of every action

mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::{LeadershipLock, PgStore};

use crate::error::RelayerResult;
use crate::events::{ChainId, IdempotencyKey, Position};
use crate::relay::{ActionState, ActionTransition, PendingAction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Session holding the exclusive right to submit for this deployment
#[async_trait]
pub trait Leadership: Send {
    /// Fails once the session, and with it the right to submit, is gone
    async fn ping(&mut self) -> RelayerResult<()>;
}

#[async_trait]
pub trait ActionLog: Send + Sync {
    /// Insert `candidate` unless its key is already known.
    ///
    /// Returns the stored record and whether it was created by this call. An
    /// existing (or archived) record is returned unchanged.
    async fn record_observed(&self, candidate: PendingAction)
        -> RelayerResult<(PendingAction, bool)>;

    /// Persist the record together with the history entry that produced it
    async fn commit(&self, action: &PendingAction, transition: &ActionTransition)
        -> RelayerResult<()>;

    /// Overwrite the record without a state change, e.g. to store a prepared submission
    async fn upsert(&self, action: &PendingAction) -> RelayerResult<()>;

    async fn get(&self, key: &IdempotencyKey) -> RelayerResult<Option<PendingAction>>;

    async fn list_by_state(&self, state: ActionState) -> RelayerResult<Vec<PendingAction>>;

    async fn history(&self, key: &IdempotencyKey) -> RelayerResult<Vec<ActionTransition>>;

    /// Move completed actions last updated before `cutoff` into the archive
    async fn archive_completed(&self, cutoff: DateTime<Utc>) -> RelayerResult<u64>;

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }

    /// Live actions per state
    async fn stats(&self) -> RelayerResult<ActionStats> {
        Ok(ActionStats {
            discovered: self.list_by_state(ActionState::Discovered).await?.len() as u64,
            submitting: self.list_by_state(ActionState::Submitting).await?.len() as u64,
            awaiting_confirmation: self
                .list_by_state(ActionState::AwaitingConfirmation)
                .await?
                .len() as u64,
            completed: self.list_by_state(ActionState::Completed).await?.len() as u64,
            failed: self.list_by_state(ActionState::Failed).await?.len() as u64,
        })
    }
}

/// Counts of live (not archived) actions by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub discovered: u64,
    pub submitting: u64,
    pub awaiting_confirmation: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last position whose events are all classified, if any was stored
    async fn load(&self, chain: ChainId) -> RelayerResult<Option<Position>>;

    /// Record progress; never moves a cursor backwards
    async fn advance(&self, chain: ChainId, position: Position) -> RelayerResult<()>;

    async fn list(&self) -> RelayerResult<Vec<(ChainId, Position)>>;

    /// First position to subscribe from, `start` when nothing is stored
    async fn resume_position(&self, chain: ChainId, start: Position) -> RelayerResult<Position> {
        Ok(self
            .load(chain)
            .await?
            .map(|last| last.saturating_add(1))
            .unwrap_or(start))
    }
}
