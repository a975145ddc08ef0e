//! In-memory store for tests

use super::{ActionLog, CursorStore};
use crate::error::RelayerResult;
use crate::events::{ChainId, IdempotencyKey, Position};
use crate::relay::{ActionState, ActionTransition, PendingAction};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    actions: HashMap<IdempotencyKey, PendingAction>,
    history: HashMap<IdempotencyKey, Vec<ActionTransition>>,
    archived: HashMap<IdempotencyKey, PendingAction>,
    cursors: BTreeMap<ChainId, Position>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn action_count(&self) -> usize {
        self.tables.lock().await.actions.len()
    }
}

#[async_trait]
impl ActionLog for MemoryStore {
    async fn record_observed(
        &self,
        candidate: PendingAction,
    ) -> RelayerResult<(PendingAction, bool)> {
        let mut tables = self.tables.lock().await;
        if let Some(archived) = tables.archived.get(&candidate.key) {
            return Ok((archived.clone(), false));
        }
        if let Some(existing) = tables.actions.get(&candidate.key) {
            return Ok((existing.clone(), false));
        }

        tables
            .history
            .entry(candidate.key.clone())
            .or_default()
            .push(candidate.creation());
        tables.actions.insert(candidate.key.clone(), candidate.clone());
        Ok((candidate, true))
    }

    async fn commit(
        &self,
        action: &PendingAction,
        transition: &ActionTransition,
    ) -> RelayerResult<()> {
        let mut tables = self.tables.lock().await;
        tables.actions.insert(action.key.clone(), action.clone());
        tables
            .history
            .entry(action.key.clone())
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn upsert(&self, action: &PendingAction) -> RelayerResult<()> {
        let mut tables = self.tables.lock().await;
        tables.actions.insert(action.key.clone(), action.clone());
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> RelayerResult<Option<PendingAction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .actions
            .get(key)
            .or_else(|| tables.archived.get(key))
            .cloned())
    }

    async fn list_by_state(&self, state: ActionState) -> RelayerResult<Vec<PendingAction>> {
        let tables = self.tables.lock().await;
        let mut actions: Vec<PendingAction> = tables
            .actions
            .values()
            .filter(|a| a.state == state)
            .cloned()
            .collect();
        actions.sort_by_key(|a| (a.source_event.position, a.source_event.event_seq));
        Ok(actions)
    }

    async fn history(&self, key: &IdempotencyKey) -> RelayerResult<Vec<ActionTransition>> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn archive_completed(&self, cutoff: DateTime<Utc>) -> RelayerResult<u64> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<IdempotencyKey> = tables
            .actions
            .values()
            .filter(|a| a.state == ActionState::Completed && a.updated_at < cutoff)
            .map(|a| a.key.clone())
            .collect();

        for key in &expired {
            if let Some(action) = tables.actions.remove(key) {
                tables.archived.insert(key.clone(), action);
            }
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load(&self, chain: ChainId) -> RelayerResult<Option<Position>> {
        Ok(self.tables.lock().await.cursors.get(&chain).copied())
    }

    async fn advance(&self, chain: ChainId, position: Position) -> RelayerResult<()> {
        let mut tables = self.tables.lock().await;
        let cursor = tables.cursors.entry(chain).or_insert(position);
        *cursor = (*cursor).max(position);
        Ok(())
    }

    async fn list(&self) -> RelayerResult<Vec<(ChainId, Position)>> {
        Ok(self
            .tables
            .lock()
            .await
            .cursors
            .iter()
            .map(|(c, p)| (*c, *p))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::chain::DestinationCall;
    use crate::events::Bytes32;
    use tokio_test::assert_ok;

    fn candidate(chain: &MockChain, tx: &str) -> PendingAction {
        let event = chain.burn(4, tx, 0, 10);
        let call = DestinationCall {
            chain: ChainId::Solana,
            foreign_token: event.token,
            destination_token: Bytes32([9u8; 32]),
            beneficiary: Some(Bytes32([8u8; 32])),
            amount: event.amount,
        };
        PendingAction::discovered(event, call)
    }

    #[tokio::test]
    async fn record_observed_is_the_dedup_gate() {
        let chain = MockChain::new(ChainId::Evm);
        let store = MemoryStore::new();

        let (first, created) = assert_ok!(store.record_observed(candidate(&chain, "0xa")).await);
        assert!(created);

        let mut progressed = first.clone();
        let entry = progressed.transition(ActionState::Submitting, None).unwrap();
        assert_ok!(store.commit(&progressed, &entry).await);

        let (again, created) = assert_ok!(store.record_observed(candidate(&chain, "0xa")).await);
        assert!(!created);
        assert_eq!(again.state, ActionState::Submitting);
        assert_eq!(store.action_count().await, 1);
        assert_eq!(store.history(&first.key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn archived_keys_are_not_recreated() {
        let chain = MockChain::new(ChainId::Evm);
        let store = MemoryStore::new();
        let (mut action, _) = store.record_observed(candidate(&chain, "0xb")).await.unwrap();
        for next in [ActionState::Submitting, ActionState::AwaitingConfirmation, ActionState::Completed] {
            let entry = action.transition(next, None).unwrap();
            store.commit(&action, &entry).await.unwrap();
        }

        let archived = store
            .archive_completed(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(archived, 1);
        assert_eq!(store.action_count().await, 0);

        let (replayed, created) = store.record_observed(candidate(&chain, "0xb")).await.unwrap();
        assert!(!created);
        assert_eq!(replayed.state, ActionState::Completed);
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.resume_position(ChainId::Evm, 100).await.unwrap(), 100);

        store.advance(ChainId::Evm, 120).await.unwrap();
        store.advance(ChainId::Evm, 110).await.unwrap();
        assert_eq!(store.load(ChainId::Evm).await.unwrap(), Some(120));
        assert_eq!(store.resume_position(ChainId::Evm, 100).await.unwrap(), 121);
        assert_eq!(store.load(ChainId::Solana).await.unwrap(), None);
    }
}
