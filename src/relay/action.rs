//! Cross-chain action records and their state machine

use crate::chain::{DestinationCall, PreparedSubmission, TxHandle};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, ChainId, IdempotencyKey};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Discovered,
    Submitting,
    AwaitingConfirmation,
    Completed,
    /// Terminal, needs an operator
    Failed,
}

impl ActionState {
    pub const ALL: [ActionState; 5] = [
        ActionState::Discovered,
        ActionState::Submitting,
        ActionState::AwaitingConfirmation,
        ActionState::Completed,
        ActionState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Discovered => "discovered",
            ActionState::Submitting => "submitting",
            ActionState::AwaitingConfirmation => "awaiting_confirmation",
            ActionState::Completed => "completed",
            ActionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed)
    }

    /// Allowed edges of the action lifecycle.
    ///
    /// `Submitting -> Submitting` is a retry after a failed broadcast, and
    /// `Submitting -> Completed` happens when a restarted relayer finds that
    /// its prepared transaction already landed.
    pub fn can_transition_to(&self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Discovered, Submitting)
                | (Discovered, Failed)
                | (Submitting, Submitting)
                | (Submitting, AwaitingConfirmation)
                | (Submitting, Completed)
                | (Submitting, Failed)
                | (AwaitingConfirmation, Submitting)
                | (AwaitingConfirmation, Completed)
                | (AwaitingConfirmation, Failed)
        )
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionState {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("Unknown action state: {}", s)))
    }
}

/// A mint owed on the destination chain for one source burn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub key: IdempotencyKey,
    pub source_event: ChainEvent,
    pub destination_chain: ChainId,
    pub destination_call: DestinationCall,
    pub state: ActionState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Latest signed destination transaction, persisted before broadcast
    pub submission: Option<PreparedSubmission>,
    /// Earlier submissions the chain reported as dropped, oldest first.
    /// A dropped transaction can come back after a reorg, so these are
    /// checked again before the action is given up on.
    #[serde(default)]
    pub superseded: Vec<PreparedSubmission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of an action's append-only history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTransition {
    pub key: IdempotencyKey,
    /// `None` for the creating entry
    pub from: Option<ActionState>,
    pub to: ActionState,
    pub attempt: u32,
    pub tx_handle: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn discovered(event: ChainEvent, call: DestinationCall) -> Self {
        let now = Utc::now();
        Self {
            key: event.idempotency_key(),
            destination_chain: call.chain,
            source_event: event,
            destination_call: call,
            state: ActionState::Discovered,
            attempt_count: 0,
            last_error: None,
            submission: None,
            superseded: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// History entry describing the creation of this record
    pub fn creation(&self) -> ActionTransition {
        ActionTransition {
            key: self.key.clone(),
            from: None,
            to: self.state,
            attempt: self.attempt_count,
            tx_handle: None,
            error: self.last_error.clone(),
            recorded_at: self.created_at,
        }
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.submission.as_ref().map(|s| s.handle.id.as_str())
    }

    /// Retire the current submission after the chain reported it dropped
    pub fn supersede_submission(&mut self) -> Option<TxHandle> {
        let previous = self.submission.take()?;
        let handle = previous.handle.clone();
        self.superseded.push(previous);
        Some(handle)
    }

    /// Make `superseded[index]` the current submission again
    pub fn restore_superseded(&mut self, index: usize) {
        if index >= self.superseded.len() {
            return;
        }
        let earlier = self.superseded.remove(index);
        if let Some(current) = self.submission.replace(earlier) {
            self.superseded.push(current);
        }
    }

    /// Move to `next`, returning the history entry to persist with the record.
    ///
    /// Entering `Submitting` starts a new attempt.
    pub fn transition(
        &mut self,
        next: ActionState,
        error: Option<String>,
    ) -> RelayerResult<ActionTransition> {
        if !self.state.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        let from = self.state;
        if next == ActionState::Submitting {
            self.attempt_count += 1;
        }
        if error.is_some() {
            self.last_error = error.clone();
        }
        self.state = next;
        self.updated_at = Utc::now();

        Ok(ActionTransition {
            key: self.key.clone(),
            from: Some(from),
            to: next,
            attempt: self.attempt_count,
            tx_handle: self.tx_id().map(str::to_string),
            error,
            recorded_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Bytes32, EventKind};
    use ethers::types::U256;

    fn action() -> PendingAction {
        let event = ChainEvent {
            chain: ChainId::Evm,
            position: 3,
            tx_id: "0x01".into(),
            event_seq: 0,
            kind: EventKind::Burn,
            token: Bytes32([1u8; 32]),
            owner: Bytes32([2u8; 32]),
            amount: U256::from(10u64),
            timestamp: None,
        };
        let call = DestinationCall {
            chain: ChainId::Solana,
            foreign_token: event.token,
            destination_token: Bytes32([3u8; 32]),
            beneficiary: Some(Bytes32([4u8; 32])),
            amount: event.amount,
        };
        PendingAction::discovered(event, call)
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [ActionState::Completed, ActionState::Failed] {
            assert!(terminal.is_terminal());
            for next in ActionState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn cannot_skip_submission() {
        let mut action = action();
        let err = action.transition(ActionState::Completed, None).unwrap_err();
        assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));
        assert_eq!(action.state, ActionState::Discovered);
    }

    #[test]
    fn submitting_counts_attempts() {
        let mut action = action();
        action.transition(ActionState::Submitting, None).unwrap();
        action.transition(ActionState::AwaitingConfirmation, None).unwrap();
        let entry = action
            .transition(ActionState::Submitting, Some("timeout".into()))
            .unwrap();

        assert_eq!(action.attempt_count, 2);
        assert_eq!(entry.from, Some(ActionState::AwaitingConfirmation));
        assert_eq!(entry.attempt, 2);
        assert_eq!(action.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn superseded_submission_is_kept_for_later_checks() {
        let mut action = action();
        assert_eq!(action.supersede_submission(), None);

        let handle = TxHandle {
            chain: ChainId::Solana,
            id: "sig-1".into(),
            guard: Some(crate::chain::SubmissionGuard::Blockhash("hash".into())),
        };
        action.submission = Some(PreparedSubmission {
            handle: handle.clone(),
            raw: vec![1, 2, 3],
        });

        assert_eq!(action.supersede_submission(), Some(handle.clone()));
        assert_eq!(action.submission, None);
        assert_eq!(action.superseded.len(), 1);
        assert_eq!(action.superseded[0].handle, handle);

        let replacement = PreparedSubmission {
            handle: TxHandle {
                id: "sig-2".into(),
                ..handle.clone()
            },
            raw: vec![4],
        };
        action.submission = Some(replacement.clone());
        action.restore_superseded(0);
        assert_eq!(action.tx_id(), Some("sig-1"));
        assert_eq!(action.superseded, vec![replacement]);
    }

    #[test]
    fn records_without_superseded_list_still_load() {
        let action = action();
        let mut value = serde_json::to_value(&action).unwrap();
        value.as_object_mut().unwrap().remove("superseded");

        let loaded: PendingAction = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, action);
    }

    #[test]
    fn state_names_round_trip() {
        for state in ActionState::ALL {
            assert_eq!(state.as_str().parse::<ActionState>().unwrap(), state);
        }
        assert!("bogus".parse::<ActionState>().is_err());
    }
}
