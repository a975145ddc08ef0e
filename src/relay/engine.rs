//! Per-direction relay worker
//!
//! One engine consumes one source chain's ordered queue and mints on the
//! counterpart chain. Events are handled strictly one at a time, so the
//! cursor can be advanced at a checkpoint as soon as every action created
//! before it has reached a terminal state.

use super::action::{ActionState, PendingAction};
use super::mapping::{AddressBook, TokenMappings};
use super::submitter::{pause, Submitter};
use crate::chain::{ChainAdapter, ChainItem, ConfirmationStatus, DestinationCall, TxHandle};
use crate::config::RetryPolicy;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, ChainId, EventKind, Position};
use crate::state::{ActionLog, CursorStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why an event did not produce an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Mints are the relayer's own output
    MintEvent,
    UnregisteredToken,
    ZeroAmount,
    /// Source transaction is no longer on the canonical chain
    Reorged,
    /// Delivered to the wrong worker
    ForeignChain,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MintEvent => "mint_event",
            SkipReason::UnregisteredToken => "unregistered_token",
            SkipReason::ZeroAmount => "zero_amount",
            SkipReason::Reorged => "reorged",
            SkipReason::ForeignChain => "foreign_chain",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Skipped(SkipReason),
    /// An action exists; holds its state after this pass
    Action(ActionState),
    /// Shutdown arrived before the event was classified
    Interrupted,
}

impl Classification {
    /// Whether the event no longer holds back the cursor
    pub fn is_settled(&self) -> bool {
        match self {
            Classification::Skipped(_) => true,
            Classification::Action(state) => state.is_terminal(),
            Classification::Interrupted => false,
        }
    }
}

/// Burn-to-mint state machine for one direction
pub struct RelayEngine {
    source: Arc<dyn ChainAdapter>,
    submitter: Submitter,
    store: Arc<dyn ActionLog>,
    cursors: Arc<dyn CursorStore>,
    mappings: Arc<TokenMappings>,
    accounts: Arc<AddressBook>,
    policy: RetryPolicy,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    /// Highest position known to be final on the source chain
    finalized: Position,
    /// Events since the last checkpoint whose action is not terminal
    unsettled: usize,
}

impl RelayEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ChainAdapter>,
        destination: Arc<dyn ChainAdapter>,
        store: Arc<dyn ActionLog>,
        cursors: Arc<dyn CursorStore>,
        mappings: Arc<TokenMappings>,
        accounts: Arc<AddressBook>,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let submitter = Submitter::new(store.clone(), destination, policy.clone(), shutdown.clone());
        Self {
            source,
            submitter,
            store,
            cursors,
            mappings,
            accounts,
            poll_interval: policy.confirmation_poll_interval,
            policy,
            shutdown,
            finalized: 0,
            unsettled: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn source_chain(&self) -> ChainId {
        self.source.chain()
    }

    /// Drive every non-terminal action from this source chain to completion
    pub async fn resume_pending(&mut self) -> RelayerResult<usize> {
        let chain = self.source_chain();
        let mut resumed = 0;

        for state in [
            ActionState::Discovered,
            ActionState::Submitting,
            ActionState::AwaitingConfirmation,
        ] {
            let actions = self.store.list_by_state(state).await?;
            for action in actions.into_iter().filter(|a| a.source_event.chain == chain) {
                if *self.shutdown.borrow() {
                    return Ok(resumed);
                }
                info!(
                    key = %action.key,
                    state = %action.state,
                    attempts = action.attempt_count,
                    "Resuming action"
                );
                let action = self.submitter.execute(action).await?;
                if !action.state.is_terminal() {
                    self.unsettled += 1;
                }
                resumed += 1;
            }
        }

        if resumed > 0 {
            info!(chain = %chain, resumed, "Resumed pending actions");
        }
        Ok(resumed)
    }

    /// Resume unfinished actions, then consume the ordered queue until it
    /// closes or shutdown is requested
    pub async fn run(mut self, mut queue: mpsc::Receiver<ChainItem>) {
        let chain = self.source_chain();
        info!(chain = %chain, destination = %chain.counterpart(), "Relay worker started");

        let mut failures = 0u32;
        while let Err(e) = self.resume_pending().await {
            failures += 1;
            let delay = self.policy.backoff(failures);
            error!(chain = %chain, "Resuming actions failed (retrying in {:?}): {}", delay, e);
            if !pause(&self.shutdown, delay).await {
                info!(chain = %chain, "Relay worker stopped");
                return;
            }
        }

        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            let item = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                item = queue.recv() => item,
            };
            let Some(item) = item else { break };

            let mut failures = 0u32;
            loop {
                let result = match &item {
                    ChainItem::Event(event) => self.process(event).await,
                    ChainItem::Checkpoint(position) => self.on_checkpoint(*position).await,
                };
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        failures += 1;
                        let delay = self.policy.backoff(failures);
                        error!(chain = %chain, "Relay step failed (retrying in {:?}): {}", delay, e);
                        if !pause(&self.shutdown, delay).await {
                            break;
                        }
                    }
                }
            }
        }

        info!(chain = %chain, "Relay worker stopped");
    }

    async fn process(&mut self, event: &ChainEvent) -> RelayerResult<()> {
        let classification = self.handle_event(event).await?;
        if !classification.is_settled() {
            self.unsettled += 1;
        }
        debug!(event = %event.event_id(), ?classification, "Event classified");
        Ok(())
    }

    /// Classify one delivered event and drive any resulting action
    pub async fn handle_event(&mut self, event: &ChainEvent) -> RelayerResult<Classification> {
        let chain = self.source_chain();
        if event.chain != chain {
            warn!(event = %event.event_id(), "Event from another chain delivered to {} worker", chain);
            return Ok(self.skip(event, SkipReason::ForeignChain));
        }

        if event.kind == EventKind::Mint {
            info!(
                chain = %chain,
                token = %event.token.display_for(chain),
                owner = %event.owner.display_for(chain),
                amount = %event.amount,
                "Mint observed"
            );
            return Ok(self.skip(event, SkipReason::MintEvent));
        }

        if !self.await_finality(event).await? {
            return Ok(Classification::Interrupted);
        }

        match self.source_status(event).await? {
            Some(ConfirmationStatus::Confirmed) => {}
            Some(_) => {
                self.invalidate(event).await?;
                return Ok(self.skip(event, SkipReason::Reorged));
            }
            None => return Ok(Classification::Interrupted),
        }

        let Some(mapping) = self.mappings.lookup(chain, &event.token).cloned() else {
            warn!(
                chain = %chain,
                token = %event.token.display_for(chain),
                event = %event.event_id(),
                "Burn of unregistered token, not relaying"
            );
            return Ok(self.skip(event, SkipReason::UnregisteredToken));
        };

        if event.amount.is_zero() {
            return Ok(self.skip(event, SkipReason::ZeroAmount));
        }

        let (amount, conversion_error) = match mapping.scale.convert(event.amount) {
            Ok(conversion) => {
                if conversion.amount.is_zero() {
                    info!(event = %event.event_id(), amount = %event.amount, scale = %mapping.scale, "Burn converts to zero destination units");
                    return Ok(self.skip(event, SkipReason::ZeroAmount));
                }
                if !conversion.forfeited.is_zero() {
                    info!(
                        event = %event.event_id(),
                        forfeited = %conversion.forfeited,
                        scale = %mapping.scale,
                        "Truncating sub-unit remainder"
                    );
                }
                (conversion.amount, None)
            }
            Err(e) => (event.amount, Some(e)),
        };

        let call = DestinationCall {
            chain: mapping.destination_chain(),
            foreign_token: event.token,
            destination_token: mapping.destination_token,
            beneficiary: self.accounts.counterpart(chain, &event.owner),
            amount,
        };

        let (mut action, created) = self
            .store
            .record_observed(PendingAction::discovered(event.clone(), call))
            .await?;

        if created {
            crate::metrics::record_action_transition(chain, ActionState::Discovered);
            info!(
                key = %action.key,
                event = %event.event_id(),
                amount = %action.destination_call.amount,
                "New bridge action"
            );
        } else {
            debug!(key = %action.key, state = %action.state, "Event already recorded");
        }

        if let Some(err) = conversion_error {
            if action.state == ActionState::Discovered {
                self.submitter.fail(&mut action, &err).await?;
            }
        }

        if action.state.is_terminal() {
            return Ok(Classification::Action(action.state));
        }

        let action = self.submitter.execute(action).await?;
        Ok(Classification::Action(action.state))
    }

    /// Advance the cursor once everything before `position` is settled
    pub async fn on_checkpoint(&mut self, position: Position) -> RelayerResult<()> {
        let chain = self.source_chain();
        if self.unsettled > 0 {
            debug!(chain = %chain, position, unsettled = self.unsettled, "Cursor held back");
            return Ok(());
        }

        self.cursors.advance(chain, position).await?;
        crate::metrics::record_cursor(chain, position);
        Ok(())
    }

    /// Wait until `event` is at finality depth; false on shutdown
    async fn await_finality(&mut self, event: &ChainEvent) -> RelayerResult<bool> {
        while event.position > self.finalized {
            self.finalized = self.source.current_finalized_position().await?;
            if event.position <= self.finalized {
                break;
            }
            debug!(
                event = %event.event_id(),
                finalized = self.finalized,
                depth = %self.source.finality_depth(),
                "Waiting for finality"
            );
            if !pause(&self.shutdown, self.poll_interval).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Check the burn is still canonical; `None` on shutdown
    async fn source_status(&self, event: &ChainEvent) -> RelayerResult<Option<ConfirmationStatus>> {
        let handle = TxHandle::observed(event.chain, event.tx_id.clone());
        loop {
            let status = self.source.confirmation_status(&handle).await?;
            if status != ConfirmationStatus::Pending {
                return Ok(Some(status));
            }
            debug!(event = %event.event_id(), "Source transaction not yet final");
            if !pause(&self.shutdown, self.poll_interval).await {
                return Ok(None);
            }
        }
    }

    /// Fail any unfinished action created for an event that was reorged out
    async fn invalidate(&self, event: &ChainEvent) -> RelayerResult<()> {
        warn!(event = %event.event_id(), position = event.position, "Source transaction no longer canonical");

        let key = event.idempotency_key();
        if let Some(mut action) = self.store.get(&key).await? {
            if !action.state.is_terminal() {
                let err = RelayerError::ReorgDetected {
                    chain: event.chain,
                    position: event.position,
                };
                self.submitter.fail(&mut action, &err).await?;
            }
        }
        Ok(())
    }

    fn skip(&self, event: &ChainEvent, reason: SkipReason) -> Classification {
        crate::metrics::record_skipped(event.chain, reason.as_str());
        debug!(event = %event.event_id(), %reason, "Event not actionable");
        Classification::Skipped(reason)
    }
}
