//! Drives a single action against its destination chain
//!
//! Every step is persisted before the next side effect: the attempt counter
//! before signing, the signed transaction before broadcasting, and the state
//! change after the chain reports back. A restarted relayer therefore always
//! finds the transaction it may already have sent, checks it on-chain, and
//! re-broadcasts the identical bytes instead of signing a second mint.
//!
//! Once the retry budget is spent no new transaction is signed, but the
//! action only fails after every transaction signed for it is known not to
//! land.

use super::action::{ActionState, PendingAction};
use crate::chain::{ChainAdapter, ConfirmationStatus, PreparedSubmission};
use crate::config::RetryPolicy;
use crate::error::{RelayerError, RelayerResult};
use crate::state::ActionLog;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// An earlier, dropped submission that the chain reports again
enum Resurfaced {
    Landed(usize),
    Pending(usize),
}

pub struct Submitter {
    store: Arc<dyn ActionLog>,
    destination: Arc<dyn ChainAdapter>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn ActionLog>,
        destination: Arc<dyn ChainAdapter>,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            destination,
            policy,
            shutdown,
        }
    }

    /// Drive `action` until it is terminal or shutdown is requested.
    ///
    /// Returns the action in the state it was last persisted in. Only storage
    /// failures surface as errors; chain failures are absorbed into the
    /// action's retry budget.
    pub async fn execute(&self, mut action: PendingAction) -> RelayerResult<PendingAction> {
        loop {
            if self.is_shutting_down() {
                debug!(key = %action.key, state = %action.state, "Leaving action for next start");
                return Ok(action);
            }

            match action.state {
                ActionState::Completed | ActionState::Failed => return Ok(action),
                ActionState::Discovered => self.begin(&mut action).await?,
                ActionState::Submitting => self.submit(&mut action).await?,
                ActionState::AwaitingConfirmation => self.await_confirmation(&mut action).await?,
            }
        }
    }

    /// Mark an action failed without touching the chain
    pub async fn fail(&self, action: &mut PendingAction, error: &RelayerError) -> RelayerResult<()> {
        let entry = action.transition(ActionState::Failed, Some(error.to_string()))?;
        self.store.commit(action, &entry).await?;

        crate::metrics::record_action_transition(action.source_event.chain, ActionState::Failed);
        error!(
            key = %action.key,
            source = %action.source_event.event_id(),
            attempts = action.attempt_count,
            alert = error.should_alert(),
            "Action failed and needs operator attention: {}",
            error
        );
        Ok(())
    }

    async fn begin(&self, action: &mut PendingAction) -> RelayerResult<()> {
        if action.destination_call.beneficiary.is_none() {
            let err = RelayerError::Mapping(format!(
                "no {} account linked to {}",
                action.destination_chain,
                action.source_event.owner.display_for(action.source_event.chain)
            ));
            return self.fail(action, &err).await;
        }

        let entry = action.transition(ActionState::Submitting, None)?;
        self.store.commit(action, &entry).await?;
        crate::metrics::record_action_transition(action.source_event.chain, ActionState::Submitting);
        Ok(())
    }

    async fn submit(&self, action: &mut PendingAction) -> RelayerResult<()> {
        let chain = self.destination.chain();
        let mut replacing = None;

        // A transaction from an earlier attempt may still land; it must be
        // resolved before anything new is signed.
        if let Some(previous) = action.submission.clone() {
            match self.destination.confirmation_status(&previous.handle).await {
                Ok(ConfirmationStatus::Confirmed) => return self.complete(action).await,
                Ok(ConfirmationStatus::Pending) => {
                    info!(key = %action.key, tx = %previous.handle, "Prior submission still pending, re-broadcasting");
                    self.rebroadcast(action, &previous).await;
                    return self.awaiting(action).await;
                }
                Ok(ConfirmationStatus::Reorged) => {
                    warn!(key = %action.key, tx = %previous.handle, "Prior submission dropped, preparing a replacement");
                    replacing = action.supersede_submission();
                    self.store.upsert(action).await?;
                }
                Ok(ConfirmationStatus::Failed(reason)) => {
                    action.submission = None;
                    return self.retry(action, RelayerError::rejected(chain, &reason)).await;
                }
                Err(e) => return self.retry(action, e).await,
            }
        }

        match self.resurfaced(action).await {
            Ok(Some(Resurfaced::Landed(index))) => {
                action.restore_superseded(index);
                return self.complete(action).await;
            }
            Ok(Some(Resurfaced::Pending(index))) => {
                action.restore_superseded(index);
                if let Some(earlier) = action.submission.clone() {
                    info!(key = %action.key, tx = %earlier.handle, "Dropped submission is back in flight");
                    self.rebroadcast(action, &earlier).await;
                }
                return self.awaiting(action).await;
            }
            Ok(None) => {}
            Err(e) => return self.retry(action, e).await,
        }

        let prepared = match self
            .destination
            .prepare(&action.destination_call, &action.key, replacing.as_ref())
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => return self.retry(action, e).await,
        };
        action.submission = Some(prepared.clone());
        self.store.upsert(action).await?;

        crate::metrics::record_submission_attempt(chain);
        match self.destination.broadcast(&prepared).await {
            Ok(()) => {
                info!(
                    key = %action.key,
                    tx = %prepared.handle,
                    attempt = action.attempt_count,
                    amount = %action.destination_call.amount,
                    "Mint submitted"
                );
                self.awaiting(action).await
            }
            Err(e) => self.retry(action, e).await,
        }
    }

    /// First earlier submission that landed or is back in flight after a reorg
    async fn resurfaced(&self, action: &PendingAction) -> RelayerResult<Option<Resurfaced>> {
        let mut pending = None;
        for (index, earlier) in action.superseded.iter().enumerate() {
            match self.destination.confirmation_status(&earlier.handle).await? {
                ConfirmationStatus::Confirmed => return Ok(Some(Resurfaced::Landed(index))),
                ConfirmationStatus::Pending => {
                    pending.get_or_insert(index);
                }
                ConfirmationStatus::Reorged | ConfirmationStatus::Failed(_) => {}
            }
        }
        Ok(pending.map(Resurfaced::Pending))
    }

    async fn rebroadcast(&self, action: &PendingAction, submission: &PreparedSubmission) {
        if let Err(e) = self.destination.broadcast(submission).await {
            debug!(key = %action.key, tx = %submission.handle, "Re-broadcast not accepted: {}", e);
        }
    }

    async fn awaiting(&self, action: &mut PendingAction) -> RelayerResult<()> {
        let entry = action.transition(ActionState::AwaitingConfirmation, None)?;
        self.store.commit(action, &entry).await?;
        crate::metrics::record_action_transition(
            action.source_event.chain,
            ActionState::AwaitingConfirmation,
        );
        Ok(())
    }

    async fn await_confirmation(&self, action: &mut PendingAction) -> RelayerResult<()> {
        let chain = self.destination.chain();
        let Some(submission) = action.submission.clone() else {
            let err = RelayerError::Internal("awaiting confirmation without a submission".into());
            return self.retry(action, err).await;
        };

        let started = Instant::now();
        loop {
            if started.elapsed() >= self.policy.confirmation_timeout {
                let err = RelayerError::Timeout {
                    operation: format!("confirmation of {}", submission.handle),
                };
                return self.retry(action, err).await;
            }

            match self.destination.confirmation_status(&submission.handle).await {
                Ok(ConfirmationStatus::Confirmed) => return self.complete(action).await,
                Ok(ConfirmationStatus::Pending) => {}
                Ok(ConfirmationStatus::Reorged) => {
                    let err = RelayerError::Dropped {
                        chain,
                        tx: submission.handle.id.clone(),
                    };
                    return self.retry(action, err).await;
                }
                Ok(ConfirmationStatus::Failed(reason)) => {
                    action.submission = None;
                    return self.retry(action, RelayerError::rejected(chain, &reason)).await;
                }
                Err(e) => {
                    warn!(key = %action.key, "Confirmation poll failed: {}", e);
                }
            }

            if !self.pause(self.policy.confirmation_poll_interval).await {
                return Ok(());
            }
        }
    }

    async fn complete(&self, action: &mut PendingAction) -> RelayerResult<()> {
        let entry = action.transition(ActionState::Completed, None)?;
        self.store.commit(action, &entry).await?;

        let latency = (Utc::now() - action.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        crate::metrics::record_action_transition(action.source_event.chain, ActionState::Completed);
        crate::metrics::record_confirmation_latency(self.destination.chain(), latency);
        info!(
            key = %action.key,
            source = %action.source_event.event_id(),
            tx = action.tx_id().unwrap_or_default(),
            amount = %action.destination_call.amount,
            "Mint confirmed"
        );
        Ok(())
    }

    /// Spend one unit of the retry budget on `error`, or fail the action
    async fn retry(&self, action: &mut PendingAction, error: RelayerError) -> RelayerResult<()> {
        if error.is_fatal_for_action() || !error.is_retryable() {
            return self.fail(action, &error).await;
        }
        if action.attempt_count >= self.policy.max_attempts {
            let exhausted = RelayerError::ExhaustedRetries {
                attempts: action.attempt_count,
                last_error: error.to_string(),
            };
            return self.settle_exhausted(action, exhausted).await;
        }

        let delay = self.policy.backoff(action.attempt_count);
        warn!(
            key = %action.key,
            attempt = action.attempt_count,
            "Submission attempt failed (retrying in {:?}): {}",
            delay,
            error
        );
        if !self.pause(delay).await {
            return Ok(());
        }

        let entry = action.transition(ActionState::Submitting, Some(error.to_string()))?;
        self.store.commit(action, &entry).await?;
        crate::metrics::record_action_transition(action.source_event.chain, ActionState::Submitting);
        Ok(())
    }

    /// Out of attempts: wait for every signed transaction to settle, then
    /// complete if one landed or fail if none can.
    async fn settle_exhausted(
        &self,
        action: &mut PendingAction,
        exhausted: RelayerError,
    ) -> RelayerResult<()> {
        let mut announced = false;
        loop {
            let mut in_flight = false;

            if let Some(current) = action.submission.clone() {
                match self.destination.confirmation_status(&current.handle).await {
                    Ok(ConfirmationStatus::Confirmed) => return self.complete(action).await,
                    Ok(ConfirmationStatus::Pending) | Err(_) => {
                        in_flight = true;
                        self.rebroadcast(action, &current).await;
                    }
                    Ok(ConfirmationStatus::Reorged) | Ok(ConfirmationStatus::Failed(_)) => {}
                }
            }

            match self.resurfaced(action).await {
                Ok(Some(Resurfaced::Landed(index))) => {
                    action.restore_superseded(index);
                    return self.complete(action).await;
                }
                Ok(Some(Resurfaced::Pending(_))) | Err(_) => in_flight = true,
                Ok(None) => {}
            }

            if !in_flight {
                return self.fail(action, &exhausted).await;
            }

            if !announced {
                announced = true;
                warn!(
                    key = %action.key,
                    attempts = action.attempt_count,
                    tx = action.tx_id().unwrap_or_default(),
                    "Retries exhausted while a signed mint may still land, waiting for it to settle"
                );
                if action.state == ActionState::Submitting {
                    self.awaiting(action).await?;
                }
            }

            if !self.pause(self.policy.confirmation_poll_interval).await {
                return Ok(());
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep unless shutdown is requested first; returns false on shutdown
    async fn pause(&self, duration: Duration) -> bool {
        pause(&self.shutdown, duration).await
    }
}

pub(crate) async fn pause(shutdown: &watch::Receiver<bool>, duration: Duration) -> bool {
    let mut shutdown = shutdown.clone();
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            Err(_) => {
                tokio::time::sleep(duration).await;
                true
            }
        },
    }
}
