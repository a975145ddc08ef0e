//! Restartable event subscription and the per-chain listener task
//!
//! A subscription is a lazy, unbounded stream of [`ChainItem`]s. It polls the
//! adapter in bounded ranges that never pass the finalized position, and after
//! each range emits a [`ChainItem::Checkpoint`] stating that every event up to
//! and including that position has been delivered. Transport failures are
//! retried with backoff from the first undelivered position, so delivery is
//! at-least-once across both reconnects and process restarts.

use super::ChainAdapter;
use crate::events::{ChainEvent, ChainId, Position};

use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Item delivered to a relay worker, in position order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainItem {
    Event(ChainEvent),
    /// All events at or below this position have been delivered
    Checkpoint(Position),
}

/// Lazy event sequence starting at a given position
pub struct EventSubscription {
    adapter: Arc<dyn ChainAdapter>,
    next: Position,
    batch_size: u64,
    poll_interval: Duration,
    max_backoff: Duration,
}

struct SubscriptionState {
    subscription: EventSubscription,
    buffer: VecDeque<ChainItem>,
    consecutive_failures: u32,
}

impl EventSubscription {
    /// Subscribe from `from` inclusive
    pub fn new(adapter: Arc<dyn ChainAdapter>, from: Position) -> Self {
        Self {
            adapter,
            next: from,
            batch_size: 1000,
            poll_interval: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Next position that has not been delivered
    pub fn next_position(&self) -> Position {
        self.next
    }

    /// Poll the chain once, buffering any new items
    async fn poll_once(&mut self, buffer: &mut VecDeque<ChainItem>) -> crate::error::RelayerResult<bool> {
        let finalized = self.adapter.current_finalized_position().await?;
        if finalized < self.next {
            return Ok(false);
        }

        let from = self.next;
        let to = std::cmp::min(finalized, from.saturating_add(self.batch_size - 1));

        debug!(chain = %self.adapter.chain(), from, to, "Fetching events");

        let mut events = self.adapter.fetch_events(from, to).await?;
        events.sort_by_key(|e| (e.position, e.event_seq));

        for event in events {
            if event.position < from || event.position > to {
                warn!(
                    chain = %event.chain,
                    position = event.position,
                    "Adapter returned event outside requested range [{}, {}], dropping",
                    from,
                    to
                );
                continue;
            }
            buffer.push_back(ChainItem::Event(event));
        }
        buffer.push_back(ChainItem::Checkpoint(to));
        self.next = to + 1;

        Ok(true)
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(10);
        self.poll_interval
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Turn the subscription into a stream that never ends on its own
    pub fn into_stream(self) -> impl Stream<Item = ChainItem> + Send {
        let state = SubscriptionState {
            subscription: self,
            buffer: VecDeque::new(),
            consecutive_failures: 0,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.buffer.pop_front() {
                    return Some((item, state));
                }

                let chain = state.subscription.adapter.chain();
                match state.subscription.poll_once(&mut state.buffer).await {
                    Ok(true) => {
                        state.consecutive_failures = 0;
                    }
                    Ok(false) => {
                        state.consecutive_failures = 0;
                        tokio::time::sleep(state.subscription.poll_interval).await;
                    }
                    Err(e) => {
                        state.consecutive_failures += 1;
                        let delay = state.subscription.backoff(state.consecutive_failures);
                        warn!(
                            chain = %chain,
                            resume_from = state.subscription.next,
                            "Subscription error (retrying in {:?}): {}",
                            delay,
                            e
                        );
                        crate::metrics::record_subscription_error(chain);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}

/// Pumps one chain's subscription into its ordered relay queue
pub struct ChainListener {
    chain: ChainId,
    subscription: EventSubscription,
    queue: mpsc::Sender<ChainItem>,
}

impl ChainListener {
    pub fn new(subscription: EventSubscription, queue: mpsc::Sender<ChainItem>) -> Self {
        Self {
            chain: subscription.adapter.chain(),
            subscription,
            queue,
        }
    }

    /// Main listening loop, returns on shutdown or when the worker goes away
    pub async fn listen(self, mut shutdown: watch::Receiver<bool>) {
        let chain = self.chain;
        info!(
            chain = %chain,
            from = self.subscription.next_position(),
            "Listening for bridge events"
        );

        let stream = self.subscription.into_stream();
        futures::pin_mut!(stream);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                item = stream.next() => {
                    let Some(item) = item else { break };
                    if let ChainItem::Event(ref event) = item {
                        crate::metrics::record_event(event);
                    }
                    if self.queue.send(item).await.is_err() {
                        debug!(chain = %chain, "Relay queue closed");
                        break;
                    }
                }
            }
        }

        info!(chain = %chain, "Listener stopped");
    }
}
