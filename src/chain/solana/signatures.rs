//! Incremental walk over the bridge program's signature history
//!
//! `getSignaturesForAddress` only pages backwards from the newest
//! signature. The window remembers the newest signature it has swept, so
//! each sweep stops there (`until`) and only new history is read. Swept
//! signatures above the requested range stay buffered for later batches.

use crate::events::Position;

use solana_sdk::signature::Signature;
use std::collections::VecDeque;

/// One entry of the program's signature history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSignature {
    pub signature: Signature,
    pub slot: Position,
    pub block_time: Option<i64>,
    /// The transaction errored, so it emitted nothing
    pub failed: bool,
}

#[derive(Debug, Default)]
pub struct SignatureWindow {
    /// Swept, successful signatures not yet delivered, oldest first
    buffered: VecDeque<BridgeSignature>,
    /// Newest signature swept so far
    anchor: Option<Signature>,
    /// Start of the range the next fetch is expected to ask for
    next_from: Option<Position>,
}

impl SignatureWindow {
    /// Begin a fetch starting at `from`; returns the `until` bound for the sweep.
    ///
    /// Any request other than the continuation of the last delivered range
    /// (a restart, or a rewind) discards the buffer and sweeps afresh.
    pub fn begin(&mut self, from: Position) -> Option<Signature> {
        if self.next_from != Some(from) {
            self.buffered.clear();
            self.anchor = None;
            self.next_from = Some(from);
        }
        self.anchor
    }

    /// Add the result of a sweep, newest first, all newer than the anchor
    pub fn extend(&mut self, newest_first: Vec<BridgeSignature>) {
        if let Some(newest) = newest_first.first() {
            self.anchor = Some(newest.signature);
        }
        self.buffered
            .extend(newest_first.into_iter().rev().filter(|s| !s.failed));
    }

    /// Buffered signatures within `[from, to]`, oldest first
    pub fn range(&self, from: Position, to: Position) -> Vec<BridgeSignature> {
        self.buffered
            .iter()
            .filter(|s| s.slot >= from && s.slot <= to)
            .cloned()
            .collect()
    }

    /// Drop everything up to `to` once its events were delivered
    pub fn commit(&mut self, to: Position) {
        while self.buffered.front().is_some_and(|s| s.slot <= to) {
            self.buffered.pop_front();
        }
        self.next_from = Some(to.saturating_add(1));
    }
}
