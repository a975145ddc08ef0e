//! Nonce allocation for the relayer wallet
//!
//! Handles:
//! - Local nonce tracking across consecutive prepared mints
//! - Rolling back a nonce whose transaction never reached the node
//! - Resynchronising with the chain after a dropped transaction
//! - Pinning a replacement to the nonce of the transaction it replaces

use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out, once known
    next: Option<u64>,
}

/// Tracks the relayer wallet's next nonce on the EVM chain
#[derive(Debug, Default)]
pub struct NonceManager {
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next nonce given the chain's pending transaction count.
    ///
    /// Never hands out a nonce below `on_chain`, which would be rejected.
    pub async fn allocate(&self, on_chain: u64) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = match state.next {
            Some(local) if local >= on_chain => local,
            Some(local) => {
                warn!("Local nonce {} behind chain nonce {}, skipping ahead", local, on_chain);
                on_chain
            }
            None => on_chain,
        };
        state.next = Some(nonce + 1);

        debug!("Allocated nonce {}", nonce);
        nonce
    }

    /// Reuse `nonce` for a replacement transaction.
    ///
    /// Later allocations stay above it even if the chain has not seen it yet.
    pub async fn pin(&self, nonce: u64) -> u64 {
        let mut state = self.state.lock().await;
        if state.next.map_or(true, |next| next <= nonce) {
            state.next = Some(nonce + 1);
        }
        debug!("Pinned nonce {}", nonce);
        nonce
    }

    /// Give back a nonce whose transaction was never accepted by the node
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            debug!("Released nonce {}", nonce);
        }
    }

    /// Forget local state so the next allocation follows the chain
    pub async fn reset(&self) {
        self.state.lock().await.next = None;
    }

    pub async fn peek(&self) -> Option<u64> {
        self.state.lock().await.next
    }
}
