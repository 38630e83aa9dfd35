//! The cancellable timer used to drive the election timeout.
//!
//! The teacher cancels a pending timeout with an `Arc<Mutex<bool>>` flag
//! checked after waking up. That races a timer armed-and-fired against a
//! reset happening in between: the generation counter here closes that
//! window by having `fire` compare its own stamped generation against
//! the current one under the same lock that bumps it, so a reset always
//! wins races against a timer that already expired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Shared cancellation token for a single recurring timeout.
#[derive(Default)]
pub struct Cancellable {
    generation: AtomicU64,
}

impl Cancellable {
    pub fn new() -> Arc<Self> {
        Arc::new(Cancellable::default())
    }

    /// Invalidates any timer armed before this call.
    pub fn reset(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Sleeps for a duration drawn uniformly from `range`, then returns
/// `true` iff `token` was not reset in the meantime — i.e. the caller's
/// election timeout genuinely elapsed and it should start an election.
pub async fn election_timeout(token: &Arc<Cancellable>, range: (Duration, Duration)) -> bool {
    let (lo, hi) = range;
    let delay = if hi > lo {
        let extra = rand::thread_rng().gen_range(0..=(hi - lo).as_millis() as u64);
        lo + Duration::from_millis(extra)
    } else {
        lo
    };

    let generation = token.current();
    tokio::time::sleep(delay).await;
    generation == token.current()
}
