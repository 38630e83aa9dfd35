//! Messages delivered to the host state machine, and the cursor the
//! applier task waits on.
//!
//! The applier (spawned in `peer.rs`, since it needs direct access to
//! the peer's locked state) is the *sole* producer on the apply channel.
//! `InstallSnapshot` never pushes a snapshot message itself — it records
//! the new snapshot and notifies this same cursor, and the applier
//! decides, under the peer's lock, whether the next thing to deliver is
//! a contiguous run of log entries or a snapshot. Keeping delivery to a
//! single task is what guarantees messages arrive in strictly increasing
//! order.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::{LogIndex, Term};

/// A message delivered to the host, in increasing order of the log
/// position it corresponds to.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// `command` at `index` has been committed by the cluster and is
    /// safe to execute against the host state machine.
    Command { index: LogIndex, command: Vec<u8> },

    /// The host must discard its state machine and replace it with
    /// `snapshot`, which reflects every command up to and including
    /// `index` (at `term`). Only sent for snapshots this peer did not
    /// create itself (i.e. received via InstallSnapshot and accepted by
    /// the host's `cond_install_snapshot`).
    Snapshot {
        term: Term,
        index: LogIndex,
        snapshot: Vec<u8>,
    },
}

/// Wakes the applier task whenever `commit_index` advances or a new
/// snapshot arrives. A plain `Notify`, not a condvar: the applier always
/// re-checks `last_applied < commit_index` (or a pending snapshot) from
/// scratch on every wakeup rather than trusting the wakeup's cause, so a
/// coalesced or spurious notification is harmless.
#[derive(Default)]
pub struct ApplyCursor {
    notify: Notify,
}

impl ApplyCursor {
    pub fn new() -> Arc<Self> {
        Arc::new(ApplyCursor::default())
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
