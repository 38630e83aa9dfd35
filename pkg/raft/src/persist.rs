//! The persistence adapter: an injected capability. This crate only owns
//! the trait and the record layout serialized into its single atomic
//! blob; the hosting service supplies the actual durable storage.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, ServerId, Term};

/// Everything that must be written atomically whenever the persistent
/// state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub live_entries: Vec<LogEntry>,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
}

/// Durable storage for a single peer's Raft state.
///
/// A reader of [`Persister::read_state`] observes either the pre-image
/// or the post-image of the most recent [`Persister::save_state`] (or
/// [`Persister::save_state_and_snapshot`]) call, never a mix — the
/// module relies on this to make persisting under its coarse lock
/// equivalent to persisting atomically with respect to a crash.
pub trait Persister: Send + Sync {
    /// Durably writes the encoded `(current_term, voted_for, log)`
    /// record, leaving the snapshot slot untouched.
    fn save_state(&self, state: Vec<u8>);

    /// Durably writes the state record and replaces the snapshot slot
    /// in one atomic operation — used when the log store compacts a
    /// prefix away.
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>);

    /// The most recently saved state record, or empty if none has ever
    /// been saved.
    fn read_state(&self) -> Vec<u8>;

    /// The most recently saved snapshot, or empty if none has ever been
    /// saved.
    fn read_snapshot(&self) -> Vec<u8>;

    /// Combined byte size of the state record and the snapshot, for
    /// hosts that want to watch log growth.
    fn state_size(&self) -> usize {
        self.read_state().len()
    }
}

/// An in-memory `Persister` for tests and local experimentation. Not
/// durable across process restarts — a real host supplies its own
/// disk-backed implementation of the trait.
#[derive(Default)]
pub struct MemoryPersister {
    inner: std::sync::Mutex<MemoryPersisterState>,
}

#[derive(Default)]
struct MemoryPersisterState {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister::default()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, state: Vec<u8>) {
        self.inner.lock().unwrap().state = state;
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = state;
        guard.snapshot = snapshot;
    }

    fn read_state(&self) -> Vec<u8> {
        self.inner.lock().unwrap().state.clone()
    }

    fn read_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().snapshot.clone()
    }
}

/// Encodes a [`PersistedState`] the way every `Peer::persist` call does.
pub fn encode_state(state: &PersistedState) -> Vec<u8> {
    bincode::serialize(state).expect("PersistedState encoding is infallible")
}

/// Decodes a record previously produced by [`encode_state`]. `None` if
/// `bytes` is empty (a peer that has never persisted anything).
pub fn decode_state(bytes: &[u8]) -> Option<PersistedState> {
    if bytes.is_empty() {
        return None;
    }
    bincode::deserialize(bytes).ok()
}
