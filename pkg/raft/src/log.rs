//! The log store: an ordered command log with a snapshot prefix.
//!
//! Indices are 1-based; index `0` means "before the log starts". Entries
//! at or below `last_included_index` (`L`) live only in the snapshot —
//! `live` holds exactly the entries at indices `L+1 ..= L+live.len()`.
//! Terms along `live` are non-decreasing, and once an entry is reported
//! committed it is never overwritten, reordered, or dropped by
//! truncation; only [`LogStore::install_snapshot`] ever discards a
//! prefix, and only monotonically forward.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{LogIndex, Term};

/// A single entry in the replicated log. Immutable once durably
/// appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct LogStore {
    snapshot_bytes: Vec<u8>,
    last_included_index: LogIndex,
    last_included_term: Term,
    live: VecDeque<LogEntry>,
}

impl LogStore {
    pub fn new() -> Self {
        LogStore::default()
    }

    /// Restores a log store from a persisted record. Used on startup;
    /// skips all of the invariant-preserving bookkeeping `append`/
    /// `update`/`install_snapshot` do because a persisted record is
    /// assumed to already satisfy them.
    pub fn restore(
        snapshot_bytes: Vec<u8>,
        last_included_index: LogIndex,
        last_included_term: Term,
        live: Vec<LogEntry>,
    ) -> Self {
        LogStore {
            snapshot_bytes,
            last_included_index,
            last_included_term,
            live: live.into(),
        }
    }

    pub fn last_included_index(&self) -> LogIndex {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> Term {
        self.last_included_term
    }

    pub fn snapshot_bytes(&self) -> &[u8] {
        &self.snapshot_bytes
    }

    pub fn live_entries(&self) -> &VecDeque<LogEntry> {
        &self.live
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_included_index + self.live.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.term_of(self.last_index()).unwrap_or(0)
    }

    /// The term of the entry at `index`, or `None` if `index` is before
    /// the snapshot prefix or past the end of the log.
    pub fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        if index < self.last_included_index || index > self.last_index() {
            return None;
        }
        let offset = (index - self.last_included_index - 1) as usize;
        self.live.get(offset).map(|e| e.term)
    }

    /// Appends a single entry, returning its new index. Only ever called
    /// on a leader appending its own proposal.
    pub fn append(&mut self, term: Term, command: Vec<u8>) -> LogIndex {
        self.live.push_back(LogEntry { term, command });
        self.last_index()
    }

    /// Entries at indices `from ..= last_index()`. `from` must be `> L`.
    pub fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        debug_assert!(from > self.last_included_index);
        let offset = (from - self.last_included_index - 1) as usize;
        self.live.iter().skip(offset).cloned().collect()
    }

    fn first_index_with_term(&self, term: Term) -> LogIndex {
        for (offset, entry) in self.live.iter().enumerate() {
            if entry.term == term {
                return self.last_included_index + 1 + offset as LogIndex;
            }
        }
        self.last_included_index + 1
    }

    fn last_index_with_term(&self, term: Term) -> Option<LogIndex> {
        for (offset, entry) in self.live.iter().enumerate().rev() {
            if entry.term == term {
                return Some(self.last_included_index + 1 + offset as LogIndex);
            }
        }
        if self.last_included_index > 0 && self.last_included_term == term {
            return Some(self.last_included_index);
        }
        None
    }

    /// The fast-backoff conflict hint used by the AppendEntries handler.
    /// `entries` are the leader's proposed entries starting right after
    /// `prev_index`.
    pub fn detect_conflict(
        &self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: &[LogEntry],
    ) -> (Option<Term>, Option<LogIndex>) {
        if let Some(existing) = self.term_of(prev_index) {
            if existing != prev_term {
                return (Some(existing), Some(self.first_index_with_term(existing)));
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            let j = prev_index + 1 + i as LogIndex;
            if j <= self.last_included_index {
                // Already subsumed by the snapshot; always agrees.
                continue;
            }
            match self.term_of(j) {
                Some(local_term) if local_term != entry.term => {
                    return (Some(local_term), Some(self.first_index_with_term(local_term)));
                }
                Some(_) => continue,
                None => break,
            }
        }

        (None, None)
    }

    /// Applies a leader's AppendEntries payload. `prev_index` is the
    /// index immediately preceding `entries[0]`. Returns `true` iff the
    /// log changed and must be persisted.
    pub fn update(&mut self, prev_index: LogIndex, entries: &[LogEntry]) -> bool {
        let mut changed = false;

        for (i, entry) in entries.iter().enumerate() {
            let j = prev_index + 1 + i as LogIndex;

            if j <= self.last_included_index {
                // Already committed via snapshot; nothing to do.
                continue;
            }

            match self.term_of(j) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    self.truncate_to(j - 1);
                    self.live.push_back(entry.clone());
                    changed = true;
                }
                None => {
                    self.live.push_back(entry.clone());
                    changed = true;
                }
            }
        }

        changed
    }

    /// Drops every entry at an index `> index`.
    fn truncate_to(&mut self, index: LogIndex) {
        if index < self.last_included_index {
            self.live.clear();
            return;
        }
        let keep = (index - self.last_included_index) as usize;
        self.live.truncate(keep);
    }

    /// The leader-side inverse of `detect_conflict`: given a follower's
    /// rejection hint, computes the next `next_index` to try.
    pub fn next_index_from_reply(
        &self,
        x_term: Option<Term>,
        x_index: Option<LogIndex>,
        x_len: LogIndex,
    ) -> LogIndex {
        match x_term {
            None => x_len,
            Some(term) => match self.last_index_with_term(term) {
                Some(last) => last + 1,
                None => x_index.unwrap_or(x_len),
            },
        }
    }

    /// Installs a snapshot covering `1 ..= new_last_included_index`.
    /// Returns `true` iff the host state machine must be reset from the
    /// snapshot bytes (the local log did not already agree with the
    /// leader at `new_last_included_index`). Must only be called with
    /// `new_last_included_index > last_included_index()`.
    pub fn install_snapshot(
        &mut self,
        bytes: Vec<u8>,
        new_last_included_index: LogIndex,
        new_last_included_term: Term,
    ) -> bool {
        assert!(new_last_included_index > self.last_included_index);

        let reset = match self.term_of(new_last_included_index) {
            Some(term) if term == new_last_included_term => {
                let keep_from = (new_last_included_index - self.last_included_index) as usize;
                self.live.drain(..keep_from);
                false
            }
            _ => {
                self.live.clear();
                true
            }
        };

        self.last_included_index = new_last_included_index;
        self.last_included_term = new_last_included_term;
        self.snapshot_bytes = bytes;
        reset
    }

    /// `true` iff this log is at least as up-to-date as a candidate
    /// whose log ends at `(term, index)` — i.e. this log must NOT grant
    /// a vote to that candidate on log-recency grounds alone.
    pub fn more_up_to_date_than(&self, term: Term, index: LogIndex) -> bool {
        (self.last_term(), self.last_index()) > (term, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term) -> LogEntry {
        LogEntry {
            term,
            command: vec![],
        }
    }

    #[test]
    fn empty_log() {
        let log = LogStore::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_of(0), Some(0));
        assert_eq!(log.term_of(1), None);
    }

    #[test]
    fn append_and_term_of() {
        let mut log = LogStore::new();
        assert_eq!(log.append(1, vec![1]), 1);
        assert_eq!(log.append(1, vec![2]), 2);
        assert_eq!(log.append(2, vec![3]), 3);

        assert_eq!(log.term_of(1), Some(1));
        assert_eq!(log.term_of(3), Some(2));
        assert_eq!(log.term_of(4), None);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn detect_conflict_on_prev_mismatch() {
        // follower: [t1, t2, t2, t3]; leader thinks prev = (4, t4)
        let mut log = LogStore::new();
        for t in [1, 2, 2, 3] {
            log.append(t, vec![]);
        }

        let (x_term, x_index) = log.detect_conflict(4, 4, &[]);
        assert_eq!(x_term, Some(3));
        assert_eq!(x_index, Some(4));
    }

    #[test]
    fn update_truncates_on_conflict() {
        let mut log = LogStore::new();
        for t in [1, 2, 2, 3] {
            log.append(t, vec![]);
        }

        // Leader retries with prev = (3, t2), sending a t4 entry for index 4.
        let changed = log.update(3, &[entry(4)]);
        assert!(changed);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.term_of(4), Some(4));
    }

    #[test]
    fn update_skips_entries_inside_snapshot() {
        let mut log = LogStore::new();
        for t in [1, 1, 1] {
            log.append(t, vec![]);
        }
        log.install_snapshot(vec![9], 2, 1);

        // prev_index = 0 would re-send indices 1..=3; 1 and 2 are already
        // snapshotted and should be silently skipped.
        let changed = log.update(0, &[entry(1), entry(1), entry(1)]);
        assert!(!changed);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn next_index_from_reply_cases() {
        let mut leader = LogStore::new();
        for t in [1, 2, 2, 4] {
            leader.append(t, vec![]);
        }

        // Case 3: follower has nothing at all (xTerm = None).
        assert_eq!(leader.next_index_from_reply(None, None, 1), 1);

        // Case 2: leader has the conflicting term itself.
        assert_eq!(leader.next_index_from_reply(Some(2), Some(2), 5), 4);

        // Case 1: leader lacks the conflicting term; use the hint.
        assert_eq!(leader.next_index_from_reply(Some(9), Some(2), 5), 2);
    }

    #[test]
    fn install_snapshot_retains_matching_suffix() {
        let mut log = LogStore::new();
        for t in [1, 2, 2, 3, 3] {
            log.append(t, vec![]);
        }

        let reset = log.install_snapshot(vec![1, 2, 3], 3, 2);
        assert!(!reset);
        assert_eq!(log.last_included_index(), 3);
        assert_eq!(log.term_of(3), Some(2));
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_of(4), Some(3));
    }

    #[test]
    fn install_snapshot_drops_log_on_mismatch() {
        let mut log = LogStore::new();
        for t in [1, 2] {
            log.append(t, vec![]);
        }

        let reset = log.install_snapshot(vec![9, 9], 5, 3);
        assert!(reset);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
        assert!(log.live_entries().is_empty());
    }

    #[test]
    fn detect_conflict_accepts_prev_within_snapshot() {
        // A follower whose own log has compacted past where the leader's
        // cached nextIndex assumes should still accept: entries below the
        // snapshot boundary are already committed and always agree.
        let mut log = LogStore::new();
        for t in [1, 1, 1] {
            log.append(t, vec![]);
        }
        log.install_snapshot(vec![9], 2, 1);

        let (x_term, x_index) = log.detect_conflict(0, 0, &[entry(1), entry(1), entry(5)]);
        // The first two proposed entries fall inside the snapshot prefix
        // and are skipped; the third (index 3) really does conflict.
        assert_eq!(x_term, Some(1));
        assert_eq!(x_index, Some(3));
    }

    #[test]
    fn more_up_to_date_than() {
        let mut log = LogStore::new();
        log.append(1, vec![]);
        log.append(2, vec![]);

        assert!(log.more_up_to_date_than(1, 100));
        assert!(log.more_up_to_date_than(2, 1));
        assert!(!log.more_up_to_date_than(2, 2));
        assert!(!log.more_up_to_date_than(3, 1));
    }
}
