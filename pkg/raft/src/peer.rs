//! The `Peer` facade: one cluster member's share of the replicated log,
//! and the role/election machinery that decides who leads.
//!
//! Everything but RPC dispatch and the apply-channel delivery itself
//! runs under one coarse `tokio::sync::Mutex<State>` — the same
//! trade-off the teacher's `ConsensusModule` makes. Raft's invariants
//! are easiest to keep correct when "observe state, decide, mutate
//! state" is one atomic step; the entries that make that a bottleneck
//! (sending RPCs, writing to disk, delivering to the host) all happen
//! with the lock dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::apply::{ApplyCursor, ApplyMsg};
use crate::config::Config;
use crate::log::LogStore;
use crate::persist::{decode_state, encode_state, PersistedState, Persister};
use crate::replication;
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftClient,
    RequestVoteArgs, RequestVoteReply,
};
use crate::timer::{self, Cancellable};
use crate::{LogIndex, ServerId, Term};

pub(crate) enum Role {
    Follower,
    Candidate,
    Leader(LeaderState),
}

pub(crate) struct LeaderState {
    pub(crate) next_index: Vec<LogIndex>,
    pub(crate) match_index: Vec<LogIndex>,
    pub(crate) wake: Vec<Arc<Notify>>,
}

pub(crate) struct PendingSnapshot {
    pub(crate) term: Term,
    pub(crate) index: LogIndex,
    pub(crate) bytes: Vec<u8>,
}

pub(crate) struct State {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ServerId>,
    pub(crate) log: LogStore,
    pub(crate) role: Role,
    pub(crate) leader_epoch: u64,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) pending_snapshot: Option<PendingSnapshot>,
}

/// One member of a Raft cluster.
///
/// Constructed with [`Peer::new`], driven by a host that calls
/// [`Peer::start`] with client commands and forwards inbound RPCs to
/// [`Peer::handle_request_vote`], [`Peer::handle_append_entries`], and
/// [`Peer::handle_install_snapshot`]. Committed commands (and installed
/// snapshots) arrive back on the channel passed to `new`.
pub struct Peer {
    pub(crate) id: ServerId,
    pub(crate) peers: Vec<Arc<dyn RaftClient>>,
    pub(crate) persister: Arc<dyn Persister>,
    pub(crate) config: Config,
    pub(crate) state: Mutex<State>,
    pub(crate) apply_cursor: Arc<ApplyCursor>,
    pub(crate) election_token: Arc<Cancellable>,
    pub(crate) killed: AtomicBool,
}

impl Peer {
    /// Brings up a peer, restoring any previously persisted term, vote,
    /// and log from `persister`, and spawns its background tasks
    /// (election timer and applier). Mirrors the `Make` constructor of
    /// the Raft lab API this module's external interface is shaped
    /// after.
    pub async fn new(
        peers: Vec<Arc<dyn RaftClient>>,
        me: ServerId,
        persister: Arc<dyn Persister>,
        apply_ch: mpsc::Sender<ApplyMsg>,
        config: Config,
    ) -> Arc<Peer> {
        let (current_term, voted_for, log) = match decode_state(&persister.read_state()) {
            Some(PersistedState {
                last_included_index,
                last_included_term,
                live_entries,
                current_term,
                voted_for,
            }) => (
                current_term,
                voted_for,
                LogStore::restore(
                    persister.read_snapshot(),
                    last_included_index,
                    last_included_term,
                    live_entries,
                ),
            ),
            None => (0, None, LogStore::new()),
        };

        let last_included_index = log.last_included_index();

        let state = State {
            current_term,
            voted_for,
            log,
            role: Role::Follower,
            leader_epoch: 0,
            commit_index: last_included_index,
            last_applied: last_included_index,
            pending_snapshot: None,
        };

        let peer = Arc::new(Peer {
            id: me,
            peers,
            persister,
            config,
            state: Mutex::new(state),
            apply_cursor: ApplyCursor::new(),
            election_token: Cancellable::new(),
            killed: AtomicBool::new(false),
        });

        tokio::spawn(peer.clone().run_election_timer());
        tokio::spawn(peer.clone().run_applier(apply_ch));

        peer
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Stops this peer's background tasks. Idempotent; a killed peer
    /// answers RPCs as it always did but never starts a new election or
    /// replicates, and its applier drains no further.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        self.election_token.reset();
        self.apply_cursor.wake();
    }

    /// The peer's current term, and whether it believes itself to be
    /// leader of it.
    pub async fn get_state(&self) -> (Term, bool) {
        let state = self.state.lock().await;
        (state.current_term, matches!(state.role, Role::Leader(_)))
    }

    /// Proposes `command` for replication. Returns the index and term it
    /// would occupy if this peer is (and remains) leader, and whether
    /// this peer is currently leader at all — a `false` does not mean
    /// the command was rejected, only that the caller must not assume it
    /// will ever be committed.
    pub async fn start(&self, command: Vec<u8>) -> (LogIndex, Term, bool) {
        let mut state = self.state.lock().await;
        let term = state.current_term;

        let wake = match &state.role {
            Role::Leader(leader) => leader.wake.clone(),
            _ => return (0, term, false),
        };

        let index = state.log.append(term, command);
        self.persist_locked(&state);
        drop(state);

        for w in wake {
            w.notify_one();
        }

        (index, term, true)
    }

    /// Tells the module the host state machine has durably applied every
    /// command up to `index`, bundled as `snapshot`, and that the log
    /// prefix up to `index` can be discarded.
    pub async fn snapshot(&self, index: LogIndex, snapshot: Vec<u8>) {
        let mut state = self.state.lock().await;
        if index <= state.log.last_included_index() || index > state.last_applied {
            return;
        }
        let term = match state.log.term_of(index) {
            Some(t) => t,
            None => return,
        };
        state.log.install_snapshot(snapshot, index, term);
        self.persist_snapshot_locked(&state);
    }

    /// The host's answer to a snapshot delivered via
    /// [`ApplyMsg::Snapshot`]: `true` if it should be installed, `false`
    /// if this peer's state has already moved past it (a newer commit
    /// or snapshot arrived while the host was deciding).
    pub async fn cond_install_snapshot(&self, term: Term, index: LogIndex, snapshot: Vec<u8>) -> bool {
        let mut state = self.state.lock().await;
        // Stale: a later commit or snapshot already passed this point
        // while the host was deciding whether to adopt it.
        if state.commit_index >= index {
            return false;
        }
        state.log.install_snapshot(snapshot, index, term);
        state.commit_index = index;
        state.last_applied = index;
        self.persist_snapshot_locked(&state);
        true
    }

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;

        if args.term > state.current_term {
            self.step_down_locked(&mut state, args.term);
        }

        let vote_granted = args.term == state.current_term
            && (state.voted_for.is_none() || state.voted_for == Some(args.candidate_id))
            && !state
                .log
                .more_up_to_date_than(args.last_log_term, args.last_log_index);

        if vote_granted {
            state.voted_for = Some(args.candidate_id);
            self.election_token.reset();
        }

        self.persist_locked(&state);
        debug!(
            "peer {}: vote request from {} for term {} -> {}",
            self.id, args.candidate_id, args.term, vote_granted
        );

        RequestVoteReply {
            term: state.current_term,
            vote_granted,
        }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;

        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_term: None,
                x_index: None,
                x_len: state.log.last_index() + 1,
            };
        }

        if args.term > state.current_term {
            self.step_down_locked(&mut state, args.term);
            self.persist_locked(&state);
        }
        state.role = Role::Follower;
        self.election_token.reset();

        // A `prev_log_index` past the end of our log is the only "too far
        // ahead" rejection; a `prev_log_index` before the snapshot prefix
        // is always accepted (that portion is already committed and
        // correct, regardless of what `args.prev_log_term` claims).
        let missing_prev = args.prev_log_index > state.log.last_index();
        let (x_term, x_index) =
            state
                .log
                .detect_conflict(args.prev_log_index, args.prev_log_term, &args.entries);

        if missing_prev || x_term.is_some() {
            self.persist_locked(&state);
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                x_term,
                x_index,
                x_len: state.log.last_index() + 1,
            };
        }

        let changed = state.log.update(args.prev_log_index, &args.entries);
        if changed {
            self.persist_locked(&state);
        }

        if args.leader_commit > state.commit_index {
            let new_tail = args.prev_log_index + args.entries.len() as LogIndex;
            state.commit_index = args.leader_commit.min(new_tail);
            self.apply_cursor.wake();
        }

        AppendEntriesReply {
            term: state.current_term,
            success: true,
            x_term: None,
            x_index: None,
            x_len: 0,
        }
    }

    /// Never installs the snapshot into the log store directly — it only
    /// hands it to the applier for delivery. The host confirms adoption
    /// through [`Peer::cond_install_snapshot`] (spec §4.9), which is the
    /// only place the log store's snapshot prefix actually advances for a
    /// leader-sent snapshot. This ordering is what lets `commit_index`
    /// stay a true lower bound on what the host has actually adopted.
    pub async fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut state = self.state.lock().await;

        if args.term < state.current_term {
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }

        if args.term > state.current_term {
            self.step_down_locked(&mut state, args.term);
            self.persist_locked(&state);
        }

        // Stale: the host has already committed past this point, so
        // adopting this snapshot would regress last_applied.
        if args.last_included_index <= state.commit_index {
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }

        state.role = Role::Follower;
        self.election_token.reset();

        state.pending_snapshot = Some(PendingSnapshot {
            term: args.last_included_term,
            index: args.last_included_index,
            bytes: args.data,
        });
        self.apply_cursor.wake();

        InstallSnapshotReply {
            term: state.current_term,
        }
    }

    pub(crate) fn step_down_locked(&self, state: &mut State, new_term: Term) {
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
    }

    pub(crate) fn persist_locked(&self, state: &State) {
        let record = PersistedState {
            last_included_index: state.log.last_included_index(),
            last_included_term: state.log.last_included_term(),
            live_entries: state.log.live_entries().iter().cloned().collect(),
            current_term: state.current_term,
            voted_for: state.voted_for,
        };
        self.persister.save_state(encode_state(&record));
    }

    fn persist_snapshot_locked(&self, state: &State) {
        let record = PersistedState {
            last_included_index: state.log.last_included_index(),
            last_included_term: state.log.last_included_term(),
            live_entries: state.log.live_entries().iter().cloned().collect(),
            current_term: state.current_term,
            voted_for: state.voted_for,
        };
        self.persister
            .save_state_and_snapshot(encode_state(&record), state.log.snapshot_bytes().to_vec());
    }

    async fn run_election_timer(self: Arc<Peer>) {
        loop {
            if self.is_killed() {
                return;
            }

            let fired = timer::election_timeout(&self.election_token, self.config.election_timeout()).await;
            if self.is_killed() || !fired {
                continue;
            }

            let should_start = {
                let state = self.state.lock().await;
                !matches!(state.role, Role::Leader(_))
            };

            if should_start {
                tokio::spawn(self.clone().start_election());
            }
        }
    }

    async fn start_election(self: Arc<Peer>) {
        let (term, last_log_index, last_log_term, votes_needed) = {
            let mut state = self.state.lock().await;
            state.current_term += 1;
            state.voted_for = Some(self.id);
            state.role = Role::Candidate;
            self.persist_locked(&state);
            self.election_token.reset();
            (
                state.current_term,
                state.log.last_index(),
                state.log.last_term(),
                self.peers.len() / 2 + 1,
            )
        };

        info!("peer {}: starting election for term {}", self.id, term);

        let args = RequestVoteArgs {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };

        let (tx, mut rx) = mpsc::channel(self.peers.len().max(1));
        for (target, client) in self.peers.iter().enumerate() {
            if target == self.id {
                continue;
            }
            let client = client.clone();
            let args = args.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = client.request_vote(target, args).await;
                let _ = tx.send(reply).await;
            });
        }
        drop(tx);

        let mut votes = 1usize;
        while let Some(result) = rx.recv().await {
            if self.is_killed() {
                return;
            }

            let reply = match result {
                Ok(reply) => reply,
                Err(()) => continue,
            };

            let mut state = self.state.lock().await;

            if reply.term > state.current_term {
                self.step_down_locked(&mut state, reply.term);
                self.persist_locked(&state);
                return;
            }

            if state.current_term != term || !matches!(state.role, Role::Candidate) {
                return;
            }

            if reply.vote_granted {
                votes += 1;
                if votes >= votes_needed {
                    self.become_leader_locked(&mut state);
                    return;
                }
            }
        }
    }

    fn become_leader_locked(self: &Arc<Peer>, state: &mut State) {
        let n = self.peers.len();
        let next = state.log.last_index() + 1;

        state.leader_epoch += 1;
        let epoch = state.leader_epoch;
        let wake: Vec<Arc<Notify>> = (0..n).map(|_| Arc::new(Notify::new())).collect();

        state.role = Role::Leader(LeaderState {
            next_index: vec![next; n],
            match_index: vec![0; n],
            wake: wake.clone(),
        });

        info!("peer {}: became leader for term {}", self.id, state.current_term);

        for target in 0..n {
            if target == self.id {
                continue;
            }
            tokio::spawn(replication::run(
                self.clone(),
                target,
                epoch,
                wake[target].clone(),
            ));
        }
    }

    async fn run_applier(self: Arc<Peer>, apply_ch: mpsc::Sender<ApplyMsg>) {
        loop {
            if self.is_killed() {
                return;
            }

            let msgs: Vec<ApplyMsg> = {
                let mut state = self.state.lock().await;
                if let Some(pending) = state.pending_snapshot.take() {
                    // last_applied only advances once the host confirms
                    // adoption via cond_install_snapshot (§4.9) — not here.
                    vec![ApplyMsg::Snapshot {
                        term: pending.term,
                        index: pending.index,
                        snapshot: pending.bytes,
                    }]
                } else if state.last_applied < state.commit_index {
                    let from = state.last_applied + 1;
                    let to = state.commit_index;
                    let take = (to - from + 1) as usize;
                    let msgs = state
                        .log
                        .entries_from(from)
                        .into_iter()
                        .take(take)
                        .enumerate()
                        .map(|(i, entry)| ApplyMsg::Command {
                            index: from + i as LogIndex,
                            command: entry.command,
                        })
                        .collect();
                    state.last_applied = to;
                    msgs
                } else {
                    Vec::new()
                }
            };

            if msgs.is_empty() {
                tokio::select! {
                    _ = self.apply_cursor.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                }
                continue;
            }

            for msg in msgs {
                if apply_ch.send(msg).await.is_err() {
                    warn!("peer {}: apply channel closed, applier stopping", self.id);
                    return;
                }
            }
        }
    }
}
