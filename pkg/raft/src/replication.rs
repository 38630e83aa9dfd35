//! The per-follower replication loop a leader runs for each other peer,
//! and the majority-commit rule it drives.
//!
//! Spec §9 REDESIGN FLAG: `majority_match_index` picks the largest index
//! held by a strict majority of peers (`⌊N/2⌋+1` of them), not the
//! spec's illustrative "2nd-smallest of 4" shortcut, which under-commits
//! for even cluster sizes.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Notify;

use crate::peer::{LeaderState, Peer, Role, State};
use crate::rpc::{AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply};
use crate::{LogIndex, ServerId, Term};

enum Dispatch {
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

enum Outcome {
    Continue,
    Stop,
}

/// Replicates to `target` for as long as this peer remains leader of
/// `epoch`. One instance is spawned per follower each time this peer
/// becomes leader, and it retires on its own once a higher term is
/// observed or a new leadership term begins (`epoch` no longer matches).
pub(crate) async fn run(peer: Arc<Peer>, target: ServerId, epoch: u64, wake: Arc<Notify>) {
    loop {
        if peer.is_killed() {
            return;
        }

        let dispatch = match build_dispatch(&peer, target, epoch).await {
            Some(d) => d,
            None => return,
        };

        let outcome = match dispatch {
            Dispatch::AppendEntries(args) => {
                match peer.peers[target].append_entries(target, args.clone()).await {
                    Ok(reply) => handle_append_entries_reply(&peer, target, epoch, &args, reply).await,
                    Err(()) => {
                        debug!("peer {}: append_entries to {} failed (transport)", peer.id, target);
                        Outcome::Continue
                    }
                }
            }
            Dispatch::InstallSnapshot(args) => {
                let snapshot_index = args.last_included_index;
                match peer.peers[target].install_snapshot(target, args).await {
                    Ok(reply) => {
                        handle_install_snapshot_reply(&peer, target, epoch, snapshot_index, reply).await
                    }
                    Err(()) => Outcome::Continue,
                }
            }
        };

        if matches!(outcome, Outcome::Stop) {
            return;
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(peer.config.heartbeat_interval()) => {}
        }
    }
}

async fn build_dispatch(peer: &Arc<Peer>, target: ServerId, epoch: u64) -> Option<Dispatch> {
    let state = peer.state.lock().await;
    let leader = match current_leader(&state, epoch) {
        Some(l) => l,
        None => return None,
    };

    let next = leader.next_index[target];

    if next <= state.log.last_included_index() {
        return Some(Dispatch::InstallSnapshot(InstallSnapshotArgs {
            term: state.current_term,
            leader_id: peer.id,
            last_included_index: state.log.last_included_index(),
            last_included_term: state.log.last_included_term(),
            data: state.log.snapshot_bytes().to_vec(),
        }));
    }

    let prev_index = next - 1;
    let prev_term = state.log.term_of(prev_index).unwrap_or(0);

    Some(Dispatch::AppendEntries(AppendEntriesArgs {
        term: state.current_term,
        leader_id: peer.id,
        prev_log_index: prev_index,
        prev_log_term: prev_term,
        entries: state.log.entries_from(next),
        leader_commit: state.commit_index,
    }))
}

fn current_leader(state: &State, epoch: u64) -> Option<&LeaderState> {
    if state.leader_epoch != epoch {
        return None;
    }
    match &state.role {
        Role::Leader(leader) => Some(leader),
        _ => None,
    }
}

async fn handle_append_entries_reply(
    peer: &Arc<Peer>,
    target: ServerId,
    epoch: u64,
    sent: &AppendEntriesArgs,
    reply: AppendEntriesReply,
) -> Outcome {
    let mut state = peer.state.lock().await;

    if reply.term > state.current_term {
        peer.step_down_locked(&mut state, reply.term);
        peer.persist_locked(&state);
        return Outcome::Stop;
    }

    if state.leader_epoch != epoch {
        return Outcome::Stop;
    }

    let my_last_index = state.log.last_index();
    let current_term = state.current_term;
    let backoff_hint = if reply.success {
        None
    } else {
        Some(
            state
                .log
                .next_index_from_reply(reply.x_term, reply.x_index, reply.x_len),
        )
    };

    let leader = match &mut state.role {
        Role::Leader(leader) => leader,
        _ => return Outcome::Stop,
    };

    let mut committed = false;

    if reply.success {
        let new_match = sent.prev_log_index + sent.entries.len() as LogIndex;
        leader.match_index[target] = leader.match_index[target].max(new_match);
        leader.next_index[target] = leader.match_index[target] + 1;
    } else if let Some(hint) = backoff_hint {
        leader.next_index[target] = hint.max(1);
    }

    if reply.success {
        let before = state.commit_index;
        advance_commit_index(&mut state, peer.id, my_last_index, current_term);
        committed = state.commit_index != before;
    }

    if committed {
        peer.apply_cursor.wake();
    }

    Outcome::Continue
}

async fn handle_install_snapshot_reply(
    peer: &Arc<Peer>,
    target: ServerId,
    epoch: u64,
    snapshot_index: LogIndex,
    reply: InstallSnapshotReply,
) -> Outcome {
    let mut state = peer.state.lock().await;

    if reply.term > state.current_term {
        peer.step_down_locked(&mut state, reply.term);
        peer.persist_locked(&state);
        return Outcome::Stop;
    }

    if state.leader_epoch != epoch {
        return Outcome::Stop;
    }

    let leader = match &mut state.role {
        Role::Leader(leader) => leader,
        _ => return Outcome::Stop,
    };

    leader.match_index[target] = leader.match_index[target].max(snapshot_index);
    leader.next_index[target] = leader.next_index[target].max(snapshot_index + 1);

    Outcome::Continue
}

/// The leader-side commit rule: raise `commit_index` to the highest
/// index held by a strict majority, provided that entry was appended
/// during the leader's own current term (Raft's leader-completeness
/// safety rule — a leader never commits an older-term entry directly,
/// only as a side effect of committing a later entry that follows it).
fn advance_commit_index(state: &mut State, self_id: ServerId, my_last_index: LogIndex, current_term: Term) {
    let candidate = match &state.role {
        Role::Leader(leader) => {
            let mut indices = leader.match_index.clone();
            indices[self_id] = my_last_index;
            majority_match_index(&indices)
        }
        _ => return,
    };

    if candidate > state.commit_index && state.log.term_of(candidate) == Some(current_term) {
        state.commit_index = candidate;
    } else if candidate > state.commit_index {
        warn!(
            "leader: withholding commit of index {} from a prior term",
            candidate
        );
    }
}

/// The highest index acknowledged by at least `⌊N/2⌋+1` of `match_index`
/// (which must include this leader's own last log index).
fn majority_match_index(match_index: &[LogIndex]) -> LogIndex {
    let mut sorted = match_index.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    sorted[n - n / 2 - 1]
}

#[cfg(test)]
mod tests {
    use super::majority_match_index;

    #[test]
    fn odd_cluster_needs_strict_majority() {
        // 5 servers, quorum of 3.
        assert_eq!(majority_match_index(&[5, 3, 3, 1, 1]), 3);
    }

    #[test]
    fn even_cluster_uses_floor_plus_one() {
        // 4 servers, quorum of 3 (not 2): only 2 peers hold index 7, so
        // the highest index held by a strict majority is 2.
        assert_eq!(majority_match_index(&[10, 7, 2, 2]), 2);
    }

    #[test]
    fn single_node_commits_immediately() {
        assert_eq!(majority_match_index(&[9]), 9);
    }
}
