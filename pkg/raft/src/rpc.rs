//! Wire types for the three Raft RPCs, and the transport abstraction
//! they travel over.
//!
//! The transport itself — how bytes actually reach another peer — is an
//! injected capability (spec §1, §6): this module only defines the
//! argument/reply shapes and the [`RaftClient`] trait a host implements
//! on top of its own RPC substrate. `Ok` from a `RaftClient` method means
//! the request reached the peer and got a reply; `Err` means a transport
//! failure (timeout, connection refused, peer down) — the same "RPC
//! returned false" case spec §7 says the replication loop retries
//! without ever surfacing to the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, ServerId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,

    /// Fast conflict-backtracking hints (spec §4.1 `detect_conflict`).
    /// Only meaningful when `success` is `false`.
    pub x_term: Option<Term>,
    pub x_index: Option<LogIndex>,
    pub x_len: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// A peer's view of the RPC substrate: send each of the three Raft RPCs
/// to a numbered peer and await its reply.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn request_vote(
        &self,
        peer: ServerId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, ()>;

    async fn append_entries(
        &self,
        peer: ServerId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, ()>;

    async fn install_snapshot(
        &self,
        peer: ServerId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, ()>;
}
