//! A Raft consensus module.
//!
//! This crate implements the replicated log described by the Raft paper
//! (Figure 2), plus the fast conflict-index backtracking and
//! log-compaction extensions. A hosting service embeds one [`Peer`] per
//! node, feeds it local client commands through [`Peer::start`], and
//! receives committed commands and installed snapshots back through a
//! one-way apply channel.
//!
//! The RPC transport (peer-to-peer network calls) and the persistence
//! layer (durable storage of term/vote/log/snapshot) are injected
//! capabilities: this crate defines the [`RaftClient`] and [`Persister`]
//! traits and drives them, but owns neither a network stack nor a disk
//! format. Cluster membership changes, leader leases, read-only
//! optimizations, pre-vote, extra request pipelining, and client
//! deduplication are not implemented.
//!
//! Logging is emitted through the `log` facade; set `RUST_LOG` (e.g. via
//! `env_logger`) to `trace`, `debug`, `info`, `warn`, or `error` to
//! control verbosity.

#[macro_use]
extern crate error_chain;

pub mod errors;

pub mod apply;
pub mod config;
pub mod log;
pub mod peer;
pub mod persist;
pub mod replication;
pub mod rpc;
pub mod timer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use apply::ApplyMsg;
pub use config::Config;
pub use log::LogEntry;
pub use peer::Peer;
pub use persist::{MemoryPersister, Persister};
pub use rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftClient,
    RequestVoteArgs, RequestVoteReply,
};

/// Identifies a peer within the cluster. Peers are numbered `0..peers.len()`
/// by their position in the slice passed to [`Peer::new`].
pub type ServerId = usize;

/// A monotonically increasing election term. At most one leader exists
/// per term.
pub type Term = u64;

/// A 1-based position in the replicated log. Index `0` is a sentinel
/// meaning "before the start of the log".
pub type LogIndex = u64;
