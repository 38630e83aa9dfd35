//! An in-memory stand-in for the RPC transport, modeled on the
//! `labrpc`-style network doubles Raft test suites use: calls dispatch
//! directly into a registered peer's RPC handlers rather than crossing
//! any real socket, with knobs to drop messages, delay them, or sever a
//! subset of servers from the rest (a network partition).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::peer::Peer;
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftClient,
    RequestVoteArgs, RequestVoteReply,
};
use crate::ServerId;

struct NetworkState {
    peers: HashMap<ServerId, Arc<Peer>>,
    /// Disjoint sets of mutually reachable servers. Empty means "no
    /// partition in effect" — everyone can reach everyone.
    groups: Vec<Vec<ServerId>>,
    reliable: bool,
    long_delays: bool,
}

/// A shared, fully-connected-by-default network of peers. Tests register
/// each peer after constructing it and dial out to others through a
/// [`NetworkClient`] obtained via [`Network::client_for`].
pub struct Network {
    inner: Mutex<NetworkState>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Network {
            inner: Mutex::new(NetworkState {
                peers: HashMap::new(),
                groups: Vec::new(),
                reliable: true,
                long_delays: false,
            }),
        })
    }

    pub fn register(&self, id: ServerId, peer: Arc<Peer>) {
        self.inner.lock().unwrap().peers.insert(id, peer);
    }

    /// A client that other code uses to reach peers on this network as
    /// server `from`.
    pub fn client_for(self: &Arc<Self>, from: ServerId) -> Arc<NetworkClient> {
        Arc::new(NetworkClient {
            network: self.clone(),
            from,
        })
    }

    /// Toggles random drops and short delays, simulating a lossy link.
    /// Reliable (the default) means every reachable call succeeds
    /// promptly.
    pub fn set_reliable(&self, reliable: bool) {
        self.inner.lock().unwrap().reliable = reliable;
    }

    /// Occasionally delays a call by several hundred milliseconds,
    /// simulating a slow link independent of `reliable`.
    pub fn set_long_delays(&self, on: bool) {
        self.inner.lock().unwrap().long_delays = on;
    }

    /// Only servers within the same group can reach each other; calls
    /// crossing group boundaries behave as if the peer were down. Pass
    /// disjoint groups; servers not named in any group remain reachable
    /// from everyone.
    pub fn partition(&self, groups: &[&[ServerId]]) {
        let mut state = self.inner.lock().unwrap();
        state.groups = groups.iter().map(|g| g.to_vec()).collect();
    }

    /// Restores full connectivity.
    pub fn heal(&self) {
        self.inner.lock().unwrap().groups.clear();
    }

    async fn gate(&self, from: ServerId, to: ServerId) -> Option<Arc<Peer>> {
        let (reachable, reliable, long_delays, peer) = {
            let state = self.inner.lock().unwrap();
            (
                Self::reachable(&state, from, to),
                state.reliable,
                state.long_delays,
                state.peers.get(&to).cloned(),
            )
        };

        let peer = peer?;
        if !reachable {
            return None;
        }

        if !reliable {
            let drop = rand::thread_rng().gen_bool(0.1);
            if drop {
                return None;
            }
            let delay_ms = rand::thread_rng().gen_range(0..27);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if long_delays {
            let hit = rand::thread_rng().gen_bool(0.05);
            if hit {
                let delay_ms = rand::thread_rng().gen_range(200..1500);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        Some(peer)
    }

    fn reachable(state: &NetworkState, from: ServerId, to: ServerId) -> bool {
        if from == to {
            return true;
        }
        if state.groups.is_empty() {
            return true;
        }
        for group in &state.groups {
            let has_from = group.contains(&from);
            let has_to = group.contains(&to);
            if has_from != has_to {
                return false;
            }
            if has_from && has_to {
                return true;
            }
        }
        // Neither endpoint named in any group: unaffected by the partition.
        true
    }
}

/// A peer's view of [`Network`] as server `from`.
pub struct NetworkClient {
    network: Arc<Network>,
    from: ServerId,
}

#[async_trait]
impl RaftClient for NetworkClient {
    async fn request_vote(
        &self,
        peer: ServerId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, ()> {
        match self.network.gate(self.from, peer).await {
            Some(target) => Ok(target.handle_request_vote(args).await),
            None => Err(()),
        }
    }

    async fn append_entries(
        &self,
        peer: ServerId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, ()> {
        match self.network.gate(self.from, peer).await {
            Some(target) => Ok(target.handle_append_entries(args).await),
            None => Err(()),
        }
    }

    async fn install_snapshot(
        &self,
        peer: ServerId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply, ()> {
        match self.network.gate(self.from, peer).await {
            Some(target) => Ok(target.handle_install_snapshot(args).await),
            None => Err(()),
        }
    }
}
