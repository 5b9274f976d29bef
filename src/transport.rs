//! Transport abstraction between consensus peers, plus an in-process
//! implementation used by the test clusters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::error;

use crate::raft::node::RaftNode;
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::NodeId;

/// How a node reaches its peers. `None` means the call produced no reply,
/// for any reason (peer down, link cut, timeout); consensus treats all of
/// those the same way.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, target: NodeId, args: RequestVoteArgs)
        -> Option<RequestVoteReply>;

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Option<InstallSnapshotReply>;
}

struct NetInner {
    nodes: RwLock<HashMap<NodeId, Arc<RaftNode>>>,
    /// Unordered pairs whose link is cut, stored with the smaller id first.
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// An in-process message router connecting a set of nodes. Links can be cut
/// and restored at runtime to simulate partitions, and nodes can be removed
/// entirely to simulate crashes.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetInner>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                nodes: RwLock::new(HashMap::new()),
                severed: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// An endpoint speaking as `origin`. Created before the node exists so
    /// the node can be built with its transport in hand.
    pub fn endpoint(&self, origin: NodeId) -> LocalEndpoint {
        LocalEndpoint {
            origin,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Make a node reachable. Until this call its endpoint can send but
    /// nobody can reach it.
    pub fn register(&self, node: Arc<RaftNode>) {
        self.inner.nodes.write().unwrap().insert(node.id(), node);
    }

    /// Remove a node from the network, as if it crashed.
    pub fn deregister(&self, id: NodeId) {
        self.inner.nodes.write().unwrap().remove(&id);
    }

    /// Cut the link between two nodes, both directions.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        self.inner.severed.write().unwrap().insert(link(a, b));
    }

    /// Restore the link between two nodes.
    pub fn reconnect(&self, a: NodeId, b: NodeId) {
        self.inner.severed.write().unwrap().remove(&link(a, b));
    }

    /// Cut every link touching `id`.
    pub fn isolate(&self, id: NodeId) {
        let peers: Vec<NodeId> = {
            let nodes = self.inner.nodes.read().unwrap();
            nodes.keys().copied().filter(|&p| p != id).collect()
        };
        let mut severed = self.inner.severed.write().unwrap();
        for peer in peers {
            severed.insert(link(id, peer));
        }
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.inner.severed.write().unwrap().clear();
    }
}

/// One node's view of the [`LocalNetwork`].
pub struct LocalEndpoint {
    origin: NodeId,
    inner: Arc<NetInner>,
}

impl LocalEndpoint {
    /// The target node, if it is up and the link is intact. The lock guard
    /// never crosses an await point.
    fn route(&self, target: NodeId) -> Option<Arc<RaftNode>> {
        if self
            .inner
            .severed
            .read()
            .unwrap()
            .contains(&link(self.origin, target))
        {
            return None;
        }
        self.inner.nodes.read().unwrap().get(&target).cloned()
    }
}

#[async_trait]
impl RaftTransport for LocalEndpoint {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Option<RequestVoteReply> {
        let node = self.route(target)?;
        match node.handle_request_vote(args).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!(target, error = %e, "RequestVote handler failed");
                None
            }
        }
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply> {
        let node = self.route(target)?;
        match node.handle_append_entries(args).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!(target, error = %e, "AppendEntries handler failed");
                None
            }
        }
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Option<InstallSnapshotReply> {
        let node = self.route(target)?;
        match node.handle_install_snapshot(args).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                error!(target, error = %e, "InstallSnapshot handler failed");
                None
            }
        }
    }
}
