use crate::raft::NodeId;

/// Configuration for a single consensus node.
///
/// The peer set is static for the lifetime of the cluster; membership
/// changes are out of scope.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    /// Ids of every other node in the cluster (self excluded).
    pub peers: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on entries shipped in a single AppendEntries.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 128,
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId) -> Self {
        self.peers.push(node_id);
        self
    }

    /// Total number of voting members, self included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Votes required to win an election or commit an entry.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}
