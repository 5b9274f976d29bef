use crate::raft::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Node has been shut down")]
    Stopped,

    #[error("Snapshot index {index} is not covered by applied index {last_applied}")]
    InvalidSnapshotIndex { index: u64, last_applied: u64 },

    /// Durable storage failed. This is the one fatal class: continuing after
    /// a failed flush would break the durability guarantees that vote grants
    /// and log acceptance depend on.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
