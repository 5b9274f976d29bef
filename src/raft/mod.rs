//! The consensus engine: leader election, log replication, snapshots, and
//! the apply pipeline.

pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

/// Identifies a cluster member. Ids are assigned by the operator and never
/// reused.
pub type NodeId = u64;

/// A leadership epoch. Terms only increase.
pub type Term = u64;

/// Position in the replicated log, 1-based. Index 0 means "before the first
/// entry".
pub type LogIndex = u64;

pub use log::{LogEntry, RaftLog};
pub use node::{ApplyMsg, RaftNode};
pub use state::{RaftRole, RaftState};
