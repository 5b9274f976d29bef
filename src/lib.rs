//! raftlet: an embeddable replicated log.
//!
//! A cluster of [`RaftNode`]s agrees on an ordered sequence of opaque
//! commands and feeds them, exactly once and in order, to each member's
//! state machine over an apply channel. Leadership, replication, durability,
//! and snapshot-based log compaction are handled internally; the hosting
//! service supplies a [`transport::RaftTransport`], a [`storage::Storage`],
//! and a receiver for [`ApplyMsg`]s.

pub mod config;
pub mod error;
pub mod raft;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::{ApplyMsg, LogIndex, NodeId, RaftNode, Term};
pub use storage::{FileStorage, MemoryStorage, SharedMemoryStorage, Storage};
pub use transport::{LocalNetwork, RaftTransport};
