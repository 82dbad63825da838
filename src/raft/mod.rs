pub mod consensus;
pub mod persistence;
pub mod rpc;
pub mod types;

pub use consensus::ConsensusHandle;
pub use types::{Command, LogEntry, NodeId, Role};
