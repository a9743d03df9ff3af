// === Identity ===
pub mod ids;
pub mod timestamp;

// === Coordinator Document Model ===
pub mod decision;
pub mod document;

// === Errors and Configuration ===
pub mod error;
pub mod config;

// === Re-exports for broader ecosystem access ===
pub use ids::{CoordinatorKey, LogicalSessionId, OpId, ShardId, TxnNumber};
pub use timestamp::LogicalTimestamp;
pub use decision::{CommitDecision, CoordinatorDecision};
pub use document::CoordinatorDocument;
pub use error::{ErrorCode, Status};
pub use config::{ConfigError, CoordinatorConfig, NodeConfig};
