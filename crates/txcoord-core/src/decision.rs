use serde::{Serialize, Deserialize};
use std::fmt;

use crate::error::{ErrorCode, Status};
use crate::timestamp::LogicalTimestamp;

/// Persisted decision tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitDecision {
    Committed,
    Aborted,
}

/// Final outcome of a coordinated transaction
///
/// SAFETY: written exactly once per coordinator; never changes kind afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorDecision {
    Committed {
        commit_timestamp: LogicalTimestamp,
        affected_namespaces: Vec<String>,
    },
    Aborted {
        abort_reason: Status,
    },
}

impl CoordinatorDecision {
    pub fn commit(commit_timestamp: LogicalTimestamp) -> Self {
        CoordinatorDecision::Committed {
            commit_timestamp,
            affected_namespaces: Vec::new(),
        }
    }

    pub fn abort(abort_reason: Status) -> Self {
        CoordinatorDecision::Aborted { abort_reason }
    }

    pub fn kind(&self) -> CommitDecision {
        match self {
            CoordinatorDecision::Committed { .. } => CommitDecision::Committed,
            CoordinatorDecision::Aborted { .. } => CommitDecision::Aborted,
        }
    }

    pub fn is_commit(&self) -> bool {
        self.kind() == CommitDecision::Committed
    }

    pub fn commit_timestamp(&self) -> Option<LogicalTimestamp> {
        match self {
            CoordinatorDecision::Committed { commit_timestamp, .. } => Some(*commit_timestamp),
            CoordinatorDecision::Aborted { .. } => None,
        }
    }

    /// Whether re-writing `other` over `self` is a no-op.
    ///
    /// Two abort decisions match regardless of reason: the reason is
    /// informational and may differ between a first attempt and a retry.
    pub fn matches(&self, other: &CoordinatorDecision) -> bool {
        match (self, other) {
            (
                CoordinatorDecision::Committed { commit_timestamp: a, .. },
                CoordinatorDecision::Committed { commit_timestamp: b, .. },
            ) => a == b,
            (CoordinatorDecision::Aborted { .. }, CoordinatorDecision::Aborted { .. }) => true,
            _ => false,
        }
    }

    /// Reply a router sees for this decision
    pub fn to_command_result(&self) -> Result<(), Status> {
        match self {
            CoordinatorDecision::Committed { .. } => Ok(()),
            CoordinatorDecision::Aborted { abort_reason } => Err(Status::new(
                ErrorCode::NoSuchTransaction,
                format!("Transaction was aborted: {}", abort_reason),
            )),
        }
    }
}

impl fmt::Display for CoordinatorDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorDecision::Committed { commit_timestamp, .. } => {
                write!(f, "commit at {}", commit_timestamp)
            }
            CoordinatorDecision::Aborted { abort_reason } => write!(f, "abort ({})", abort_reason),
        }
    }
}
