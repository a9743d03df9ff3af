// Coordinator document - durable state of one coordinated transaction
//
// INVARIANTS:
// 1. participants is non-empty and fixed before any prepare is sent
// 2. Exactly one of {no decision, committed + commitTimestamp, aborted + abortReason}
// 3. The decision is written at most once and never changes kind

use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;

use crate::decision::{CommitDecision, CoordinatorDecision};
use crate::error::{ErrorCode, Status};
use crate::ids::{CoordinatorKey, ShardId};
use crate::timestamp::LogicalTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    #[serde(rename = "_id")]
    pub id: CoordinatorKey,

    pub participants: Vec<ShardId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<CommitDecision>,

    #[serde(rename = "commitTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<LogicalTimestamp>,

    #[serde(rename = "abortReason", default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<Status>,

    #[serde(rename = "affectedNamespaces", default, skip_serializing_if = "Vec::is_empty")]
    pub affected_namespaces: Vec<String>,
}

impl CoordinatorDocument {
    /// Document as first written, before any prepare is sent
    pub fn new(id: CoordinatorKey, participants: Vec<ShardId>) -> Result<Self, Status> {
        let doc = CoordinatorDocument {
            id,
            participants: dedup_participants(participants),
            decision: None,
            commit_timestamp: None,
            abort_reason: None,
            affected_namespaces: Vec::new(),
        };
        doc.validate()?;
        Ok(doc)
    }

    /// Reassemble the typed decision from the persisted fields
    pub fn decision(&self) -> Option<CoordinatorDecision> {
        match self.decision? {
            CommitDecision::Committed => Some(CoordinatorDecision::Committed {
                commit_timestamp: self.commit_timestamp?,
                affected_namespaces: self.affected_namespaces.clone(),
            }),
            CommitDecision::Aborted => Some(CoordinatorDecision::Aborted {
                abort_reason: self.abort_reason.clone()?,
            }),
        }
    }

    pub fn has_decision(&self) -> bool {
        self.decision.is_some()
    }

    /// Overwrite the decision fields. Callers check `matches` first.
    pub fn set_decision(&mut self, decision: &CoordinatorDecision) {
        match decision {
            CoordinatorDecision::Committed { commit_timestamp, affected_namespaces } => {
                self.decision = Some(CommitDecision::Committed);
                self.commit_timestamp = Some(*commit_timestamp);
                self.abort_reason = None;
                self.affected_namespaces = affected_namespaces.clone();
            }
            CoordinatorDecision::Aborted { abort_reason } => {
                self.decision = Some(CommitDecision::Aborted);
                self.commit_timestamp = None;
                self.abort_reason = Some(abort_reason.clone());
                self.affected_namespaces.clear();
            }
        }
    }

    /// Whether two documents name the same participant set
    pub fn same_participants(&self, other: &[ShardId]) -> bool {
        let mine: BTreeSet<&ShardId> = self.participants.iter().collect();
        let theirs: BTreeSet<&ShardId> = other.iter().collect();
        mine == theirs
    }

    pub fn validate(&self) -> Result<(), Status> {
        if self.participants.is_empty() {
            return Err(Status::new(
                ErrorCode::InvalidOptions,
                "coordinator document must list at least one participant",
            ));
        }
        match self.decision {
            None if self.commit_timestamp.is_some() || self.abort_reason.is_some() => {
                Err(Status::new(
                    ErrorCode::InternalError,
                    "decision fields present without a decision",
                ))
            }
            Some(CommitDecision::Committed) if self.commit_timestamp.is_none() => Err(Status::new(
                ErrorCode::InternalError,
                "commit decision without a commit timestamp",
            )),
            Some(CommitDecision::Aborted) if self.abort_reason.is_none() => Err(Status::new(
                ErrorCode::InternalError,
                "abort decision without an abort reason",
            )),
            _ => Ok(()),
        }
    }
}

/// Keep first occurrence order, drop repeats
fn dedup_participants(participants: Vec<ShardId>) -> Vec<ShardId> {
    let mut seen = BTreeSet::new();
    participants
        .into_iter()
        .filter(|shard| seen.insert(shard.clone()))
        .collect()
}
