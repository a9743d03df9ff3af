// Coordinator identity types
//
// INVARIANTS:
// 1. A coordinator is identified by (lsid, txnNumber) and nothing else
// 2. txnNumber is monotonically increasing within one lsid
// 3. Keys order by lsid first, then txnNumber (stable scan order for recovery)

use serde::{Serialize, Deserialize};
use std::fmt;
use uuid::Uuid;

/// Logical session identifier scoping a sequence of transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalSessionId(pub Uuid);

impl LogicalSessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        LogicalSessionId(Uuid::new_v4())
    }

    /// Short hex form used in log lines
    pub fn as_hex(&self) -> String {
        hex::encode(&self.0.as_bytes()[..8])
    }
}

impl fmt::Display for LogicalSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction number within a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnNumber(pub i64);

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shard identifier (participant or coordinator host)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        ShardId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        ShardId(name.to_string())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one coordinated transaction.
///
/// Serialized as the `_id` of the coordinator document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoordinatorKey {
    pub lsid: LogicalSessionId,
    #[serde(rename = "txnNumber")]
    pub txn_number: TxnNumber,
}

impl CoordinatorKey {
    pub fn new(lsid: LogicalSessionId, txn_number: TxnNumber) -> Self {
        CoordinatorKey { lsid, txn_number }
    }
}

impl fmt::Display for CoordinatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lsid.as_hex(), self.txn_number)
    }
}

/// Operation id assigned to every killable in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
