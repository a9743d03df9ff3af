// Killable operation contexts
//
// Every participant RPC attempt and every router wait on a coordinator runs
// under an OperationContext registered here. killOp cancels exactly one
// context; the owner observes it as an Interrupted status and decides what
// to do (coordinator RPCs retry with a fresh context, router waits return).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use log::debug;

use txcoord_core::{CoordinatorKey, OpId, ShardId, Status};

/// currentOp entry for one registered operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub opid: OpId,
    pub desc: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ShardId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<CoordinatorKey>,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
}

struct RegisteredOp {
    info: OperationInfo,
    token: CancellationToken,
}

/// Process-wide table of killable operations
#[derive(Clone, Default)]
pub struct OperationRegistry {
    ops: Arc<DashMap<OpId, RegisteredOp>>,
    next_id: Arc<AtomicU64>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation. Cancelling `parent` also cancels it.
    pub fn register(
        &self,
        parent: Option<&CancellationToken>,
        desc: impl Into<String>,
        command: impl Into<String>,
        target: Option<ShardId>,
        key: Option<CoordinatorKey>,
    ) -> OperationContext {
        let opid = OpId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let info = OperationInfo {
            opid,
            desc: desc.into(),
            command: command.into(),
            target,
            key,
            start_time: Utc::now(),
        };

        self.ops.insert(opid, RegisteredOp { info: info.clone(), token: token.clone() });

        OperationContext {
            info,
            token,
            registry: self.clone(),
        }
    }

    /// Cancel one operation. Returns false if no such operation is registered.
    pub fn kill_op(&self, opid: OpId) -> bool {
        match self.ops.get(&opid) {
            Some(op) => {
                debug!("killOp {} ({} {})", opid, op.info.desc, op.info.command);
                op.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of registered operations ordered by opid
    pub fn current_ops(&self) -> Vec<OperationInfo> {
        let mut ops: Vec<OperationInfo> = self.ops.iter().map(|op| op.info.clone()).collect();
        ops.sort_by_key(|op| op.opid);
        ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn deregister(&self, opid: OpId) {
        self.ops.remove(&opid);
    }
}

/// Handle for one in-flight operation; deregisters itself on drop
pub struct OperationContext {
    info: OperationInfo,
    token: CancellationToken,
    registry: OperationRegistry,
}

impl OperationContext {
    pub fn opid(&self) -> OpId {
        self.info.opid
    }

    pub fn info(&self) -> &OperationInfo {
        &self.info
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_for_interrupt(&self) -> Result<(), Status> {
        if self.token.is_cancelled() {
            Err(self.interrupted_status())
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or this operation is killed
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.interrupted_status()),
            result = fut => result,
        }
    }

    fn interrupted_status(&self) -> Status {
        Status::interrupted(format!(
            "operation {} ({}) was interrupted",
            self.info.opid, self.info.command
        ))
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.registry.deregister(self.info.opid);
    }
}
