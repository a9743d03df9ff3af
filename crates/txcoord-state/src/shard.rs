// In-memory shard transaction participant and its in-process proxy
//
// Models the per-shard transaction subsystem the coordinator talks to:
// statements buffer writes under (lsid, txnNumber); prepare freezes them at
// a shard-clock timestamp; commit makes them visible; abort discards them.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, info};

use txcoord_core::{CoordinatorKey, ErrorCode, LogicalTimestamp, ShardId, Status};

use crate::op_context::OperationContext;
use crate::participant::{ParticipantProxy, PrepareResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnPhase {
    InProgress,
    Prepared(LogicalTimestamp),
    Committed(LogicalTimestamp),
    Aborted,
}

#[derive(Debug, Clone)]
struct TxnRecord {
    phase: TxnPhase,
    writes: Vec<(String, Value)>,
}

struct ParticipantState {
    clock: LogicalTimestamp,
    transactions: HashMap<CoordinatorKey, TxnRecord>,
    collections: BTreeMap<String, Vec<Value>>,
}

pub struct ShardTransactionParticipant {
    shard: ShardId,
    state: Mutex<ParticipantState>,
}

impl ShardTransactionParticipant {
    pub fn new(shard: ShardId) -> Self {
        Self::with_clock(shard, LogicalTimestamp::new(1, 0))
    }

    /// Start the shard clock at `clock`; prepare timestamps are strictly later
    pub fn with_clock(shard: ShardId, clock: LogicalTimestamp) -> Self {
        ShardTransactionParticipant {
            shard,
            state: Mutex::new(ParticipantState {
                clock,
                transactions: HashMap::new(),
                collections: BTreeMap::new(),
            }),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard
    }

    pub fn clock(&self) -> LogicalTimestamp {
        self.state.lock().clock
    }

    fn no_such_transaction(&self, key: &CoordinatorKey) -> Status {
        Status::no_such_transaction(format!(
            "transaction {} has been aborted or does not exist on {}",
            key, self.shard
        ))
    }

    /// Buffer an insert inside transaction `key`, starting it if needed
    pub fn insert(&self, key: &CoordinatorKey, namespace: &str, doc: Value) -> Result<(), Status> {
        let mut state = self.state.lock();
        let record = state.transactions.entry(*key).or_insert_with(|| TxnRecord {
            phase: TxnPhase::InProgress,
            writes: Vec::new(),
        });
        match record.phase {
            TxnPhase::InProgress => {
                record.writes.push((namespace.to_string(), doc));
                Ok(())
            }
            TxnPhase::Prepared(_) => Err(Status::new(
                ErrorCode::PreparedTransactionInProgress,
                format!("transaction {} is prepared on {}", key, self.shard),
            )),
            TxnPhase::Committed(_) => Err(Status::new(
                ErrorCode::TransactionCommitted,
                format!("transaction {} already committed on {}", key, self.shard),
            )),
            TxnPhase::Aborted => Err(self.no_such_transaction(key)),
        }
    }

    /// Prepare is idempotent: a prepared transaction reports its original timestamp
    pub fn prepare(&self, key: &CoordinatorKey) -> Result<PrepareResponse, Status> {
        let mut state = self.state.lock();
        let next = state.clock.next();
        let record = match state.transactions.get_mut(key) {
            Some(record) => record,
            None => return Err(self.no_such_transaction(key)),
        };
        let namespaces: BTreeSet<String> = record.writes.iter().map(|(ns, _)| ns.clone()).collect();

        let timestamp = match record.phase {
            TxnPhase::InProgress => {
                record.phase = TxnPhase::Prepared(next);
                next
            }
            TxnPhase::Prepared(timestamp) => timestamp,
            TxnPhase::Committed(_) => {
                return Err(Status::new(
                    ErrorCode::TransactionCommitted,
                    format!("transaction {} already committed on {}", key, self.shard),
                ))
            }
            TxnPhase::Aborted => return Err(self.no_such_transaction(key)),
        };
        state.clock = state.clock.max(timestamp);

        debug!("{} prepared {} at {}", self.shard, key, timestamp);
        Ok(PrepareResponse {
            prepare_timestamp: Some(timestamp),
            affected_namespaces: namespaces.into_iter().collect(),
        })
    }

    pub fn commit(&self, key: &CoordinatorKey, commit_timestamp: LogicalTimestamp) -> Result<(), Status> {
        let mut state = self.state.lock();
        let record = match state.transactions.get_mut(key) {
            Some(record) => record,
            None => return Err(self.no_such_transaction(key)),
        };

        let writes = match record.phase {
            TxnPhase::Prepared(prepare_timestamp) => {
                if commit_timestamp < prepare_timestamp {
                    return Err(Status::new(
                        ErrorCode::InvalidOptions,
                        format!(
                            "commit timestamp {} is before prepare timestamp {}",
                            commit_timestamp, prepare_timestamp
                        ),
                    ));
                }
                record.phase = TxnPhase::Committed(commit_timestamp);
                std::mem::take(&mut record.writes)
            }
            TxnPhase::Committed(_) => return Ok(()),
            TxnPhase::InProgress => {
                return Err(Status::new(
                    ErrorCode::InvalidOptions,
                    format!("transaction {} must be prepared before commit", key),
                ))
            }
            TxnPhase::Aborted => return Err(self.no_such_transaction(key)),
        };

        for (namespace, doc) in writes {
            state.collections.entry(namespace).or_default().push(doc);
        }
        state.clock = state.clock.max(commit_timestamp);
        info!("{} committed {} at {}", self.shard, key, commit_timestamp);
        Ok(())
    }

    /// Abort; NoSuchTransaction if unknown or already aborted
    pub fn abort(&self, key: &CoordinatorKey) -> Result<(), Status> {
        let mut state = self.state.lock();
        let record = match state.transactions.get_mut(key) {
            Some(record) => record,
            None => return Err(self.no_such_transaction(key)),
        };
        match record.phase {
            TxnPhase::InProgress | TxnPhase::Prepared(_) => {
                record.phase = TxnPhase::Aborted;
                record.writes.clear();
                info!("{} aborted {}", self.shard, key);
                Ok(())
            }
            TxnPhase::Aborted => Err(self.no_such_transaction(key)),
            TxnPhase::Committed(_) => Err(Status::new(
                ErrorCode::TransactionCommitted,
                format!("transaction {} already committed on {}", key, self.shard),
            )),
        }
    }

    /// Committed documents of `namespace`
    pub fn find(&self, namespace: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_prepared(&self, key: &CoordinatorKey) -> bool {
        matches!(
            self.state.lock().transactions.get(key).map(|r| r.phase),
            Some(TxnPhase::Prepared(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantCommand {
    Prepare,
    Commit,
    Abort,
}

impl ParticipantCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantCommand::Prepare => "prepareTransaction",
            ParticipantCommand::Commit => "commitTransaction",
            ParticipantCommand::Abort => "abortTransaction",
        }
    }
}

/// Scripted misbehaviour for the next call of a command
#[derive(Debug, Clone)]
pub enum InjectedFault {
    /// Reply with this error without touching the participant
    Fail(Status),
    /// Never reply; only killOp, timeout or shutdown ends the call
    Stall,
    /// Prepare reports ok but omits the prepare timestamp
    OmitPrepareTimestamp,
}

#[derive(Default)]
struct CallCounters {
    prepare: AtomicU64,
    commit: AtomicU64,
    abort: AtomicU64,
}

/// ParticipantProxy that calls a participant in the same process
pub struct LocalParticipantProxy {
    participant: Arc<ShardTransactionParticipant>,
    faults: Mutex<HashMap<ParticipantCommand, VecDeque<InjectedFault>>>,
    calls: CallCounters,
}

impl LocalParticipantProxy {
    pub fn new(participant: Arc<ShardTransactionParticipant>) -> Self {
        LocalParticipantProxy {
            participant,
            faults: Mutex::new(HashMap::new()),
            calls: CallCounters::default(),
        }
    }

    pub fn participant(&self) -> &Arc<ShardTransactionParticipant> {
        &self.participant
    }

    /// Queue a fault for the next un-faulted call of `command`
    pub fn inject(&self, command: ParticipantCommand, fault: InjectedFault) {
        self.faults.lock().entry(command).or_default().push_back(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Calls received for `command`, faulted ones included
    pub fn calls(&self, command: ParticipantCommand) -> u64 {
        self.counter(command).load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls(ParticipantCommand::Prepare)
            + self.calls(ParticipantCommand::Commit)
            + self.calls(ParticipantCommand::Abort)
    }

    fn counter(&self, command: ParticipantCommand) -> &AtomicU64 {
        match command {
            ParticipantCommand::Prepare => &self.calls.prepare,
            ParticipantCommand::Commit => &self.calls.commit,
            ParticipantCommand::Abort => &self.calls.abort,
        }
    }

    /// Count the call and pop its fault, if any
    fn begin(&self, command: ParticipantCommand) -> Option<InjectedFault> {
        self.counter(command).fetch_add(1, Ordering::SeqCst);
        self.faults.lock().get_mut(&command).and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl ParticipantProxy for LocalParticipantProxy {
    fn shard_id(&self) -> ShardId {
        self.participant.shard_id().clone()
    }

    async fn prepare(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
    ) -> Result<PrepareResponse, Status> {
        match self.begin(ParticipantCommand::Prepare) {
            Some(InjectedFault::Fail(status)) => Err(status),
            Some(InjectedFault::Stall) => stall(ctx).await,
            Some(InjectedFault::OmitPrepareTimestamp) => {
                let mut response = self.participant.prepare(key)?;
                response.prepare_timestamp = None;
                Ok(response)
            }
            None => self.participant.prepare(key),
        }
    }

    async fn commit(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
        commit_timestamp: LogicalTimestamp,
    ) -> Result<(), Status> {
        match self.begin(ParticipantCommand::Commit) {
            Some(InjectedFault::Fail(status)) => Err(status),
            Some(InjectedFault::Stall) => stall(ctx).await,
            Some(InjectedFault::OmitPrepareTimestamp) | None => {
                self.participant.commit(key, commit_timestamp)
            }
        }
    }

    async fn abort(&self, ctx: &OperationContext, key: &CoordinatorKey) -> Result<(), Status> {
        match self.begin(ParticipantCommand::Abort) {
            Some(InjectedFault::Fail(status)) => Err(status),
            Some(InjectedFault::Stall) => stall(ctx).await,
            Some(InjectedFault::OmitPrepareTimestamp) | None => self.participant.abort(key),
        }
    }
}

async fn stall<T>(ctx: &OperationContext) -> Result<T, Status> {
    ctx.token().cancelled().await;
    Err(Status::interrupted(format!("operation {} was killed while stalled", ctx.opid())))
}
