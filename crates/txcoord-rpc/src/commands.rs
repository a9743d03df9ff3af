// Command surface: named admin commands dispatched to the coordinator
// catalog, the local shard participant and the operation registry.
//
// A router's coordinateCommitTransaction wait is itself a registered
// operation, so killOp on it interrupts only that wait.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use txcoord_core::{ErrorCode, Status};
use txcoord_state::{
    CatalogStatus, CoordinatorCatalog, OperationRegistry, RecoveryService, ShardTransactionParticipant,
};

use crate::wire::{
    encode_body, into_reply, parse_body, CommitRequest, CoordinateCommitRequest, FindRequest,
    InsertRequest, KillOpRequest, TxnRequest,
};

pub const COORDINATE_COMMIT: &str = "coordinateCommitTransaction";
pub const PREPARE: &str = "prepareTransaction";
pub const COMMIT: &str = "commitTransaction";
pub const ABORT: &str = "abortTransaction";
pub const INSERT: &str = "insert";
pub const FIND: &str = "find";
pub const KILL_OP: &str = "killOp";
pub const CURRENT_OP: &str = "currentOp";
pub const SERVER_STATUS: &str = "serverStatus";
pub const STEP_DOWN: &str = "replSetStepDown";
pub const STEP_UP: &str = "replSetStepUp";

pub struct CommandSurface {
    recovery: Arc<RecoveryService>,
    participant: Arc<ShardTransactionParticipant>,
}

impl CommandSurface {
    pub fn new(recovery: Arc<RecoveryService>, participant: Arc<ShardTransactionParticipant>) -> Self {
        CommandSurface { recovery, participant }
    }

    pub fn catalog(&self) -> &Arc<CoordinatorCatalog> {
        self.recovery.catalog()
    }

    pub fn ops(&self) -> &OperationRegistry {
        &self.catalog().services().ops
    }

    pub fn participant(&self) -> &Arc<ShardTransactionParticipant> {
        &self.participant
    }

    /// Run `name` with `body` and build the reply envelope
    pub async fn run_command(&self, name: &str, body: Value) -> Value {
        let result = self.dispatch(name, body).await;
        if let Err(status) = &result {
            debug!("{} failed: {}", name, status);
        }
        into_reply(result)
    }

    async fn dispatch(&self, name: &str, body: Value) -> Result<Value, Status> {
        match name {
            COORDINATE_COMMIT => self.coordinate_commit(parse_body(name, body)?).await,
            PREPARE => {
                let request: TxnRequest = parse_body(name, body)?;
                let response = self.participant.prepare(&request.key())?;
                encode_body(name, &response)
            }
            COMMIT => {
                let request: CommitRequest = parse_body(name, body)?;
                let key = TxnRequest { lsid: request.lsid, txn_number: request.txn_number }.key();
                self.participant.commit(&key, request.commit_timestamp)?;
                Ok(Value::Null)
            }
            ABORT => {
                let request: TxnRequest = parse_body(name, body)?;
                self.participant.abort(&request.key())?;
                Ok(Value::Null)
            }
            INSERT => {
                let request: InsertRequest = parse_body(name, body)?;
                let key = TxnRequest { lsid: request.lsid, txn_number: request.txn_number }.key();
                let n = request.documents.len();
                for doc in request.documents {
                    self.participant.insert(&key, &request.ns, doc)?;
                }
                Ok(json!({ "n": n }))
            }
            FIND => {
                let request: FindRequest = parse_body(name, body)?;
                Ok(json!({ "documents": self.participant.find(&request.ns) }))
            }
            KILL_OP => {
                let request: KillOpRequest = parse_body(name, body)?;
                let killed = self.ops().kill_op(request.op);
                if killed {
                    info!("killOp {} delivered", request.op);
                } else {
                    warn!("killOp {} matched no running operation", request.op);
                }
                Ok(json!({ "info": if killed { "attempting to kill op" } else { "no such op" } }))
            }
            CURRENT_OP => Ok(self.current_op()),
            SERVER_STATUS => Ok(self.server_status()),
            STEP_DOWN => {
                let abandoned = self.recovery.on_step_down();
                Ok(json!({ "abandoned": abandoned }))
            }
            STEP_UP => {
                let report = self.recovery.on_become_primary().await?;
                Ok(json!({ "recovered": report.recovered.len(), "skipped": report.skipped.len() }))
            }
            other => Err(Status::new(
                ErrorCode::CommandNotFound,
                format!("no such command: '{}'", other),
            )),
        }
    }

    async fn coordinate_commit(&self, request: CoordinateCommitRequest) -> Result<Value, Status> {
        let key = TxnRequest { lsid: request.lsid, txn_number: request.txn_number }.key();
        let ctx = self.ops().register(None, COORDINATE_COMMIT, COORDINATE_COMMIT, None, Some(key));
        let decision = self
            .catalog()
            .coordinate_commit(key, request.participants, Some(ctx.token()))
            .await?;
        decision.to_command_result()?;
        Ok(json!({ "commitTimestamp": decision.commit_timestamp() }))
    }

    /// Registered operations followed by one entry per live coordinator
    pub fn current_op(&self) -> Value {
        let mut inprog: Vec<Value> = self
            .ops()
            .current_ops()
            .into_iter()
            .filter_map(|op| serde_json::to_value(op).ok())
            .collect();
        inprog.extend(
            self.catalog()
                .reports()
                .into_iter()
                .filter_map(|report| serde_json::to_value(report).ok()),
        );
        json!({ "inprog": inprog })
    }

    pub fn server_status(&self) -> Value {
        let catalog = self.catalog();
        let mut status = serde_json::to_value(catalog.services().metrics.snapshot())
            .unwrap_or_else(|_| json!({}));
        if let Value::Object(fields) = &mut status {
            let state = match catalog.status() {
                CatalogStatus::Active => "primary",
                CatalogStatus::Recovering => "recovering",
                CatalogStatus::SteppedDown => "secondary",
            };
            fields.insert(
                "coordinatorCatalog".to_string(),
                json!({ "state": state, "coordinators": catalog.len() }),
            );
        }
        status
    }
}
