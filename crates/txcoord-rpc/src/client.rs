// HTTP clients for the admin command endpoints
//
// HttpParticipantProxy is the coordinator's stub for a remote shard;
// AdminClient is the generic command runner used by routers and tooling.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

use txcoord_core::{CoordinatorKey, LogicalTimestamp, ShardId, Status};
use txcoord_state::{OperationContext, ParticipantProxy, PrepareResponse};

use crate::commands::{ABORT, COMMIT, PREPARE};
use crate::error::WireError;
use crate::wire::{parse_body, reply_to_result, CommitRequest, TxnRequest};

#[derive(Clone)]
pub struct AdminClient {
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WireError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(WireError::InvalidEndpoint(base_url.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(AdminClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a command. Err carries either a transport failure or the
    /// command's own error reply.
    pub async fn run_command<B: Serialize + ?Sized>(
        &self,
        command: &str,
        body: &B,
    ) -> Result<Value, WireError> {
        let url = format!("{}/admin/{}", self.base_url, command);
        trace!("POST {}", url);
        let reply: Value = self.http.post(&url).json(body).send().await?.json().await?;
        Ok(reply_to_result(reply)?)
    }

    pub async fn current_op(&self) -> Result<Value, WireError> {
        self.get("admin/currentOp").await
    }

    pub async fn server_status(&self) -> Result<Value, WireError> {
        self.get("admin/serverStatus").await
    }

    pub async fn health(&self) -> Result<Value, WireError> {
        self.get("health").await
    }

    async fn get(&self, path: &str) -> Result<Value, WireError> {
        let url = format!("{}/{}", self.base_url, path);
        let reply: Value = self.http.get(&url).send().await?.json().await?;
        Ok(reply_to_result(reply)?)
    }
}

/// ParticipantProxy speaking to a shard's admin endpoint
pub struct HttpParticipantProxy {
    shard: ShardId,
    client: AdminClient,
}

impl HttpParticipantProxy {
    pub fn new(shard: ShardId, base_url: &str, timeout: Duration) -> Result<Self, WireError> {
        Ok(HttpParticipantProxy {
            shard,
            client: AdminClient::new(base_url, timeout)?,
        })
    }

    async fn call<B: Serialize>(
        &self,
        ctx: &OperationContext,
        command: &str,
        body: &B,
    ) -> Result<Value, Status> {
        ctx.check_for_interrupt()?;
        self.client
            .run_command(command, body)
            .await
            .map_err(WireError::into_status)
    }
}

#[async_trait]
impl ParticipantProxy for HttpParticipantProxy {
    fn shard_id(&self) -> ShardId {
        self.shard.clone()
    }

    async fn prepare(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
    ) -> Result<PrepareResponse, Status> {
        let reply = self.call(ctx, PREPARE, &TxnRequest::from(key)).await?;
        parse_body(PREPARE, reply)
    }

    async fn commit(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
        commit_timestamp: LogicalTimestamp,
    ) -> Result<(), Status> {
        let body = CommitRequest {
            lsid: key.lsid,
            txn_number: key.txn_number,
            commit_timestamp,
        };
        self.call(ctx, COMMIT, &body).await.map(|_| ())
    }

    async fn abort(&self, ctx: &OperationContext, key: &CoordinatorKey) -> Result<(), Status> {
        self.call(ctx, ABORT, &TxnRequest::from(key)).await.map(|_| ())
    }
}
