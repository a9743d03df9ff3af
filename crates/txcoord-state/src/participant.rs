// Participant shard contract and the retry drivers used by the coordinator
//
// INVARIANTS:
// 1. Every attempt runs under its own OperationContext (killOp targets one attempt)
// 2. Transient failures are retried indefinitely with exponential backoff
// 3. Authoritative prepare errors are votes to abort and are never retried
// 4. TransactionCommitted on prepare is never a vote to abort
// 5. A decision is re-sent until acknowledged, the coordinator steps down,
//    or the participant answers with an authoritative error

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info};

use txcoord_core::{
    CoordinatorConfig, CoordinatorDecision, CoordinatorKey, ErrorCode, LogicalTimestamp, ShardId,
    Status,
};

use crate::op_context::{OperationContext, OperationRegistry};

pub const COORDINATOR_OP_DESC: &str = "TransactionCoordinator";

/// Successful prepareTransaction reply
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrepareResponse {
    #[serde(rename = "prepareTimestamp", default, skip_serializing_if = "Option::is_none")]
    pub prepare_timestamp: Option<LogicalTimestamp>,

    #[serde(rename = "affectedNamespaces", default)]
    pub affected_namespaces: Vec<String>,
}

impl PrepareResponse {
    pub fn prepared_at(timestamp: LogicalTimestamp) -> Self {
        PrepareResponse {
            prepare_timestamp: Some(timestamp),
            affected_namespaces: Vec::new(),
        }
    }
}

/// RPC stub for one participant shard
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParticipantProxy: Send + Sync {
    fn shard_id(&self) -> ShardId;

    async fn prepare(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
    ) -> Result<PrepareResponse, Status>;

    async fn commit(
        &self,
        ctx: &OperationContext,
        key: &CoordinatorKey,
        commit_timestamp: LogicalTimestamp,
    ) -> Result<(), Status>;

    async fn abort(&self, ctx: &OperationContext, key: &CoordinatorKey) -> Result<(), Status>;
}

/// Resolves shard ids to proxies
pub trait ShardRegistry: Send + Sync {
    fn proxy(&self, shard: &ShardId) -> Option<Arc<dyn ParticipantProxy>>;

    fn contains(&self, shard: &ShardId) -> bool {
        self.proxy(shard).is_some()
    }
}

/// Fixed shard map built at startup
#[derive(Default, Clone)]
pub struct StaticShardRegistry {
    proxies: HashMap<ShardId, Arc<dyn ParticipantProxy>>,
}

impl StaticShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ParticipantProxy>) -> Self {
        self.add(proxy);
        self
    }

    pub fn add(&mut self, proxy: Arc<dyn ParticipantProxy>) {
        self.proxies.insert(proxy.shard_id(), proxy);
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.proxies.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ShardRegistry for StaticShardRegistry {
    fn proxy(&self, shard: &ShardId) -> Option<Arc<dyn ParticipantProxy>> {
        self.proxies.get(shard).cloned()
    }
}

/// A participant's answer to prepare, after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantVote {
    Prepared {
        timestamp: LogicalTimestamp,
        affected_namespaces: Vec<String>,
    },
    VotedAbort {
        reason: Status,
    },
    /// The participant already committed this transaction under an earlier
    /// coordination whose document is gone
    AlreadyCommitted {
        reason: Status,
    },
    TransientFailure {
        reason: Status,
    },
}

impl ParticipantVote {
    pub fn classify(result: Result<PrepareResponse, Status>) -> Self {
        match result {
            Ok(PrepareResponse { prepare_timestamp: Some(timestamp), affected_namespaces }) => {
                ParticipantVote::Prepared { timestamp, affected_namespaces }
            }
            Ok(PrepareResponse { prepare_timestamp: None, .. }) => ParticipantVote::VotedAbort {
                reason: Status::new(
                    ErrorCode::InvalidPrepareResponse,
                    "prepare succeeded without a prepareTimestamp",
                ),
            },
            Err(reason) if reason.code == ErrorCode::TransactionCommitted => {
                ParticipantVote::AlreadyCommitted { reason }
            }
            Err(reason) if reason.code.is_vote_abort() => ParticipantVote::VotedAbort { reason },
            Err(reason) => ParticipantVote::TransientFailure { reason },
        }
    }
}

/// Everything a retry loop needs besides the shard and the key
#[derive(Clone)]
pub struct RetryEnv {
    pub shards: Arc<dyn ShardRegistry>,
    pub ops: OperationRegistry,
    pub config: CoordinatorConfig,
    /// Cancelled when the owning coordinator steps down
    pub shutdown: CancellationToken,
}

impl RetryEnv {
    fn attempt_context(&self, command: &str, shard: &ShardId, key: &CoordinatorKey) -> OperationContext {
        self.ops.register(
            Some(&self.shutdown),
            COORDINATOR_OP_DESC,
            command,
            Some(shard.clone()),
            Some(*key),
        )
    }

    /// Sleep out the backoff. Err if the coordinator stepped down meanwhile.
    async fn backoff(&self, attempt: u32, stop: Option<&CancellationToken>) -> Result<bool, Status> {
        let delay = self.config.backoff_for_attempt(attempt);
        let stop_wait = async {
            match stop {
                Some(token) => token.cancelled().await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Status::stepping_down()),
            _ = stop_wait => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, Status>
    where
        F: std::future::Future<Output = Result<T, Status>>,
    {
        let timeout = self.config.rpc_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Status::new(
                ErrorCode::NetworkTimeout,
                format!("no reply within {:?}", timeout),
            )),
        }
    }
}

fn reached_abort_decision() -> Status {
    Status::new(
        ErrorCode::TransactionCoordinatorReachedAbortDecision,
        "Received abort decision from another participant",
    )
}

/// Send prepareTransaction to one shard until it votes.
///
/// Returns `Prepared`, `AlreadyCommitted` or `VotedAbort`. Cancelling `abort_signal` stops
/// outstanding retries with a `TransactionCoordinatorReachedAbortDecision`
/// vote. Err only when the coordinator is stepping down.
pub async fn send_prepare_to_shard(
    env: &RetryEnv,
    shard: &ShardId,
    key: &CoordinatorKey,
    abort_signal: &CancellationToken,
) -> Result<ParticipantVote, Status> {
    let mut attempt: u32 = 0;
    loop {
        if env.shutdown.is_cancelled() {
            return Err(Status::stepping_down());
        }
        if abort_signal.is_cancelled() {
            return Ok(ParticipantVote::VotedAbort { reason: reached_abort_decision() });
        }

        let vote = match env.shards.proxy(shard) {
            Some(proxy) => {
                let ctx = env.attempt_context("prepareTransaction", shard, key);
                let result = tokio::select! {
                    biased;
                    _ = env.shutdown.cancelled() => return Err(Status::stepping_down()),
                    _ = abort_signal.cancelled() => {
                        return Ok(ParticipantVote::VotedAbort { reason: reached_abort_decision() });
                    }
                    result = ctx.run(env.with_timeout(proxy.prepare(&ctx, key))) => result,
                };
                ParticipantVote::classify(result)
            }
            None => ParticipantVote::VotedAbort {
                reason: Status::new(
                    ErrorCode::InvalidOptions,
                    format!("shard {} is not part of the cluster", shard),
                ),
            },
        };

        match vote {
            ParticipantVote::Prepared { timestamp, .. } => {
                debug!("{} prepared transaction {} at {}", shard, key, timestamp);
                return Ok(vote);
            }
            ParticipantVote::VotedAbort { ref reason } => {
                info!("{} voted to abort transaction {}: {}", shard, key, reason);
                return Ok(vote);
            }
            ParticipantVote::AlreadyCommitted { ref reason } => {
                info!("{} reports transaction {} already committed: {}", shard, key, reason);
                return Ok(vote);
            }
            ParticipantVote::TransientFailure { reason } => {
                debug!(
                    "prepare of {} on {} failed with retriable error, attempt {}: {}",
                    key, shard, attempt, reason
                );
                if !env.backoff(attempt, Some(abort_signal)).await? {
                    return Ok(ParticipantVote::VotedAbort { reason: reached_abort_decision() });
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Deliver the decision to one shard until it acknowledges.
///
/// `NoSuchTransaction` (and `TransactionCommitted` for a commit) mean the
/// participant is already in the decided end state and count as
/// acknowledgement. Transient errors are re-sent. Any other error means the
/// participant cannot reach the decided state and is returned.
pub async fn send_decision_to_shard(
    env: &RetryEnv,
    shard: &ShardId,
    key: &CoordinatorKey,
    decision: &CoordinatorDecision,
) -> Result<(), Status> {
    let command = if decision.is_commit() { "commitTransaction" } else { "abortTransaction" };
    let mut attempt: u32 = 0;
    loop {
        if env.shutdown.is_cancelled() {
            return Err(Status::stepping_down());
        }

        let result = match env.shards.proxy(shard) {
            Some(proxy) => {
                let ctx = env.attempt_context(command, shard, key);
                let rpc = async {
                    match decision {
                        CoordinatorDecision::Committed { commit_timestamp, .. } => {
                            proxy.commit(&ctx, key, *commit_timestamp).await
                        }
                        CoordinatorDecision::Aborted { .. } => proxy.abort(&ctx, key).await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = env.shutdown.cancelled() => return Err(Status::stepping_down()),
                    result = ctx.run(env.with_timeout(rpc)) => result,
                }
            }
            None => Err(Status::new(
                ErrorCode::HostUnreachable,
                format!("shard {} is not part of the cluster", shard),
            )),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(status) if status.code == ErrorCode::NoSuchTransaction => return Ok(()),
            Err(status)
                if decision.is_commit() && status.code == ErrorCode::TransactionCommitted =>
            {
                return Ok(())
            }
            Err(status) if status.is_retriable() => {
                debug!(
                    "{} of {} on {} failed with retriable error, attempt {}: {}",
                    command, key, shard, attempt, status
                );
            }
            Err(status) => {
                error!(
                    "invariant violated: {} of {} on {} rejected a durable decision ({}): {}",
                    command, key, shard, decision, status
                );
                return Err(status);
            }
        }

        env.backoff(attempt, None).await?;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::time::Duration;
    use txcoord_core::{LogicalSessionId, TxnNumber};

    fn key() -> CoordinatorKey {
        CoordinatorKey::new(LogicalSessionId::generate(), TxnNumber(3))
    }

    fn env_with(proxy: MockParticipantProxy) -> RetryEnv {
        let registry = StaticShardRegistry::new().with_proxy(Arc::new(proxy));
        RetryEnv {
            shards: Arc::new(registry),
            ops: OperationRegistry::new(),
            config: CoordinatorConfig {
                retry_initial_backoff_ms: 1,
                retry_max_backoff_ms: 2,
                ..CoordinatorConfig::default()
            },
            shutdown: CancellationToken::new(),
        }
    }

    fn mock_for(shard: &str) -> MockParticipantProxy {
        let mut proxy = MockParticipantProxy::new();
        proxy.expect_shard_id().return_const(ShardId::from(shard));
        proxy
    }

    #[test]
    fn test_classify_votes() {
        let ts = LogicalTimestamp::new(10, 1);
        assert!(matches!(
            ParticipantVote::classify(Ok(PrepareResponse::prepared_at(ts))),
            ParticipantVote::Prepared { timestamp, .. } if timestamp == ts
        ));
        assert!(matches!(
            ParticipantVote::classify(Ok(PrepareResponse::default())),
            ParticipantVote::VotedAbort { reason } if reason.code == ErrorCode::InvalidPrepareResponse
        ));
        assert!(matches!(
            ParticipantVote::classify(Err(Status::no_such_transaction("gone"))),
            ParticipantVote::VotedAbort { .. }
        ));
        assert!(matches!(
            ParticipantVote::classify(Err(Status::new(ErrorCode::HostUnreachable, "down"))),
            ParticipantVote::TransientFailure { .. }
        ));
    }

    #[tokio::test]
    async fn test_prepare_retries_transient_errors_then_succeeds() {
        let mut proxy = mock_for("shard0");
        let mut seq = Sequence::new();
        proxy
            .expect_prepare()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Status::new(ErrorCode::HostUnreachable, "connection reset")));
        proxy
            .expect_prepare()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(PrepareResponse::prepared_at(LogicalTimestamp::new(7, 2))));

        let env = env_with(proxy);
        let vote = send_prepare_to_shard(&env, &"shard0".into(), &key(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            vote,
            ParticipantVote::Prepared {
                timestamp: LogicalTimestamp::new(7, 2),
                affected_namespaces: vec![],
            }
        );
        assert!(env.ops.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_does_not_retry_vote_to_abort() {
        let mut proxy = mock_for("shard0");
        proxy
            .expect_prepare()
            .times(1)
            .returning(|_, _| Err(Status::no_such_transaction("aborted locally")));

        let env = env_with(proxy);
        let vote = send_prepare_to_shard(&env, &"shard0".into(), &key(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            vote,
            ParticipantVote::VotedAbort { reason } if reason.code == ErrorCode::NoSuchTransaction
        ));
    }

    #[tokio::test]
    async fn test_prepare_stops_on_abort_signal() {
        let mut proxy = mock_for("shard0");
        proxy
            .expect_prepare()
            .returning(|_, _| Err(Status::new(ErrorCode::NetworkTimeout, "slow")));

        let env = env_with(proxy);
        let signal = CancellationToken::new();
        signal.cancel();
        let vote = send_prepare_to_shard(&env, &"shard0".into(), &key(), &signal).await.unwrap();

        assert!(matches!(
            vote,
            ParticipantVote::VotedAbort { reason }
                if reason.code == ErrorCode::TransactionCoordinatorReachedAbortDecision
        ));
    }

    #[tokio::test]
    async fn test_prepare_to_unknown_shard_votes_abort() {
        let env = env_with(mock_for("shard0"));
        let vote = send_prepare_to_shard(&env, &"shard9".into(), &key(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(vote, ParticipantVote::VotedAbort { .. }));
    }

    #[tokio::test]
    async fn test_decision_treats_no_such_transaction_as_ack() {
        let mut proxy = mock_for("shard1");
        proxy
            .expect_abort()
            .times(1)
            .returning(|_, _| Err(Status::no_such_transaction("already aborted")));

        let env = env_with(proxy);
        let decision = CoordinatorDecision::abort(Status::no_such_transaction("shard2 aborted"));
        send_decision_to_shard(&env, &"shard1".into(), &key(), &decision).await.unwrap();
    }

    #[tokio::test]
    async fn test_decision_retries_until_acknowledged() {
        let mut proxy = mock_for("shard1");
        let mut seq = Sequence::new();
        proxy
            .expect_commit()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(Status::new(ErrorCode::ShutdownInProgress, "restarting")));
        proxy
            .expect_commit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let env = env_with(proxy);
        let decision = CoordinatorDecision::commit(LogicalTimestamp::new(4, 4));
        send_decision_to_shard(&env, &"shard1".into(), &key(), &decision).await.unwrap();
    }

    #[test]
    fn test_classify_already_committed() {
        let vote = ParticipantVote::classify(Err(Status::new(
            ErrorCode::TransactionCommitted,
            "has been committed",
        )));
        assert!(matches!(vote, ParticipantVote::AlreadyCommitted { .. }));
    }

    #[tokio::test]
    async fn test_prepare_does_not_retry_already_committed() {
        let mut proxy = mock_for("shard0");
        proxy
            .expect_prepare()
            .times(1)
            .returning(|_, _| Err(Status::new(ErrorCode::TransactionCommitted, "has been committed")));

        let env = env_with(proxy);
        let vote = send_prepare_to_shard(&env, &"shard0".into(), &key(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(vote, ParticipantVote::AlreadyCommitted { .. }));
    }

    #[tokio::test]
    async fn test_decision_stops_on_authoritative_error() {
        let mut proxy = mock_for("shard1");
        proxy.expect_commit().times(1).returning(|_, _, _| {
            Err(Status::new(ErrorCode::InvalidOptions, "commit timestamp is before prepare timestamp"))
        });

        let env = env_with(proxy);
        let decision = CoordinatorDecision::commit(LogicalTimestamp::new(4, 4));
        let err = send_decision_to_shard(&env, &"shard1".into(), &key(), &decision)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOptions);
        assert!(env.ops.is_empty());
    }

    #[tokio::test]
    async fn test_abort_rejected_by_committed_participant_is_not_resent() {
        let mut proxy = mock_for("shard1");
        proxy
            .expect_abort()
            .times(1)
            .returning(|_, _| Err(Status::new(ErrorCode::TransactionCommitted, "has been committed")));

        let env = env_with(proxy);
        let decision = CoordinatorDecision::abort(Status::no_such_transaction("shard2 aborted"));
        let err = send_decision_to_shard(&env, &"shard1".into(), &key(), &decision)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TransactionCommitted);
    }

    #[tokio::test]
    async fn test_decision_resend_stops_on_shutdown() {
        let mut proxy = mock_for("shard1");
        proxy
            .expect_commit()
            .returning(|_, _, _| Err(Status::new(ErrorCode::HostUnreachable, "partitioned")));

        let env = env_with(proxy);
        let shutdown = env.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.cancel();
        });

        let decision = CoordinatorDecision::commit(LogicalTimestamp::new(4, 4));
        let err = send_decision_to_shard(&env, &"shard1".into(), &key(), &decision)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TransactionCoordinatorSteppingDown);
    }
}
