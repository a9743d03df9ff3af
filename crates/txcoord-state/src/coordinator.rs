// Two-phase commit coordinator for one distributed transaction
//
// SAFETY INVARIANTS:
// 1. The participant list is durable before any prepare is sent
// 2. The decision is durable before any commit/abort is sent
// 3. Every participant acknowledged the decision before the document is deleted
// 4. One driver task per coordinator; state only moves forward
// 5. Any single abort vote aborts the transaction
// 6. No decision is written over a participant that already committed
//
// Stepping down cancels the driver wherever it is suspended. Nothing is
// undone: the next primary resumes from the durable document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info, warn};

use txcoord_core::{
    CommitDecision, CoordinatorConfig, CoordinatorDecision, CoordinatorDocument, CoordinatorKey,
    ErrorCode, LogicalSessionId, LogicalTimestamp, ShardId, Status, TxnNumber,
};

use crate::metrics::{coordination_summary, CoordinatorMetrics, CoordinatorStats, EndOutcome};
use crate::op_context::OperationRegistry;
use crate::participant::{
    send_decision_to_shard, send_prepare_to_shard, ParticipantVote, RetryEnv, ShardRegistry,
    COORDINATOR_OP_DESC,
};
use crate::store::{CoordinatorDocumentStore, StoreError};

/// Coordinator state machine steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// Created; participant list not yet durable
    Inactive,
    /// Participant list durable; collecting votes
    Preparing,
    /// A participant voted to abort (or the deadline passed)
    Failed,
    /// Votes collected; writing the decision
    WritingDecision,
    /// Decision durable; delivering it to participants
    DecisionMade,
    /// All participants acknowledged; deleting the document
    Deleting,
    /// Document deleted; decision kept in memory for retries
    Done,
}

impl CoordinatorState {
    pub const NON_TERMINAL: [CoordinatorState; 6] = [
        CoordinatorState::Inactive,
        CoordinatorState::Preparing,
        CoordinatorState::Failed,
        CoordinatorState::WritingDecision,
        CoordinatorState::DecisionMade,
        CoordinatorState::Deleting,
    ];

    /// Position among the non-terminal states
    pub fn index(&self) -> Option<usize> {
        Self::NON_TERMINAL.iter().position(|state| state == self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Inactive => "inactive",
            CoordinatorState::Preparing => "preparing",
            CoordinatorState::Failed => "failed",
            CoordinatorState::WritingDecision => "writingDecision",
            CoordinatorState::DecisionMade => "decisionMade",
            CoordinatorState::Deleting => "deleting",
            CoordinatorState::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == CoordinatorState::Done
    }
}

/// Suspension point observer, called each time a coordinator enters a state.
///
/// Production uses `NoopStepHook`. Tests inject hooks that pause a
/// coordinator at a chosen step to simulate failover or killOp there.
#[async_trait]
pub trait StepHook: Send + Sync {
    async fn on_enter(&self, key: &CoordinatorKey, state: CoordinatorState);
}

pub struct NoopStepHook;

#[async_trait]
impl StepHook for NoopStepHook {
    async fn on_enter(&self, _key: &CoordinatorKey, _state: CoordinatorState) {}
}

/// Node-wide collaborators shared by every coordinator
#[derive(Clone)]
pub struct CoordinatorServices {
    pub store: Arc<dyn CoordinatorDocumentStore>,
    pub shards: Arc<dyn ShardRegistry>,
    pub ops: OperationRegistry,
    pub metrics: Arc<CoordinatorMetrics>,
    pub config: CoordinatorConfig,
    pub hook: Arc<dyn StepHook>,
}

impl CoordinatorServices {
    pub fn new(
        store: Arc<dyn CoordinatorDocumentStore>,
        shards: Arc<dyn ShardRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        CoordinatorServices {
            store,
            shards,
            ops: OperationRegistry::new(),
            metrics: Arc::new(CoordinatorMetrics::new()),
            config,
            hook: Arc::new(NoopStepHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_ops(mut self, ops: OperationRegistry) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CoordinatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// currentOp entry for a coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorReport {
    pub desc: String,
    pub lsid: LogicalSessionId,
    pub txn_number: TxnNumber,
    pub num_participants: usize,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<CommitDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<LogicalTimestamp>,
    pub has_recovered_from_failover: bool,
    pub create_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

enum Resume {
    Fresh(CoordinatorDocument),
    Undecided,
    Decided(CoordinatorDecision),
}

/// Result of folding the prepare votes
enum VoteOutcome {
    Decide(CoordinatorDecision),
    /// Participants committed under an earlier coordination whose document
    /// was already deleted; there is nothing left to decide
    AlreadyCommitted(Status),
}

/// How a driver run ended
enum Ending {
    Decided(CoordinatorDecision),
    AlreadyCommitted,
}

struct CoordinatorInner {
    state: CoordinatorState,
    participants: Vec<ShardId>,
    decision: Option<CoordinatorDecision>,
    stats: CoordinatorStats,
    ended: bool,
}

pub struct TransactionCoordinator {
    key: CoordinatorKey,
    services: CoordinatorServices,
    recovered: bool,
    deadline: Option<(tokio::time::Instant, DateTime<Utc>)>,
    shutdown: CancellationToken,
    inner: Mutex<CoordinatorInner>,
    state_tx: watch::Sender<CoordinatorState>,
    outcome_tx: watch::Sender<Option<Result<CoordinatorDecision, Status>>>,
    ended_tx: watch::Sender<bool>,
}

impl TransactionCoordinator {
    fn new(
        services: CoordinatorServices,
        key: CoordinatorKey,
        participants: Vec<ShardId>,
        recovered: bool,
        with_deadline: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let deadline = if with_deadline {
            services.config.prepare_deadline().map(|window| {
                let wall = chrono::Duration::from_std(window)
                    .map(|d| Utc::now() + d)
                    .unwrap_or_else(|_| Utc::now());
                (tokio::time::Instant::now() + window, wall)
            })
        } else {
            None
        };

        services.metrics.on_create();
        let (state_tx, _) = watch::channel(CoordinatorState::Inactive);
        let (outcome_tx, _) = watch::channel(None);
        let (ended_tx, _) = watch::channel(false);

        TransactionCoordinator {
            key,
            services,
            recovered,
            deadline,
            shutdown,
            inner: Mutex::new(CoordinatorInner {
                state: CoordinatorState::Inactive,
                participants,
                decision: None,
                stats: CoordinatorStats::new(),
                ended: false,
            }),
            state_tx,
            outcome_tx,
            ended_tx,
        }
    }

    /// Create a coordinator for a new commit and start driving it.
    ///
    /// `shutdown` is cancelled when this node steps down.
    pub fn start(
        services: CoordinatorServices,
        key: CoordinatorKey,
        participants: Vec<ShardId>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, Status> {
        let doc = CoordinatorDocument::new(key, participants)?;
        info!(
            "{} starting two-phase commit with participants {:?}",
            key, doc.participants
        );
        let coordinator = Arc::new(Self::new(
            services,
            key,
            doc.participants.clone(),
            false,
            true,
            shutdown,
        ));
        tokio::spawn(coordinator.clone().run(Resume::Fresh(doc)));
        Ok(coordinator)
    }

    /// Rebuild a coordinator from its durable document and resume it:
    /// at Preparing without a decision, at DecisionMade with one.
    pub fn recover(
        services: CoordinatorServices,
        doc: CoordinatorDocument,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, Status> {
        doc.validate()?;
        let resume = match doc.decision() {
            Some(decision) => Resume::Decided(decision),
            None => Resume::Undecided,
        };
        info!(
            "{} recovering coordinator ({})",
            doc.id,
            match &resume {
                Resume::Decided(decision) => format!("decision {}", decision),
                _ => "no decision yet".to_string(),
            }
        );
        let undecided = matches!(resume, Resume::Undecided);
        let coordinator = Arc::new(Self::new(
            services,
            doc.id,
            doc.participants,
            true,
            undecided,
            shutdown,
        ));
        tokio::spawn(coordinator.clone().run(resume));
        Ok(coordinator)
    }

    pub fn key(&self) -> &CoordinatorKey {
        &self.key
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    pub fn participants(&self) -> Vec<ShardId> {
        self.inner.lock().participants.clone()
    }

    pub fn decision(&self) -> Option<CoordinatorDecision> {
        self.inner.lock().decision.clone()
    }

    pub fn has_recovered_from_failover(&self) -> bool {
        self.recovered
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    pub fn same_participants(&self, participants: &[ShardId]) -> bool {
        let mine: BTreeSet<ShardId> = self.inner.lock().participants.iter().cloned().collect();
        let theirs: BTreeSet<ShardId> = participants.iter().cloned().collect();
        mine == theirs
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Outcome once every participant acknowledged the decision, or the
    /// stepdown error if this node gave the coordinator up first.
    ///
    /// Cancelling `caller` ends only this wait.
    pub async fn wait_for_outcome(
        &self,
        caller: Option<&CancellationToken>,
    ) -> Result<CoordinatorDecision, Status> {
        let mut rx = self.outcome_tx.subscribe();
        let caller_cancelled = async {
            match caller {
                Some(token) => token.cancelled().await,
                None => futures::future::pending::<()>().await,
            }
        };
        let outcome = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(Status::stepping_down());
                }
            }
        };

        tokio::select! {
            biased;
            _ = caller_cancelled => Err(Status::interrupted(format!(
                "wait for decision of {} was interrupted",
                self.key
            ))),
            outcome = outcome => outcome,
        }
    }

    /// Resolves once the coordinator reached Done or was abandoned
    pub async fn wait_for_end(&self) {
        let mut rx = self.ended_tx.subscribe();
        loop {
            let ended = *rx.borrow_and_update();
            if ended || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn report(&self) -> CoordinatorReport {
        let inner = self.inner.lock();
        CoordinatorReport {
            desc: COORDINATOR_OP_DESC.to_string(),
            lsid: self.key.lsid,
            txn_number: self.key.txn_number,
            num_participants: inner.participants.len(),
            state: inner.state.name().to_string(),
            decision: inner.decision.as_ref().map(|d| d.kind()),
            commit_timestamp: inner.decision.as_ref().and_then(|d| d.commit_timestamp()),
            has_recovered_from_failover: self.recovered,
            create_time: inner.stats.create_time(),
            deadline: self.deadline.map(|(_, wall)| wall),
        }
    }

    async fn run(self: Arc<Self>, resume: Resume) {
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Status::stepping_down()),
            result = self.drive(resume) => result,
        };

        match result {
            Ok(Ending::Decided(decision)) => self.finish(Some(decision)),
            Ok(Ending::AlreadyCommitted) => self.finish(None),
            Err(status) => self.abandon(status),
        }
    }

    async fn drive(&self, resume: Resume) -> Result<Ending, Status> {
        let votes = match resume {
            Resume::Fresh(doc) => {
                self.services.hook.on_enter(&self.key, CoordinatorState::Inactive).await;
                self.persist_participants(&doc).await?;
                self.enter_state(CoordinatorState::Preparing).await;
                self.collect_votes().await?
            }
            Resume::Undecided => {
                self.enter_state(CoordinatorState::Preparing).await;
                self.collect_votes().await?
            }
            Resume::Decided(decision) => {
                self.inner.lock().decision = Some(decision.clone());
                VoteOutcome::Decide(decision)
            }
        };

        let decision = match votes {
            VoteOutcome::Decide(decision) if self.decision().is_some() => decision,
            VoteOutcome::Decide(decision) => self.persist_decision(decision).await?,
            VoteOutcome::AlreadyCommitted(status) => return self.release_committed(status).await,
        };

        self.enter_state(CoordinatorState::DecisionMade).await;
        self.deliver_decision(&decision).await?;

        self.enter_state(CoordinatorState::Deleting).await;
        self.publish_outcome(Ok(decision.clone()));
        self.delete_document().await?;
        Ok(Ending::Decided(decision))
    }

    /// Nothing to decide: drop the participant list this run wrote and
    /// answer with the participant's own report
    async fn release_committed(&self, status: Status) -> Result<Ending, Status> {
        info!("{} was committed by an earlier coordination, releasing: {}", self.key, status);
        self.enter_state(CoordinatorState::Deleting).await;
        self.publish_outcome(Err(Status::new(
            ErrorCode::TransactionCommitted,
            format!("transaction {} has already been committed", self.key),
        )));
        self.delete_document().await?;
        Ok(Ending::AlreadyCommitted)
    }

    async fn delete_document(&self) -> Result<(), Status> {
        let store = &self.services.store;
        self.retry_store("delete coordinator document", || store.delete(&self.key))
            .await
            .map_err(Status::from)
    }

    /// Record the transition, then give the hook a chance to suspend us
    async fn enter_state(&self, state: CoordinatorState) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = state;
            inner.stats.on_start_state(state);
            previous
        };
        self.services.metrics.on_start_state(previous, state);
        self.state_tx.send_replace(state);
        debug!("{} {} -> {}", self.key, previous.name(), state.name());

        self.services.hook.on_enter(&self.key, state).await;
    }

    async fn persist_participants(&self, doc: &CoordinatorDocument) -> Result<(), Status> {
        let store = &self.services.store;
        self.retry_store("write participant list", || store.insert(doc))
            .await
            .map_err(Status::from)
    }

    fn retry_env(&self) -> RetryEnv {
        RetryEnv {
            shards: self.services.shards.clone(),
            ops: self.services.ops.clone(),
            config: self.services.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Fan out prepare, fan in votes, fold them into a decision
    async fn collect_votes(&self) -> Result<VoteOutcome, Status> {
        let participants = self.participants();
        let env = self.retry_env();
        let abort_signal = CancellationToken::new();

        let mut votes: FuturesUnordered<_> = participants
            .iter()
            .map(|shard| {
                let env = &env;
                let key = &self.key;
                let abort_signal = &abort_signal;
                async move { (shard, send_prepare_to_shard(env, shard, key, abort_signal).await) }
            })
            .collect();

        let deadline = self.deadline.map(|(at, _)| at);
        let deadline_passed = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_passed);

        let mut tally = VoteTally::default();
        let mut deadline_fired = false;
        loop {
            tokio::select! {
                next = votes.next() => match next {
                    None => break,
                    Some((shard, vote)) => {
                        if tally.record(shard, vote?) {
                            abort_signal.cancel();
                        }
                    }
                },
                _ = &mut deadline_passed, if !deadline_fired => {
                    deadline_fired = true;
                    warn!("{} prepare deadline passed before all votes arrived", self.key);
                    tally.abort_with(Status::new(
                        ErrorCode::ExceededTimeLimit,
                        "transaction coordinator deadline expired while collecting votes",
                    ));
                    abort_signal.cancel();
                }
            }
        }

        let outcome = tally.decide();
        if let VoteOutcome::Decide(decision) = &outcome {
            info!("{} decided to {}", self.key, decision);
        }
        Ok(outcome)
    }

    async fn persist_decision(&self, decision: CoordinatorDecision) -> Result<CoordinatorDecision, Status> {
        if !decision.is_commit() {
            self.enter_state(CoordinatorState::Failed).await;
        }
        self.enter_state(CoordinatorState::WritingDecision).await;

        let store = &self.services.store;
        let written = self
            .retry_store("write decision", || store.update_decision(&self.key, &decision))
            .await;

        let durable = match written {
            Ok(()) => decision,
            Err(StoreError::WriteConflict { existing, .. }) => {
                warn!(
                    "{} found decision {} already durable, adopting it over {}",
                    self.key, existing, decision
                );
                existing
            }
            Err(err) => return Err(err.into()),
        };

        self.inner.lock().decision = Some(durable.clone());
        Ok(durable)
    }

    async fn deliver_decision(&self, decision: &CoordinatorDecision) -> Result<(), Status> {
        let participants = self.participants();
        let env = self.retry_env();
        let acks = futures::future::join_all(
            participants
                .iter()
                .map(|shard| send_decision_to_shard(&env, shard, &self.key, decision)),
        )
        .await;

        for ack in acks {
            ack?;
        }
        debug!("{} all participants acknowledged {}", self.key, decision);
        Ok(())
    }

    /// Re-issue a store operation until it succeeds or fails authoritatively.
    /// Stepdown interrupts the wait from the outside.
    async fn retry_store<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    warn!("{} failed to {}, attempt {}: {}", self.key, what, attempt, err);
                    tokio::time::sleep(self.services.config.backoff_for_attempt(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => {
                    error!("{} failed to {}: {}", self.key, what, err);
                    return Err(err);
                }
            }
        }
    }

    fn publish_outcome(&self, outcome: Result<CoordinatorDecision, Status>) {
        self.outcome_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    fn finish(&self, decision: Option<CoordinatorDecision>) {
        let (previous, summary) = {
            let mut inner = self.inner.lock();
            if inner.ended {
                return;
            }
            let previous = inner.state;
            inner.state = CoordinatorState::Done;
            inner.stats.on_end();
            inner.ended = true;

            let summary = if inner.stats.total_duration() >= self.services.config.slow_op_threshold() {
                Some(coordination_summary(
                    &self.key,
                    inner.participants.len(),
                    decision.as_ref(),
                    &inner.stats,
                ))
            } else {
                None
            };
            (previous, summary)
        };

        let outcome = match &decision {
            Some(decision) if !decision.is_commit() => EndOutcome::Aborted,
            _ => EndOutcome::Committed,
        };
        self.services.metrics.on_end(previous, outcome);
        if let Some(decision) = decision {
            self.publish_outcome(Ok(decision));
        }
        self.state_tx.send_replace(CoordinatorState::Done);
        self.ended_tx.send_replace(true);

        if let Some(summary) = summary {
            info!("{}", summary);
        }
        debug!("{} coordinator done", self.key);
    }

    fn abandon(&self, status: Status) {
        let last = {
            let mut inner = self.inner.lock();
            if inner.ended {
                return;
            }
            inner.stats.on_end();
            inner.ended = true;
            inner.state
        };

        let outcome = if status.code == ErrorCode::TransactionCoordinatorSteppingDown {
            info!("{} coordinator stepping down in state {}", self.key, last.name());
            EndOutcome::SteppedDown
        } else {
            error!("{} coordinator gave up in state {}: {}", self.key, last.name(), status);
            EndOutcome::Aborted
        };
        self.services.metrics.on_end(last, outcome);
        self.publish_outcome(Err(status));
        self.ended_tx.send_replace(true);
    }
}

/// Folds votes as they arrive
#[derive(Default)]
struct VoteTally {
    max_prepare_timestamp: Option<LogicalTimestamp>,
    affected_namespaces: BTreeSet<String>,
    abort_reason: Option<Status>,
    already_committed: Option<Status>,
}

impl VoteTally {
    /// Returns true when this vote is the first reason to abort
    fn record(&mut self, shard: &ShardId, vote: ParticipantVote) -> bool {
        match vote {
            ParticipantVote::Prepared { timestamp, affected_namespaces } => {
                self.max_prepare_timestamp = self.max_prepare_timestamp.max(Some(timestamp));
                self.affected_namespaces.extend(affected_namespaces);
                false
            }
            ParticipantVote::VotedAbort { reason } => {
                if reason.code == ErrorCode::TransactionCoordinatorReachedAbortDecision {
                    return false;
                }
                self.abort_with(Status::new(
                    reason.code,
                    format!("from shard {}: {}", shard, reason.reason),
                ))
            }
            ParticipantVote::AlreadyCommitted { reason } => {
                if self.already_committed.is_none() {
                    self.already_committed = Some(Status::new(
                        reason.code,
                        format!("from shard {}: {}", shard, reason.reason),
                    ));
                }
                false
            }
            // Retry drivers never hand back a transient failure; treat one as fatal
            ParticipantVote::TransientFailure { reason } => self.abort_with(reason),
        }
    }

    fn abort_with(&mut self, reason: Status) -> bool {
        if self.abort_reason.is_some() {
            return false;
        }
        self.abort_reason = Some(reason);
        true
    }

    /// A committed participant rules out abort. Participants this run
    /// prepared are committed alongside it; with none there is nothing to
    /// decide.
    fn decide(self) -> VoteOutcome {
        if let Some(committed) = self.already_committed {
            if let Some(reason) = &self.abort_reason {
                error!(
                    "invariant violated: abort vote ({}) alongside a committed participant ({})",
                    reason, committed
                );
            }
            return match self.max_prepare_timestamp {
                Some(commit_timestamp) => VoteOutcome::Decide(CoordinatorDecision::Committed {
                    commit_timestamp,
                    affected_namespaces: self.affected_namespaces.into_iter().collect(),
                }),
                None => VoteOutcome::AlreadyCommitted(committed),
            };
        }
        if let Some(reason) = self.abort_reason {
            return VoteOutcome::Decide(CoordinatorDecision::abort(reason));
        }
        VoteOutcome::Decide(match self.max_prepare_timestamp {
            Some(commit_timestamp) => CoordinatorDecision::Committed {
                commit_timestamp,
                affected_namespaces: self.affected_namespaces.into_iter().collect(),
            },
            None => CoordinatorDecision::abort(Status::new(
                ErrorCode::InternalError,
                "no participant votes were collected",
            )),
        })
    }
}
