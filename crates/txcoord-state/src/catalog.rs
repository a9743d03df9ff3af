// Catalog of live coordinators on this node
//
// SAFETY INVARIANTS:
// 1. At most one coordinator instance per (lsid, txnNumber) per term
// 2. New commits are refused while stepped down and wait while recovering
// 3. A finished coordinator's decision stays answerable after eviction

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use log::{debug, info, warn};

use txcoord_core::{
    CoordinatorDecision, CoordinatorDocument, CoordinatorKey, ErrorCode, LogicalSessionId,
    ShardId, Status, TxnNumber,
};

use crate::coordinator::{CoordinatorReport, CoordinatorServices, CoordinatorState, TransactionCoordinator};

const COMPLETED_HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStatus {
    SteppedDown,
    Recovering,
    Active,
}

/// Result of looking up a coordinator for a commit request
pub enum CoordinatorLookup {
    Live(Arc<TransactionCoordinator>),
    Completed(CoordinatorDecision),
}

struct History {
    decisions: LruCache<CoordinatorKey, CoordinatorDecision>,
    sessions: LruCache<LogicalSessionId, TxnNumber>,
}

impl History {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(COMPLETED_HISTORY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        History {
            decisions: LruCache::new(capacity),
            sessions: LruCache::new(capacity),
        }
    }

    fn note_session(&mut self, key: &CoordinatorKey) {
        let latest = self.sessions.get(&key.lsid).copied();
        if latest.map_or(true, |latest| key.txn_number > latest) {
            self.sessions.put(key.lsid, key.txn_number);
        }
    }
}

pub struct CoordinatorCatalog {
    services: CoordinatorServices,
    coordinators: DashMap<CoordinatorKey, Arc<TransactionCoordinator>>,
    history: Mutex<History>,
    status: watch::Sender<CatalogStatus>,
    term: Mutex<CancellationToken>,
}

impl CoordinatorCatalog {
    /// New catalog, stepped down until recovery steps it up
    pub fn new(services: CoordinatorServices) -> Arc<Self> {
        let (status, _) = watch::channel(CatalogStatus::SteppedDown);
        let term = CancellationToken::new();
        term.cancel();
        Arc::new(CoordinatorCatalog {
            services,
            coordinators: DashMap::new(),
            history: Mutex::new(History::new()),
            status,
            term: Mutex::new(term),
        })
    }

    pub fn services(&self) -> &CoordinatorServices {
        &self.services
    }

    pub fn status(&self) -> CatalogStatus {
        *self.status.borrow()
    }

    /// Start a new term. Commits wait until `finish_step_up`.
    pub fn begin_step_up(&self) {
        *self.term.lock() = CancellationToken::new();
        self.status.send_replace(CatalogStatus::Recovering);
        info!("Coordinator catalog stepping up, recovery in progress");
    }

    pub fn finish_step_up(&self) {
        self.status.send_replace(CatalogStatus::Active);
        info!("Coordinator catalog active with {} coordinators", self.coordinators.len());
    }

    /// Abandon every coordinator of the current term. Returns how many were dropped.
    pub fn on_step_down(&self) -> usize {
        self.status.send_replace(CatalogStatus::SteppedDown);
        self.term.lock().cancel();

        let abandoned = self
            .coordinators
            .iter()
            .filter(|entry| !entry.value().is_ended())
            .count();
        self.coordinators.clear();
        info!("Coordinator catalog stepped down, abandoned {} coordinators", abandoned);
        abandoned
    }

    fn term_token(&self) -> CancellationToken {
        self.term.lock().child_token()
    }

    /// Block while recovering; fail while stepped down
    pub async fn wait_until_active(&self, caller: Option<&CancellationToken>) -> Result<(), Status> {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                CatalogStatus::Active => return Ok(()),
                CatalogStatus::SteppedDown => {
                    return Err(Status::new(
                        ErrorCode::NotWritablePrimary,
                        "transaction coordinator is not primary",
                    ))
                }
                CatalogStatus::Recovering => {
                    let caller_cancelled = async {
                        match caller {
                            Some(token) => token.cancelled().await,
                            None => futures::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = caller_cancelled => {
                            return Err(Status::interrupted("interrupted while waiting for coordinator recovery"));
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Err(Status::new(ErrorCode::ShutdownInProgress, "catalog shut down"));
                            }
                        }
                    }
                }
            }
        }
    }

    /// coordinateCommitTransaction: find or start the coordinator for `key`
    /// and wait for its outcome. Cancelling `caller` ends only the wait.
    pub async fn coordinate_commit(
        self: &Arc<Self>,
        key: CoordinatorKey,
        participants: Vec<ShardId>,
        caller: Option<&CancellationToken>,
    ) -> Result<CoordinatorDecision, Status> {
        self.wait_until_active(caller).await?;
        match self.create_or_get(key, participants)? {
            CoordinatorLookup::Completed(decision) => {
                debug!("{} answered from completed history", key);
                Ok(decision)
            }
            CoordinatorLookup::Live(coordinator) => coordinator.wait_for_outcome(caller).await,
        }
    }

    /// Compare-and-insert: return the existing coordinator for `key` or
    /// start a new one
    pub fn create_or_get(
        self: &Arc<Self>,
        key: CoordinatorKey,
        participants: Vec<ShardId>,
    ) -> Result<CoordinatorLookup, Status> {
        if participants.is_empty() {
            return Err(Status::new(
                ErrorCode::InvalidOptions,
                "coordinateCommitTransaction requires at least one participant",
            ));
        }
        if let Some(unknown) = participants.iter().find(|s| !self.services.shards.contains(s)) {
            return Err(Status::new(
                ErrorCode::InvalidOptions,
                format!("participant {} is not a known shard", unknown),
            ));
        }

        {
            let mut history = self.history.lock();
            if let Some(latest) = history.sessions.get(&key.lsid).copied() {
                if latest > key.txn_number {
                    return Err(Status::new(
                        ErrorCode::TransactionTooOld,
                        format!(
                            "cannot coordinate txnNumber {} on session {}: txnNumber {} has already started",
                            key.txn_number, key.lsid, latest
                        ),
                    ));
                }
            }
            if let Some(decision) = history.decisions.get(&key) {
                return Ok(CoordinatorLookup::Completed(decision.clone()));
            }
        }

        let coordinator = match self.coordinators.entry(key) {
            Entry::Occupied(existing) => {
                let coordinator = existing.get().clone();
                if !coordinator.same_participants(&participants) {
                    return Err(Status::new(
                        ErrorCode::DuplicateKey,
                        format!(
                            "{} is already being coordinated with participants {:?}",
                            key,
                            coordinator.participants()
                        ),
                    ));
                }
                return Ok(CoordinatorLookup::Live(coordinator));
            }
            Entry::Vacant(vacant) => {
                let coordinator = TransactionCoordinator::start(
                    self.services.clone(),
                    key,
                    participants,
                    self.term_token(),
                )?;
                vacant.insert(coordinator.clone());
                coordinator
            }
        };

        self.history.lock().note_session(&key);
        self.schedule_eviction(coordinator.clone());
        Ok(CoordinatorLookup::Live(coordinator))
    }

    /// Used by recovery: reuse the live instance or rebuild one from `doc`
    pub fn recover_or_get(
        self: &Arc<Self>,
        doc: CoordinatorDocument,
    ) -> Result<Arc<TransactionCoordinator>, Status> {
        let key = doc.id;
        let coordinator = match self.coordinators.entry(key) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let coordinator =
                    TransactionCoordinator::recover(self.services.clone(), doc, self.term_token())?;
                vacant.insert(coordinator.clone());
                coordinator
            }
        };

        self.history.lock().note_session(&key);
        self.schedule_eviction(coordinator.clone());
        Ok(coordinator)
    }

    pub fn get(&self, key: &CoordinatorKey) -> Option<Arc<TransactionCoordinator>> {
        self.coordinators.get(key).map(|entry| entry.value().clone())
    }

    /// Decision known to this node for `key`, live or from history
    pub fn get_decision(&self, key: &CoordinatorKey) -> Option<CoordinatorDecision> {
        if let Some(coordinator) = self.get(key) {
            if let Some(decision) = coordinator.decision() {
                return Some(decision);
            }
        }
        self.history.lock().decisions.peek(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<TransactionCoordinator>> {
        let mut coordinators: Vec<_> = self.coordinators.iter().map(|e| e.value().clone()).collect();
        coordinators.sort_by_key(|c| *c.key());
        coordinators
    }

    pub fn reports(&self) -> Vec<CoordinatorReport> {
        self.list().iter().map(|c| c.report()).collect()
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// After Done, remember the decision and drop the instance once the
    /// retention window passes
    fn schedule_eviction(self: &Arc<Self>, coordinator: Arc<TransactionCoordinator>) {
        let catalog: Weak<Self> = Arc::downgrade(self);
        let retention = self.services.config.completed_retention();

        tokio::spawn(async move {
            coordinator.wait_for_end().await;
            let key = *coordinator.key();

            if coordinator.state() == CoordinatorState::Done {
                if let (Some(catalog), Some(decision)) = (catalog.upgrade(), coordinator.decision()) {
                    catalog.history.lock().decisions.put(key, decision);
                }
                tokio::time::sleep(retention).await;
            }

            if let Some(catalog) = catalog.upgrade() {
                let removed = catalog
                    .coordinators
                    .remove_if(&key, |_, live| Arc::ptr_eq(live, &coordinator))
                    .is_some();
                if removed {
                    debug!("{} evicted from coordinator catalog", key);
                }
            } else {
                warn!("{} finished after its catalog was dropped", key);
            }
        });
    }
}
