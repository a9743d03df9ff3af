// Shared fixtures: a cluster of in-memory shards plus coordinator nodes
// that can be stepped up and down over one durable store.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use txcoord_core::{CoordinatorConfig, CoordinatorKey, LogicalSessionId, LogicalTimestamp, ShardId, TxnNumber};
use txcoord_state::{
    CoordinatorCatalog, CoordinatorDocumentStore, CoordinatorMetrics, CoordinatorServices,
    CoordinatorState, InMemoryCoordinatorStore, LocalParticipantProxy, OperationRegistry,
    ParticipantCommand, RecoveryService, ShardTransactionParticipant, StaticShardRegistry, StepHook,
};

pub const NAMESPACE: &str = "test.user";

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 10,
        completed_retention_ms: 60_000,
        ..CoordinatorConfig::default()
    }
}

pub fn new_key() -> CoordinatorKey {
    CoordinatorKey::new(LogicalSessionId::generate(), TxnNumber(0))
}

/// Pauses the first coordinator that enters `at` until released
pub struct PauseHook {
    at: CoordinatorState,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl PauseHook {
    pub fn new(at: CoordinatorState) -> Arc<Self> {
        Arc::new(PauseHook {
            at,
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    pub async fn wait_reached(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.reached.notified())
            .await
            .expect("coordinator never reached the pause point");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl StepHook for PauseHook {
    async fn on_enter(&self, _key: &CoordinatorKey, state: CoordinatorState) {
        if state == self.at && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

/// One coordinator node: its catalog and recovery service
pub struct Node {
    pub catalog: Arc<CoordinatorCatalog>,
    pub recovery: RecoveryService,
    pub ops: OperationRegistry,
    pub metrics: Arc<CoordinatorMetrics>,
}

pub struct Cluster {
    pub participants: BTreeMap<String, Arc<ShardTransactionParticipant>>,
    pub proxies: BTreeMap<String, Arc<LocalParticipantProxy>>,
    pub registry: Arc<StaticShardRegistry>,
    pub store: Arc<dyn CoordinatorDocumentStore>,
    pub config: CoordinatorConfig,
}

impl Cluster {
    pub fn new(shards: &[&str]) -> Self {
        Self::with_store(shards, Arc::new(InMemoryCoordinatorStore::new()), fast_config())
    }

    /// Shard i's clock starts at (10 * (i + 1), 0) so prepare timestamps differ
    pub fn with_store(
        shards: &[&str],
        store: Arc<dyn CoordinatorDocumentStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let mut participants = BTreeMap::new();
        let mut proxies = BTreeMap::new();
        let mut registry = StaticShardRegistry::new();
        for (i, name) in shards.iter().enumerate() {
            let participant = Arc::new(ShardTransactionParticipant::with_clock(
                ShardId::from(*name),
                LogicalTimestamp::new(10 * (i as u32 + 1), 0),
            ));
            let proxy = Arc::new(LocalParticipantProxy::new(participant.clone()));
            registry.add(proxy.clone());
            participants.insert(name.to_string(), participant);
            proxies.insert(name.to_string(), proxy);
        }

        Cluster {
            participants,
            proxies,
            registry: Arc::new(registry),
            store,
            config,
        }
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.participants.keys().map(|name| ShardId::from(name.as_str())).collect()
    }

    pub fn participant(&self, name: &str) -> &Arc<ShardTransactionParticipant> {
        &self.participants[name]
    }

    pub fn proxy(&self, name: &str) -> &Arc<LocalParticipantProxy> {
        &self.proxies[name]
    }

    /// Build a node over the shared store and step it up
    pub async fn primary(&self, hook: Option<Arc<dyn StepHook>>) -> Node {
        let ops = OperationRegistry::new();
        let metrics = Arc::new(CoordinatorMetrics::new());
        let mut services = CoordinatorServices::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
        )
        .with_ops(ops.clone())
        .with_metrics(metrics.clone());
        if let Some(hook) = hook {
            services = services.with_hook(hook);
        }

        let catalog = CoordinatorCatalog::new(services);
        let recovery = RecoveryService::new(catalog.clone());
        recovery.on_become_primary().await.expect("step up failed");
        Node { catalog, recovery, ops, metrics }
    }

    /// One insert per shard under `key`; document _id is the shard index
    pub fn insert_everywhere(&self, key: &CoordinatorKey) {
        for (i, participant) in self.participants.values().enumerate() {
            participant
                .insert(key, NAMESPACE, json!({ "_id": i, "shard": participant.shard_id().as_str() }))
                .expect("insert failed");
        }
    }

    /// Committed documents across all shards
    pub fn find_everywhere(&self) -> usize {
        self.participants.values().map(|p| p.find(NAMESPACE).len()).sum()
    }

    pub fn calls(&self, command: ParticipantCommand) -> u64 {
        self.proxies.values().map(|p| p.calls(command)).sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.proxies.values().map(|p| p.total_calls()).sum()
    }

    pub async fn wait_for_store_drained(&self) {
        let store = self.store.clone();
        wait_until("coordinator documents deleted", || {
            let store = store.clone();
            async move { store.scan_incomplete().await.map(|d| d.is_empty()).unwrap_or(false) }
        })
        .await;
    }
}

/// Poll `check` until true; panic after five seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
