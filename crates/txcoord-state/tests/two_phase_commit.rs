// End-to-end two-phase commit over in-memory shards
//
// TEST COVERAGE:
// 1. Commit across three shards at the highest prepare timestamp
// 2. A shard that already aborted makes the whole transaction abort
// 3. Retried commits after Done are answered without new participant RPCs
// 4. Concurrent retries share one coordinator
// 5. Prepare deadline forces an abort with ExceededTimeLimit
// 6. A prepare reply without a timestamp aborts with InvalidPrepareResponse
// 7. Transient prepare and store failures are retried transparently
// 8. serverStatus invariants hold under concurrent load
// 9. The sled-backed store drives the same protocol

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use common::{fast_config, new_key, wait_until, Cluster};
use txcoord_core::{
    CommitDecision, CoordinatorConfig, CoordinatorDecision, ErrorCode, LogicalTimestamp, Status,
};
use txcoord_state::{
    CoordinatorState, InMemoryCoordinatorStore, InjectedFault, ParticipantCommand,
    SledCoordinatorStore, StoreOp,
};

const SHARDS: [&str; 3] = ["shard0", "shard1", "shard2"];

// ====== COMMIT PATH ======

#[test_log::test(tokio::test)]
async fn test_commits_at_max_prepare_timestamp() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(decision.is_commit());
    assert_eq!(decision.commit_timestamp(), Some(LogicalTimestamp::new(30, 1)));
    assert_ok!(decision.to_command_result());
    for participant in cluster.participants.values() {
        assert_eq!(participant.find(common::NAMESPACE).len(), 1);
        assert!(participant.clock() >= LogicalTimestamp::new(30, 1));
    }
    assert_eq!(cluster.calls(ParticipantCommand::Prepare), 3);
    assert_eq!(cluster.calls(ParticipantCommand::Commit), 3);
    assert_eq!(cluster.calls(ParticipantCommand::Abort), 0);

    cluster.wait_for_store_drained().await;
}

#[test_log::test(tokio::test)]
async fn test_already_aborted_shard_aborts_everywhere() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);
    cluster.participant("shard2").abort(&key).unwrap();

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert_eq!(decision.kind(), CommitDecision::Aborted);
    let err = decision.to_command_result().unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSuchTransaction);
    assert!(err.reason.contains("shard2"));

    assert_eq!(cluster.find_everywhere(), 0);
    assert_eq!(cluster.calls(ParticipantCommand::Commit), 0);
    assert_eq!(cluster.calls(ParticipantCommand::Abort), 3);
    assert!(!cluster.participant("shard0").is_prepared(&key));
    assert!(!cluster.participant("shard1").is_prepared(&key));

    cluster.wait_for_store_drained().await;
}

// ====== IDEMPOTENCE ======

#[test_log::test(tokio::test)]
async fn test_retry_after_done_uses_cached_decision() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);

    let first = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();
    let coordinator = node.catalog.get(&key).unwrap();
    coordinator.wait_for_end().await;
    assert_eq!(coordinator.state(), CoordinatorState::Done);
    let calls_before = cluster.total_calls();

    let second = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(first.matches(&second));
    assert_eq!(cluster.total_calls(), calls_before);
    assert_eq!(cluster.find_everywhere(), 3);
}

#[test_log::test(tokio::test)]
async fn test_retry_after_eviction_uses_history() {
    let config = CoordinatorConfig { completed_retention_ms: 0, ..fast_config() };
    let cluster = Cluster::with_store(&SHARDS, Arc::new(InMemoryCoordinatorStore::new()), config);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);
    cluster.participant("shard1").abort(&key).unwrap();

    let first = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();
    let catalog = node.catalog.clone();
    wait_until("coordinator evicted", || {
        let catalog = catalog.clone();
        async move { catalog.get(&key).is_none() }
    })
    .await;
    let calls_before = cluster.total_calls();

    let second = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(first.matches(&second));
    assert_eq!(second.kind(), CommitDecision::Aborted);
    assert_eq!(cluster.total_calls(), calls_before);
    assert!(node.catalog.get_decision(&key).is_some());
}

#[test_log::test(tokio::test)]
async fn test_concurrent_retries_share_one_coordinator() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);

    let waits = (0..5).map(|_| {
        let catalog = node.catalog.clone();
        let shards = cluster.shard_ids();
        tokio::spawn(async move { catalog.coordinate_commit(key, shards, None).await })
    });
    let decisions: Vec<CoordinatorDecision> = futures::future::join_all(waits)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(decisions.iter().all(|d| d.matches(&decisions[0])));
    assert_eq!(cluster.calls(ParticipantCommand::Prepare), 3);
    assert_eq!(node.metrics.snapshot().two_phase_commit_coordinator.total_created, 1);
}

// ====== ABORT CAUSES ======

#[test_log::test(tokio::test)]
async fn test_prepare_deadline_aborts() {
    let config = CoordinatorConfig { prepare_deadline_ms: Some(50), ..fast_config() };
    let cluster = Cluster::with_store(&SHARDS, Arc::new(InMemoryCoordinatorStore::new()), config);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);
    cluster.proxy("shard0").inject(ParticipantCommand::Prepare, InjectedFault::Stall);

    let coordinator = match node.catalog.create_or_get(key, cluster.shard_ids()).unwrap() {
        txcoord_state::CoordinatorLookup::Live(coordinator) => coordinator,
        txcoord_state::CoordinatorLookup::Completed(_) => panic!("nothing completed yet"),
    };
    assert!(coordinator.report().deadline.is_some());

    let decision = coordinator.wait_for_outcome(None).await.unwrap();
    let err = decision.to_command_result().unwrap_err();
    assert_eq!(err.code, ErrorCode::ExceededTimeLimit);

    // The stalled shard never prepared; the others did and were rolled back
    assert!(!cluster.participant("shard0").is_prepared(&key));
    assert!(!cluster.participant("shard1").is_prepared(&key));
    assert_eq!(cluster.find_everywhere(), 0);
}

#[test_log::test(tokio::test)]
async fn test_prepare_without_timestamp_aborts() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);
    cluster
        .proxy("shard1")
        .inject(ParticipantCommand::Prepare, InjectedFault::OmitPrepareTimestamp);

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    let err = decision.to_command_result().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidPrepareResponse);
    assert_eq!(cluster.find_everywhere(), 0);
}

// ====== TRANSIENT FAILURES ======

#[test_log::test(tokio::test)]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(InMemoryCoordinatorStore::new());
    store.inject_failures(StoreOp::Insert, 2);
    store.inject_failures(StoreOp::UpdateDecision, 1);
    store.inject_failures(StoreOp::Delete, 3);
    let cluster = Cluster::with_store(&SHARDS, store.clone(), fast_config());
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);

    let unreachable = Status::new(ErrorCode::HostUnreachable, "connection refused");
    cluster
        .proxy("shard1")
        .inject(ParticipantCommand::Prepare, InjectedFault::Fail(unreachable.clone()));
    cluster
        .proxy("shard2")
        .inject(ParticipantCommand::Commit, InjectedFault::Fail(unreachable));

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(decision.is_commit());
    assert_eq!(cluster.proxy("shard1").calls(ParticipantCommand::Prepare), 2);
    assert_eq!(cluster.proxy("shard2").calls(ParticipantCommand::Commit), 2);
    assert_eq!(cluster.find_everywhere(), 3);

    cluster.wait_for_store_drained().await;
    assert_eq!(store.attempts(StoreOp::Insert), 3);
    assert_eq!(store.attempts(StoreOp::UpdateDecision), 2);
    assert_eq!(store.attempts(StoreOp::Delete), 4);
}

#[test_log::test(tokio::test)]
async fn test_commit_accepts_already_committed_ack() {
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);
    cluster.proxy("shard0").inject(
        ParticipantCommand::Commit,
        InjectedFault::Fail(Status::new(ErrorCode::TransactionCommitted, "already committed")),
    );

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(decision.is_commit());
    assert_eq!(cluster.proxy("shard0").calls(ParticipantCommand::Commit), 1);
}

// ====== METRICS ======

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_server_status_invariants_under_load() {
    const TXNS: usize = 20;
    let cluster = Cluster::new(&SHARDS);
    let node = cluster.primary(None).await;

    let keys: Vec<_> = (0..TXNS).map(|_| new_key()).collect();
    for (i, key) in keys.iter().enumerate() {
        cluster.insert_everywhere(key);
        if i % 4 == 0 {
            cluster.participant("shard1").abort(key).unwrap();
        }
    }

    let metrics = node.metrics.clone();
    let sampler = tokio::spawn(async move {
        let mut samples = 0usize;
        let mut violations = 0usize;
        for _ in 0..200 {
            samples += 1;
            if !metrics.snapshot().transactions.check_invariants().is_empty() {
                violations += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        (samples, violations)
    });

    let commits = keys.iter().map(|key| {
        let catalog = node.catalog.clone();
        let shards = cluster.shard_ids();
        let key = *key;
        tokio::spawn(async move { catalog.coordinate_commit(key, shards, None).await })
    });
    for joined in futures::future::join_all(commits).await {
        joined.unwrap().unwrap();
    }

    let (samples, violations) = sampler.await.unwrap();
    assert!(violations * 20 <= samples, "{} of {} samples inconsistent", violations, samples);

    for key in &keys {
        node.catalog.get(key).unwrap().wait_for_end().await;
    }
    let status = node.metrics.snapshot();
    assert!(status.transactions.check_invariants().is_empty());
    assert_eq!(status.transactions.current_open, 0);
    assert_eq!(status.transactions.total_started, TXNS as u64);
    assert_eq!(status.transactions.total_committed, 15);
    assert_eq!(status.transactions.total_aborted, 5);
    assert_eq!(status.two_phase_commit_coordinator.total_started_two_phase_commit, TXNS as u64);
    assert!(status
        .two_phase_commit_coordinator
        .current_in_state
        .values()
        .all(|count| *count == 0));
}

// ====== DURABLE STORE ======

#[test_log::test(tokio::test)]
async fn test_commit_over_sled_store() {
    let store = Arc::new(SledCoordinatorStore::temporary().unwrap());
    let cluster = Cluster::with_store(&SHARDS, store, fast_config());
    let node = cluster.primary(None).await;
    let key = new_key();
    cluster.insert_everywhere(&key);

    let decision = node
        .catalog
        .coordinate_commit(key, cluster.shard_ids(), None)
        .await
        .unwrap();

    assert!(decision.is_commit());
    assert_eq!(cluster.find_everywhere(), 3);
    cluster.wait_for_store_drained().await;
}
