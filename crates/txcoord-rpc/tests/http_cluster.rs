// Two shards talking over their HTTP admin endpoints
//
// TEST COVERAGE:
// 1. coordinateCommitTransaction commits across a local and a remote shard
// 2. A remote shard that aborted first turns the commit into NoSuchTransaction
// 3. currentOp and serverStatus are served over HTTP

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

use txcoord_core::{CoordinatorConfig, ErrorCode, LogicalSessionId, ShardId};
use txcoord_rpc::{server, AdminClient, CommandSurface, HttpParticipantProxy, WireError};
use txcoord_state::{
    CoordinatorCatalog, CoordinatorServices, InMemoryCoordinatorStore, LocalParticipantProxy,
    ParticipantProxy, RecoveryService, ShardTransactionParticipant, StaticShardRegistry,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct RunningShard {
    client: AdminClient,
    url: String,
    _stop: oneshot::Sender<()>,
}

/// Serve `name` on an ephemeral port with `remotes` reachable over HTTP
async fn start_shard(name: &str, remotes: &[(&str, &str)]) -> RunningShard {
    let participant = Arc::new(ShardTransactionParticipant::new(ShardId::from(name)));
    let mut registry = StaticShardRegistry::new();
    registry.add(Arc::new(LocalParticipantProxy::new(participant.clone())));
    for (shard, url) in remotes {
        let proxy: Arc<dyn ParticipantProxy> =
            Arc::new(HttpParticipantProxy::new(ShardId::from(*shard), url, TIMEOUT).unwrap());
        registry.add(proxy);
    }

    let config = CoordinatorConfig {
        retry_initial_backoff_ms: 5,
        retry_max_backoff_ms: 50,
        ..CoordinatorConfig::default()
    };
    let services = CoordinatorServices::new(
        Arc::new(InMemoryCoordinatorStore::new()),
        Arc::new(registry),
        config,
    );
    let recovery = Arc::new(RecoveryService::new(CoordinatorCatalog::new(services)));
    recovery.on_become_primary().await.unwrap();
    let surface = Arc::new(CommandSurface::new(recovery, participant));

    let (stop, stopped) = oneshot::channel::<()>();
    let (addr, serving) = server::bind(surface, ([127, 0, 0, 1], 0).into(), async move {
        let _ = stopped.await;
    })
    .unwrap();
    tokio::spawn(serving);

    let url = format!("http://{}", addr);
    RunningShard {
        client: AdminClient::new(&url, TIMEOUT).unwrap(),
        url,
        _stop: stop,
    }
}

async fn insert(shard: &RunningShard, lsid: LogicalSessionId, id: i64) {
    let body = json!({
        "lsid": lsid,
        "txnNumber": 0,
        "ns": "test.user",
        "documents": [{ "_id": id }],
    });
    assert_ok!(shard.client.run_command("insert", &body).await);
}

async fn count(shard: &RunningShard) -> usize {
    let reply = shard
        .client
        .run_command("find", &json!({ "ns": "test.user" }))
        .await
        .unwrap();
    reply["documents"].as_array().map(Vec::len).unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_across_http_participant() {
    let shard1 = start_shard("shard1", &[]).await;
    let shard0 = start_shard("shard0", &[("shard1", shard1.url.as_str())]).await;
    let lsid = LogicalSessionId::generate();
    insert(&shard0, lsid, 0).await;
    insert(&shard1, lsid, 1).await;

    let reply = shard0
        .client
        .run_command(
            "coordinateCommitTransaction",
            &json!({ "lsid": lsid, "txnNumber": 0, "participants": ["shard0", "shard1"] }),
        )
        .await
        .unwrap();

    assert!(reply["commitTimestamp"].is_object());
    assert_eq!(count(&shard0).await, 1);
    assert_eq!(count(&shard1).await, 1);

    let current = shard0.client.current_op().await.unwrap();
    let inprog = current["inprog"].as_array().unwrap();
    assert!(inprog.iter().any(|op| op["desc"] == "TransactionCoordinator"));

    let status = shard0.client.server_status().await.unwrap();
    assert_eq!(status["twoPhaseCommitCoordinator"]["totalCreated"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_abort_fails_commit() {
    let shard1 = start_shard("shard1", &[]).await;
    let shard0 = start_shard("shard0", &[("shard1", shard1.url.as_str())]).await;
    let lsid = LogicalSessionId::generate();
    insert(&shard0, lsid, 0).await;
    insert(&shard1, lsid, 1).await;
    assert_ok!(
        shard1
            .client
            .run_command("abortTransaction", &json!({ "lsid": lsid, "txnNumber": 0 }))
            .await
    );

    let result = shard0
        .client
        .run_command(
            "coordinateCommitTransaction",
            &json!({ "lsid": lsid, "txnNumber": 0, "participants": ["shard0", "shard1"] }),
        )
        .await;

    let err = assert_err!(result);
    match err {
        WireError::Command(status) => assert_eq!(status.code, ErrorCode::NoSuchTransaction),
        other => panic!("expected a command error, got {}", other),
    }
    assert_eq!(count(&shard0).await, 0);
    assert_eq!(count(&shard1).await, 0);
}

#[tokio::test]
async fn test_health_endpoint() {
    let shard = start_shard("shard0", &[]).await;
    let reply = shard.client.health().await.unwrap();
    assert_eq!(reply["status"], "running");
}
