use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::Filter;

use crate::commands::CommandSurface;
use crate::error::WireError;
use crate::wire::ok_reply;

fn with_surface(
    surface: Arc<CommandSurface>,
) -> impl Filter<Extract = (Arc<CommandSurface>,), Error = Infallible> + Clone {
    warp::any().map(move || surface.clone())
}

/// All admin routes:
/// `GET /health`, `GET /admin/currentOp`, `GET /admin/serverStatus`,
/// `POST /admin/<command>` with a JSON body
pub fn routes(
    surface: Arc<CommandSurface>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&ok_reply(json!({ "status": "running" }))));

    let current_op = warp::path!("admin" / "currentOp")
        .and(warp::get())
        .and(with_surface(surface.clone()))
        .map(|surface: Arc<CommandSurface>| warp::reply::json(&ok_reply(surface.current_op())));

    let server_status = warp::path!("admin" / "serverStatus")
        .and(warp::get())
        .and(with_surface(surface.clone()))
        .map(|surface: Arc<CommandSurface>| warp::reply::json(&ok_reply(surface.server_status())));

    let command = warp::path!("admin" / String)
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024 * 1024))
        .and(warp::body::json())
        .and(with_surface(surface))
        .and_then(|name: String, body: Value, surface: Arc<CommandSurface>| async move {
            let reply = surface.run_command(&name, body).await;
            Ok::<_, Infallible>(warp::reply::json(&reply))
        });

    health
        .or(current_op)
        .or(server_status)
        .or(command)
        .with(warp::log("txcoord_rpc"))
}

/// Bind the admin endpoint; the returned future serves until `shutdown` resolves
pub fn bind(
    surface: Arc<CommandSurface>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), WireError> {
    let (bound, server) =
        warp::serve(routes(surface)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!("Transaction coordinator admin endpoint listening on http://{}", bound);
    Ok((bound, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use txcoord_core::{CoordinatorConfig, LogicalSessionId, ShardId};
    use txcoord_state::{
        CoordinatorCatalog, CoordinatorServices, InMemoryCoordinatorStore, LocalParticipantProxy,
        RecoveryService, ShardTransactionParticipant, StaticShardRegistry,
    };

    async fn surface() -> Arc<CommandSurface> {
        let participant = Arc::new(ShardTransactionParticipant::new(ShardId::from("shard0")));
        let registry =
            StaticShardRegistry::new().with_proxy(Arc::new(LocalParticipantProxy::new(participant.clone())));
        let services = CoordinatorServices::new(
            Arc::new(InMemoryCoordinatorStore::new()),
            Arc::new(registry),
            CoordinatorConfig::default(),
        );
        let recovery = Arc::new(RecoveryService::new(CoordinatorCatalog::new(services)));
        recovery.on_become_primary().await.unwrap();
        Arc::new(CommandSurface::new(recovery, participant))
    }

    fn body<B: AsRef<[u8]>>(res: warp::http::Response<B>) -> Value {
        serde_json::from_slice(res.body().as_ref()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let api = routes(surface().await);
        let res = warp::test::request().method("GET").path("/health").reply(&api).await;

        assert_eq!(res.status(), 200);
        assert_eq!(body(res)["ok"], 1);
    }

    #[tokio::test]
    async fn test_post_command_round_trip() {
        let api = routes(surface().await);
        let lsid = LogicalSessionId::generate();

        let res = warp::test::request()
            .method("POST")
            .path("/admin/insert")
            .json(&json!({ "lsid": lsid, "txnNumber": 0, "ns": "test.user", "documents": [{ "_id": 1 }] }))
            .reply(&api)
            .await;
        assert_eq!(body(res)["n"], 1);

        let res = warp::test::request()
            .method("POST")
            .path("/admin/coordinateCommitTransaction")
            .json(&json!({ "lsid": lsid, "txnNumber": 0, "participants": ["shard0"] }))
            .reply(&api)
            .await;
        assert_eq!(body(res)["ok"], 1);

        let res = warp::test::request()
            .method("POST")
            .path("/admin/find")
            .json(&json!({ "ns": "test.user" }))
            .reply(&api)
            .await;
        assert_eq!(body(res)["documents"][0]["_id"], 1);
    }

    #[tokio::test]
    async fn test_current_op_and_server_status() {
        let api = routes(surface().await);

        let res = warp::test::request().method("GET").path("/admin/currentOp").reply(&api).await;
        let reply = body(res);
        assert_eq!(reply["ok"], 1);
        assert!(reply["inprog"].as_array().unwrap().is_empty());

        let res = warp::test::request().method("GET").path("/admin/serverStatus").reply(&api).await;
        let reply = body(res);
        assert_eq!(reply["transactions"]["totalStarted"], 0);
        assert_eq!(reply["twoPhaseCommitCoordinator"]["totalCreated"], 0);
    }

    #[tokio::test]
    async fn test_command_error_is_in_body() {
        let api = routes(surface().await);
        let res = warp::test::request()
            .method("POST")
            .path("/admin/abortTransaction")
            .json(&json!({ "lsid": LogicalSessionId::generate(), "txnNumber": 3 }))
            .reply(&api)
            .await;

        assert_eq!(res.status(), 200);
        let reply = body(res);
        assert_eq!(reply["ok"], 0);
        assert_eq!(reply["code"], 251);
    }
}
