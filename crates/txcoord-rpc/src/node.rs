// Coordinator node assembly
//
// One process hosts one shard's participant plus the coordinator for
// transactions routed to it. Peers are reached over their admin endpoints.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use txcoord_core::{ConfigError, NodeConfig, ShardId, Status};
use txcoord_state::{
    CoordinatorCatalog, CoordinatorDocumentStore, CoordinatorServices, InMemoryCoordinatorStore,
    LocalParticipantProxy, RecoveryReport, RecoveryService, ShardTransactionParticipant,
    SledCoordinatorStore, StaticShardRegistry, StoreError,
};

use crate::client::HttpParticipantProxy;
use crate::commands::CommandSurface;
use crate::error::WireError;
use crate::server;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open coordinator store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("step up failed: {0}")]
    StepUp(Status),
}

pub struct CoordinatorNode {
    config: NodeConfig,
    surface: Arc<CommandSurface>,
    recovery: Arc<RecoveryService>,
}

impl CoordinatorNode {
    /// Open the store and wire up participants. The node starts stepped down.
    pub fn build(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let store: Arc<dyn CoordinatorDocumentStore> = match &config.data_dir {
            Some(dir) => {
                info!("Opening coordinator store at {}", dir.display());
                Arc::new(SledCoordinatorStore::open(dir)?)
            }
            None => {
                warn!("No data_dir configured, coordinator documents will not survive a restart");
                Arc::new(InMemoryCoordinatorStore::new())
            }
        };

        let local = config.shard();
        let participant = Arc::new(ShardTransactionParticipant::new(local.clone()));
        let registry = build_registry(&config, participant.clone())?;
        info!("Shard registry: {:?}", registry.shard_ids());

        let services = CoordinatorServices::new(store, Arc::new(registry), config.coordinator.clone());
        let catalog = CoordinatorCatalog::new(services);
        let recovery = Arc::new(RecoveryService::new(catalog));
        let surface = Arc::new(CommandSurface::new(recovery.clone(), participant));

        Ok(CoordinatorNode { config, surface, recovery })
    }

    pub fn surface(&self) -> &Arc<CommandSurface> {
        &self.surface
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, NodeError> {
        self.config.listen_addr.parse().map_err(|e| {
            NodeError::Config(ConfigError::Invalid(format!(
                "listen_addr '{}': {}",
                self.config.listen_addr, e
            )))
        })
    }

    pub async fn step_up(&self) -> Result<RecoveryReport, NodeError> {
        self.recovery.on_become_primary().await.map_err(NodeError::StepUp)
    }

    pub fn step_down(&self) -> usize {
        self.recovery.on_step_down()
    }

    /// Step up, then serve until `shutdown` resolves; step down on the way out
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), NodeError> {
        let report = self.step_up().await?;
        info!(
            "🚀 Shard {} coordinating ({} transactions resumed)",
            self.config.shard_id,
            report.recovered.len()
        );

        let (_, serving) = server::bind(self.surface.clone(), self.listen_addr()?, shutdown)?;
        serving.await;

        let abandoned = self.step_down();
        info!("Shard {} stopped, {} coordinators handed to the next primary", self.config.shard_id, abandoned);
        Ok(())
    }
}

/// Local proxy for this node's own shard, HTTP proxies for every peer
fn build_registry(
    config: &NodeConfig,
    participant: Arc<ShardTransactionParticipant>,
) -> Result<StaticShardRegistry, NodeError> {
    let local = config.shard();
    let mut registry = StaticShardRegistry::new();
    registry.add(Arc::new(LocalParticipantProxy::new(participant)));

    for (name, url) in &config.shards {
        let shard = ShardId::new(name.as_str());
        if shard == local {
            continue;
        }
        let proxy = HttpParticipantProxy::new(shard, url, config.coordinator.rpc_timeout())?;
        registry.add(Arc::new(proxy));
    }
    Ok(registry)
}
