// === Operation contexts (killOp / currentOp) ===
pub mod op_context;

// === Participants ===
pub mod participant;
pub mod shard;

// === Durable coordinator state ===
pub mod store;

// === Coordination ===
pub mod metrics;
pub mod coordinator;
pub mod catalog;
pub mod recovery;

pub use op_context::{OperationContext, OperationInfo, OperationRegistry};
pub use participant::{
    send_decision_to_shard, send_prepare_to_shard, ParticipantProxy, ParticipantVote,
    PrepareResponse, RetryEnv, ShardRegistry, StaticShardRegistry,
};
pub use shard::{InjectedFault, LocalParticipantProxy, ParticipantCommand, ShardTransactionParticipant};
pub use store::{
    CoordinatorDocumentStore, InMemoryCoordinatorStore, SledCoordinatorStore, StoreError, StoreOp,
};
pub use metrics::{
    CoordinatorMetrics, CoordinatorStats, EndOutcome, ServerStatusSection, TransactionsSection,
    TwoPhaseCommitSection,
};
pub use coordinator::{
    CoordinatorReport, CoordinatorServices, CoordinatorState, NoopStepHook, StepHook,
    TransactionCoordinator,
};
pub use catalog::{CatalogStatus, CoordinatorCatalog, CoordinatorLookup};
pub use recovery::{RecoveryReport, RecoveryService};
