// Durable coordinator documents
//
// SAFETY INVARIANTS:
// 1. A document's participant list never changes after insert
// 2. A decision is written at most once; re-writing a matching decision is a no-op
// 3. Every mutation is durable (flushed) before the call returns
// 4. Delete is idempotent

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use log::{debug, info};

use txcoord_core::{
    CoordinatorDecision, CoordinatorDocument, CoordinatorKey, ErrorCode, ShardId, Status,
};

pub const COORDINATOR_TREE: &str = "transaction_coordinators";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordinator document {0} already exists with a different participant list")]
    DuplicateKey(CoordinatorKey),

    #[error("no coordinator document for {0}")]
    NoSuchKey(CoordinatorKey),

    #[error("coordinator document {key} already has decision {existing}")]
    WriteConflict {
        key: CoordinatorKey,
        existing: CoordinatorDecision,
    },

    #[error("coordinator store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("document codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid coordinator document: {0}")]
    Invalid(Status),
}

impl StoreError {
    /// Failures where re-issuing the same write may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Storage(_))
    }
}

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            StoreError::NoSuchKey(_) => ErrorCode::NoSuchKey,
            StoreError::WriteConflict { .. } => ErrorCode::WriteConflict,
            StoreError::Unavailable(_) => ErrorCode::NotWritablePrimary,
            StoreError::Storage(_) | StoreError::Codec(_) => ErrorCode::InternalError,
            StoreError::Invalid(status) => status.code,
        };
        Status::new(code, err.to_string())
    }
}

/// Majority-durable collection of coordinator documents
#[async_trait]
pub trait CoordinatorDocumentStore: Send + Sync {
    /// Write the participant list. Idempotent for an identical participant set.
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<(), StoreError>;

    /// Record the decision on an existing document
    async fn update_decision(
        &self,
        key: &CoordinatorKey,
        decision: &CoordinatorDecision,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &CoordinatorKey) -> Result<(), StoreError>;

    /// All documents not yet deleted, in key order
    async fn scan_incomplete(&self) -> Result<Vec<CoordinatorDocument>, StoreError>;

    async fn find(&self, key: &CoordinatorKey) -> Result<Option<CoordinatorDocument>, StoreError>;
}

fn check_insert(existing: &CoordinatorDocument, doc: &CoordinatorDocument) -> Result<(), StoreError> {
    if existing.same_participants(&doc.participants) {
        Ok(())
    } else {
        Err(StoreError::DuplicateKey(doc.id))
    }
}

/// Apply a decision to a stored document. Ok(false) when nothing changes.
fn apply_decision(
    doc: &mut CoordinatorDocument,
    decision: &CoordinatorDecision,
) -> Result<bool, StoreError> {
    match doc.decision() {
        Some(existing) if existing.matches(decision) => Ok(false),
        Some(existing) => Err(StoreError::WriteConflict { key: doc.id, existing }),
        None => {
            doc.set_decision(decision);
            Ok(true)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Insert,
    UpdateDecision,
    Delete,
    Scan,
}

#[derive(Default)]
struct InMemoryState {
    docs: BTreeMap<CoordinatorKey, CoordinatorDocument>,
    failures: HashMap<StoreOp, u32>,
    writes: HashMap<StoreOp, u64>,
}

impl InMemoryState {
    fn begin(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.writes.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

/// Process-local store. Shared across simulated failovers in tests, so a
/// "new primary" sees whatever the old one made durable.
#[derive(Default)]
pub struct InMemoryCoordinatorStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryCoordinatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls of `op` with a retriable error
    pub fn inject_failures(&self, op: StoreOp, count: u32) {
        self.state.lock().failures.insert(op, count);
    }

    /// Number of times `op` was attempted, including injected failures
    pub fn attempts(&self, op: StoreOp) -> u64 {
        self.state.lock().writes.get(&op).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CoordinatorDocumentStore for InMemoryCoordinatorStore {
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<(), StoreError> {
        doc.validate().map_err(StoreError::Invalid)?;
        let mut state = self.state.lock();
        state.begin(StoreOp::Insert)?;
        match state.docs.get(&doc.id) {
            Some(existing) => check_insert(existing, doc),
            None => {
                state.docs.insert(doc.id, doc.clone());
                Ok(())
            }
        }
    }

    async fn update_decision(
        &self,
        key: &CoordinatorKey,
        decision: &CoordinatorDecision,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::UpdateDecision)?;
        let doc = state.docs.get_mut(key).ok_or(StoreError::NoSuchKey(*key))?;
        apply_decision(doc, decision).map(|_| ())
    }

    async fn delete(&self, key: &CoordinatorKey) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Delete)?;
        state.docs.remove(key);
        Ok(())
    }

    async fn scan_incomplete(&self) -> Result<Vec<CoordinatorDocument>, StoreError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Scan)?;
        Ok(state.docs.values().cloned().collect())
    }

    async fn find(&self, key: &CoordinatorKey) -> Result<Option<CoordinatorDocument>, StoreError> {
        Ok(self.state.lock().docs.get(key).cloned())
    }
}

/// On-disk record. The wire document skips absent fields, which a
/// non-self-describing codec cannot round-trip, so sled gets its own layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    key: CoordinatorKey,
    participants: Vec<ShardId>,
    decision: Option<CoordinatorDecision>,
}

impl StoredDocument {
    fn from_document(doc: &CoordinatorDocument) -> Self {
        StoredDocument {
            key: doc.id,
            participants: doc.participants.clone(),
            decision: doc.decision(),
        }
    }

    fn into_document(self) -> Result<CoordinatorDocument, StoreError> {
        let mut doc = CoordinatorDocument::new(self.key, self.participants)
            .map_err(StoreError::Invalid)?;
        if let Some(decision) = self.decision {
            doc.set_decision(&decision);
        }
        Ok(doc)
    }
}

/// sled-backed store: one tree, compare-and-swap writes, flush per mutation
pub struct SledCoordinatorStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledCoordinatorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(COORDINATOR_TREE)?;
        info!(
            "Opened coordinator store at {} ({} documents)",
            path.as_ref().display(),
            tree.len()
        );
        Ok(SledCoordinatorStore { db, tree })
    }

    /// Ephemeral store, removed when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(COORDINATOR_TREE)?;
        Ok(SledCoordinatorStore { db, tree })
    }

    /// lsid bytes then txnNumber big-endian with the sign bit flipped, so
    /// byte order equals key order
    fn encode_key(key: &CoordinatorKey) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(key.lsid.0.as_bytes());
        out[16..].copy_from_slice(&((key.txn_number.0 as u64) ^ (1 << 63)).to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<CoordinatorDocument, StoreError> {
        let stored: StoredDocument = bincode::deserialize(bytes)?;
        stored.into_document()
    }

    fn encode(doc: &CoordinatorDocument) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(&StoredDocument::from_document(doc))?)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let bytes = self.db.flush_async().await?;
        debug!("Flushed {} bytes of coordinator state", bytes);
        Ok(())
    }
}

#[async_trait]
impl CoordinatorDocumentStore for SledCoordinatorStore {
    async fn insert(&self, doc: &CoordinatorDocument) -> Result<(), StoreError> {
        doc.validate().map_err(StoreError::Invalid)?;
        let key = Self::encode_key(&doc.id);
        let value = Self::encode(doc)?;

        match self.tree.compare_and_swap(key, None as Option<&[u8]>, Some(value))? {
            Ok(()) => self.flush().await,
            Err(conflict) => match conflict.current {
                Some(current) => check_insert(&Self::decode(&current)?, doc),
                None => Err(StoreError::Unavailable(format!(
                    "concurrent insert race on {}",
                    doc.id
                ))),
            },
        }
    }

    async fn update_decision(
        &self,
        key: &CoordinatorKey,
        decision: &CoordinatorDecision,
    ) -> Result<(), StoreError> {
        let raw_key = Self::encode_key(key);
        loop {
            let current = self.tree.get(raw_key)?.ok_or(StoreError::NoSuchKey(*key))?;
            let mut doc = Self::decode(&current)?;
            if !apply_decision(&mut doc, decision)? {
                return Ok(());
            }

            let updated = Self::encode(&doc)?;
            match self.tree.compare_and_swap(raw_key, Some(current), Some(updated))? {
                Ok(()) => return self.flush().await,
                Err(_) => continue,
            }
        }
    }

    async fn delete(&self, key: &CoordinatorKey) -> Result<(), StoreError> {
        self.tree.remove(Self::encode_key(key))?;
        self.flush().await
    }

    async fn scan_incomplete(&self) -> Result<Vec<CoordinatorDocument>, StoreError> {
        self.tree
            .iter()
            .values()
            .map(|value| Self::decode(&value?))
            .collect()
    }

    async fn find(&self, key: &CoordinatorKey) -> Result<Option<CoordinatorDocument>, StoreError> {
        match self.tree.get(Self::encode_key(key))? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }
}
