// Coordinator recovery on step-up
//
// Every coordinator document still in the store belongs to a transaction
// whose coordinator never reached Done. On becoming primary each one is
// handed to the catalog, which resumes it from its durable step.

use std::sync::Arc;
use log::{error, info, warn};

use txcoord_core::{CoordinatorDocument, CoordinatorKey, ErrorCode, Status};

use crate::catalog::{CatalogStatus, CoordinatorCatalog};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: Vec<CoordinatorKey>,
    pub skipped: Vec<CoordinatorKey>,
}

pub struct RecoveryService {
    catalog: Arc<CoordinatorCatalog>,
}

impl RecoveryService {
    pub fn new(catalog: Arc<CoordinatorCatalog>) -> Self {
        RecoveryService { catalog }
    }

    pub fn catalog(&self) -> &Arc<CoordinatorCatalog> {
        &self.catalog
    }

    /// Step up: scan incomplete documents, resume each, then accept commits
    pub async fn on_become_primary(&self) -> Result<RecoveryReport, Status> {
        self.catalog.begin_step_up();

        let docs = match self.scan().await {
            Ok(docs) => docs,
            Err(status) => {
                error!("Coordinator recovery failed, staying stepped down: {}", status);
                self.catalog.on_step_down();
                return Err(status);
            }
        };

        let mut report = RecoveryReport::default();
        for doc in docs {
            let key = doc.id;
            match self.catalog.recover_or_get(doc) {
                Ok(_) => report.recovered.push(key),
                Err(status) => {
                    warn!("Skipping unrecoverable coordinator document {}: {}", key, status);
                    report.skipped.push(key);
                }
            }
        }

        self.catalog.finish_step_up();
        info!(
            "Coordinator recovery complete: {} resumed, {} skipped",
            report.recovered.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    pub fn on_step_down(&self) -> usize {
        self.catalog.on_step_down()
    }

    async fn scan(&self) -> Result<Vec<CoordinatorDocument>, Status> {
        let services = self.catalog.services();
        let mut attempt: u32 = 0;
        loop {
            if self.catalog.status() != CatalogStatus::Recovering {
                return Err(Status::new(
                    ErrorCode::NotWritablePrimary,
                    "stepped down during coordinator recovery",
                ));
            }
            match services.store.scan_incomplete().await {
                Ok(docs) => return Ok(docs),
                Err(err) if err.is_retriable() => {
                    warn!("Coordinator document scan failed, attempt {}: {}", attempt, err);
                    tokio::time::sleep(services.config.backoff_for_attempt(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(Status::from(err)),
            }
        }
    }
}
