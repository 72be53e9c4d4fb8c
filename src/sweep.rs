//! Daily sweep: fans out check runs over the active items.
//!
//! Sequential batches bound the working set; a global semaphore bounds
//! in-flight checks. There is no per-item retry; failures live in the run
//! records and surface through the API.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::checker::CheckRunner;
use crate::models::CheckStatus;
use crate::storage::TrackerStore;

pub const MAX_SWEEP_ITEMS: usize = 200;
pub const SWEEP_BATCH_SIZE: usize = 25;
pub const SWEEP_CONCURRENCY: usize = 3;

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub checked: usize,
    pub success: usize,
    pub failed: usize,
    pub needs_review: usize,
}

pub struct DailySweep {
    runner: Arc<CheckRunner>,
    store: Arc<TrackerStore>,
}

impl DailySweep {
    pub fn new(runner: Arc<CheckRunner>, store: Arc<TrackerStore>) -> Self {
        Self { runner, store }
    }

    pub async fn run(&self) -> Result<SweepSummary> {
        let items = self.store.list_active_items(MAX_SWEEP_ITEMS)?;
        info!("🔄 Daily sweep starting over {} items", items.len());

        let semaphore = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
        let mut summary = SweepSummary::default();

        for batch in items.chunks(SWEEP_BATCH_SIZE) {
            let mut tasks = JoinSet::new();
            for item in batch {
                let runner = self.runner.clone();
                let semaphore = semaphore.clone();
                let item_id = item.id.clone();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("sweep semaphore closed");
                    runner.run_check_for_item(&item_id).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => {
                        summary.checked += 1;
                        match result.status {
                            CheckStatus::Success => summary.success += 1,
                            CheckStatus::Failed => summary.failed += 1,
                            CheckStatus::NeedsReview => summary.needs_review += 1,
                        }
                    }
                    Err(e) => {
                        warn!("sweep check task panicked: {}", e);
                        summary.checked += 1;
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            "✅ Daily sweep done: {} checked, {} ok, {} failed, {} need review",
            summary.checked, summary.success, summary.failed, summary.needs_review
        );
        Ok(summary)
    }
}
