//! Per-item check runner.
//!
//! Every invocation creates exactly one durable CheckRun (pessimistically
//! FAILED), performs the extraction, and finalizes the run. Snapshots are
//! only written on success; deltas are computed against the persisted
//! previous snapshot, so detection survives restarts.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::extract::{Extractor, PipelineOptions};
use crate::models::{
    error_codes, now_ts, CheckResult, CheckRun, CheckStatus, Config, ExtractionAttempt,
    PriceSnapshot, TrackedItem, NEEDS_REVIEW_REASONS,
};
use crate::notifier::Notifier;
use crate::storage::TrackerStore;

const MAX_AI_HINTS: usize = 4;

pub struct CheckRunner {
    store: Arc<TrackerStore>,
    pipeline: Arc<dyn Extractor>,
    notifier: Arc<Notifier>,
    config: Config,
}

impl CheckRunner {
    pub fn new(
        store: Arc<TrackerStore>,
        pipeline: Arc<dyn Extractor>,
        notifier: Arc<Notifier>,
        config: Config,
    ) -> Self {
        Self {
            store,
            pipeline,
            notifier,
            config,
        }
    }

    pub async fn run_check_for_item(&self, item_id: &str) -> CheckResult {
        let item = match self.store.get_active_item(item_id) {
            Ok(Some(item)) => item,
            Ok(None) => {
                return failed_without_run(item_id, "item not found or inactive");
            }
            Err(e) => {
                error!("failed to load item {}: {:#}", item_id, e);
                return failed_without_run(item_id, "failed to load item");
            }
        };

        let run = match self.store.create_check_run(&item.id) {
            Ok(run) => run,
            Err(e) => {
                error!("failed to create check run for {}: {:#}", item.id, e);
                return failed_without_run(item_id, "failed to create check run");
            }
        };

        match self.execute(&item, &run).await {
            Ok(result) => result,
            Err(e) => {
                error!("check run {} for {} failed: {:#}", run.id, item.id, e);
                let message = format!("{:#}", e);
                if let Err(db_err) = self.store.finalize_check_run(
                    &run.id,
                    CheckStatus::Failed,
                    Some(error_codes::CHECK_RUN_FAILED),
                    Some(&message),
                    false,
                    false,
                    None,
                    None,
                    None,
                ) {
                    error!("failed to finalize run {}: {:#}", run.id, db_err);
                }
                CheckResult {
                    status: CheckStatus::Failed,
                    run_id: run.id,
                    item_id: item.id,
                    snapshot_id: None,
                    product_name: None,
                    price_cents: None,
                    stock_state: None,
                    changed: false,
                    back_in_stock: false,
                    error_code: Some(error_codes::CHECK_RUN_FAILED.to_string()),
                    error_message: Some(message),
                }
            }
        }
    }

    async fn execute(&self, item: &TrackedItem, run: &CheckRun) -> Result<CheckResult> {
        // Budget left today, computed from persisted runs. The race between
        // concurrent sweeps is accepted; overshoot is bounded by concurrency.
        let spent = self.store.ai_cost_since(&today_start_ts())?;
        let remaining_budget = (self.config.ai_daily_budget_usd - spent).max(0.0);

        let ai_hints: Vec<String> = self
            .store
            .recent_snapshots_for_host(&item.site_host, &item.id, MAX_AI_HINTS)?
            .iter()
            .map(format_hint)
            .collect();

        let opts = PipelineOptions {
            timeout: Duration::from_millis(self.config.scrape_timeout_ms),
            allow_playwright: self.config.enable_playwright,
            allow_ai: remaining_budget > 0.0,
            model: self.config.model_small.clone(),
            ai_hints,
        };

        let attempt = self.pipeline.extract(&item.url, &opts).await?;
        match attempt.result.clone() {
            Some(result) if attempt.reason.is_none() => {
                self.finish_success(item, run, &attempt, result).await
            }
            _ => self.finish_review(item, run, &attempt),
        }
    }

    fn finish_review(
        &self,
        item: &TrackedItem,
        run: &CheckRun,
        attempt: &ExtractionAttempt,
    ) -> Result<CheckResult> {
        let reason = attempt
            .reason
            .clone()
            .unwrap_or_else(|| error_codes::UNKNOWN_EXTRACTION_ERROR.to_string());
        let status = if NEEDS_REVIEW_REASONS.iter().any(|p| reason.contains(p)) {
            CheckStatus::NeedsReview
        } else {
            CheckStatus::Failed
        };

        self.store.finalize_check_run(
            &run.id,
            status,
            Some(&reason),
            None,
            attempt.used_playwright,
            attempt.used_ai,
            attempt.token_input,
            attempt.token_output,
            attempt.estimated_cost_usd,
        )?;

        info!("check for {} ended {:?} ({})", item.id, status, reason);
        Ok(CheckResult {
            status,
            run_id: run.id.clone(),
            item_id: item.id.clone(),
            snapshot_id: None,
            product_name: None,
            price_cents: None,
            stock_state: None,
            changed: false,
            back_in_stock: false,
            error_code: Some(reason),
            error_message: None,
        })
    }

    async fn finish_success(
        &self,
        item: &TrackedItem,
        run: &CheckRun,
        attempt: &ExtractionAttempt,
        result: crate::models::ExtractResult,
    ) -> Result<CheckResult> {
        let previous = self.store.latest_snapshot(&item.id)?;

        let snapshot = PriceSnapshot {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            checked_at: now_ts(),
            product_name: result
                .product_name
                .clone()
                .unwrap_or_else(|| "Unknown product".to_string()),
            price_cents: result.price_cents,
            in_stock: result.in_stock,
            stock_state: result.stock_state,
            extraction_method: result.method,
            confidence: result.confidence,
            evidence_json: result.evidence.to_string(),
            content_hash: result.content_hash.clone(),
        };
        self.store.insert_snapshot(&snapshot)?;

        let prev_price = previous.as_ref().and_then(|p| p.price_cents);
        let changed = matches!(
            (prev_price, snapshot.price_cents),
            (Some(old), Some(new)) if old != new
        );
        let back_in_stock = previous
            .as_ref()
            .map(|p| p.in_stock == Some(false))
            .unwrap_or(false)
            && snapshot.in_stock == Some(true);

        if changed {
            if let (Some(old), Some(new)) = (prev_price, snapshot.price_cents) {
                if let Err(e) = self
                    .notifier
                    .notify_price_change(item, &snapshot, old, new)
                    .await
                {
                    warn!("price-change notification for {} failed: {:#}", item.id, e);
                }
            }
        }
        if back_in_stock {
            if let Err(e) = self.notifier.notify_back_in_stock(item, &snapshot).await {
                warn!("back-in-stock notification for {} failed: {:#}", item.id, e);
            }
        }

        self.store.finalize_check_run(
            &run.id,
            CheckStatus::Success,
            None,
            None,
            attempt.used_playwright,
            attempt.used_ai,
            attempt.token_input,
            attempt.token_output,
            attempt.estimated_cost_usd,
        )?;

        info!(
            "check for {} succeeded: {} @ {:?} ({:?})",
            item.id, snapshot.product_name, snapshot.price_cents, snapshot.stock_state
        );
        Ok(CheckResult {
            status: CheckStatus::Success,
            run_id: run.id.clone(),
            item_id: item.id.clone(),
            snapshot_id: Some(snapshot.id.clone()),
            product_name: Some(snapshot.product_name.clone()),
            price_cents: snapshot.price_cents,
            stock_state: Some(snapshot.stock_state),
            changed,
            back_in_stock,
            error_code: None,
            error_message: None,
        })
    }
}

/// UTC midnight in the store's timestamp format; the AI budget day boundary.
pub fn today_start_ts() -> String {
    format!("{}T00:00:00.000000Z", chrono::Utc::now().format("%Y-%m-%d"))
}

fn format_hint(snapshot: &PriceSnapshot) -> String {
    let price = snapshot
        .price_cents
        .map(|c| format!("{}.{:02}", c / 100, c % 100))
        .unwrap_or_else(|| "null".to_string());
    format!(
        "{} | price={} | stock={}",
        snapshot.product_name,
        price,
        snapshot.stock_state.as_str()
    )
}

fn failed_without_run(item_id: &str, message: &str) -> CheckResult {
    CheckResult {
        status: CheckStatus::Failed,
        run_id: String::new(),
        item_id: item_id.to_string(),
        snapshot_id: None,
        product_name: None,
        price_cents: None,
        stock_state: None,
        changed: false,
        back_in_stock: false,
        error_code: Some(error_codes::CHECK_RUN_FAILED.to_string()),
        error_message: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StockState;

    #[test]
    fn hint_formatting() {
        let snapshot = PriceSnapshot {
            id: "s".into(),
            item_id: "i".into(),
            checked_at: now_ts(),
            product_name: "Widget Pro".into(),
            price_cents: Some(4999),
            in_stock: Some(true),
            stock_state: StockState::InStock,
            extraction_method: crate::models::ExtractionMethod::Static,
            confidence: 0.9,
            evidence_json: "{}".into(),
            content_hash: "h".into(),
        };
        assert_eq!(
            format_hint(&snapshot),
            "Widget Pro | price=49.99 | stock=IN_STOCK"
        );

        let unpriced = PriceSnapshot {
            price_cents: None,
            stock_state: StockState::OutOfStock,
            ..snapshot
        };
        assert_eq!(
            format_hint(&unpriced),
            "Widget Pro | price=null | stock=OUT_OF_STOCK"
        );
    }

    #[test]
    fn day_boundary_format_is_comparable() {
        let ts = today_start_ts();
        assert!(ts.ends_with("T00:00:00.000000Z"));
        assert!(ts.as_str() <= now_ts().as_str());
    }
}
