//! End-to-end checks of the run state machine against a real SQLite store,
//! with the extraction pipeline swapped for a scriptable fake.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use pricewatch_backend::checker::CheckRunner;
use pricewatch_backend::extract::{Extractor, PipelineOptions};
use pricewatch_backend::models::{
    error_codes, CheckStatus, Config, EventType, ExtractResult, ExtractionAttempt,
    ExtractionMethod, StockState,
};
use pricewatch_backend::notifier::Notifier;
use pricewatch_backend::storage::TrackerStore;

/// Scriptable pipeline stand-in: pops queued responses, records the options
/// each call received.
struct FakePipeline {
    responses: Mutex<VecDeque<Result<ExtractionAttempt>>>,
    seen_opts: Mutex<Vec<PipelineOptions>>,
}

impl FakePipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            seen_opts: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, response: Result<ExtractionAttempt>) {
        self.responses.lock().push_back(response);
    }

    fn last_opts(&self) -> PipelineOptions {
        self.seen_opts.lock().last().cloned().expect("no calls seen")
    }
}

#[async_trait]
impl Extractor for FakePipeline {
    async fn extract(&self, _url: &str, opts: &PipelineOptions) -> Result<ExtractionAttempt> {
        self.seen_opts.lock().push(opts.clone());
        self.responses
            .lock()
            .pop_front()
            .expect("fake pipeline ran out of scripted responses")
    }
}

fn result(name: &str, price_cents: Option<i64>, in_stock: Option<bool>) -> ExtractResult {
    let stock_state = match in_stock {
        Some(true) => StockState::InStock,
        Some(false) => StockState::OutOfStock,
        None => StockState::Unknown,
    };
    ExtractResult {
        product_name: Some(name.to_string()),
        price_cents,
        in_stock,
        stock_state,
        variant_stock: Vec::new(),
        confidence: 0.9,
        method: ExtractionMethod::Static,
        evidence: serde_json::json!({"test": true}),
        content_hash: "deadbeef".to_string(),
        signals: Default::default(),
    }
}

fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        port: 0,
        discord_webhook_url: None,
        check_schedule_cron: "0 9 * * *".into(),
        worker_run_on_boot: false,
        scrape_timeout_ms: 1000,
        enable_playwright: false,
        render_service_url: None,
        openai_api_key: None,
        openai_base_url: "https://api.openai.com/v1".into(),
        model_small: "gpt-5-mini".into(),
        ai_daily_budget_usd: 1.0,
        ai_confidence_threshold: 0.88,
        oos_verify_threshold: 0.78,
        ai_evidence_max_chars: 6000,
        ai_max_output_tokens: 180,
        openai_input_cost_per_1m: None,
        openai_output_cost_per_1m: None,
    }
}

struct Harness {
    store: Arc<TrackerStore>,
    pipeline: Arc<FakePipeline>,
    runner: CheckRunner,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TrackerStore::new(dir.path().join("t.db").to_str().unwrap()).unwrap());
    let pipeline = FakePipeline::new();
    let notifier = Arc::new(Notifier::new(store.clone(), None));
    let runner = CheckRunner::new(
        store.clone(),
        pipeline.clone(),
        notifier,
        test_config(),
    );
    Harness {
        store,
        pipeline,
        runner,
        _dir: dir,
    }
}

#[tokio::test]
async fn success_creates_one_run_and_one_snapshot() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(4999),
        Some(true),
    ))));
    let outcome = h.runner.run_check_for_item(&item.id).await;

    assert_eq!(outcome.status, CheckStatus::Success);
    assert!(outcome.snapshot_id.is_some());
    assert_eq!(outcome.price_cents, Some(4999));
    assert!(!outcome.changed && !outcome.back_in_stock);

    assert_eq!(h.store.runs_for_item(&item.id, 10).unwrap().len(), 1);
    assert_eq!(h.store.snapshots_for_item(&item.id, 10).unwrap().len(), 1);

    let run = h.store.latest_run(&item.id).unwrap().unwrap();
    assert_eq!(run.status, CheckStatus::Success);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn equal_prices_do_not_emit_price_change() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    for _ in 0..2 {
        h.pipeline.push(Ok(ExtractionAttempt::success(result(
            "Widget",
            Some(4999),
            Some(true),
        ))));
    }
    h.runner.run_check_for_item(&item.id).await;
    let second = h.runner.run_check_for_item(&item.id).await;

    assert_eq!(second.status, CheckStatus::Success);
    assert!(!second.changed);
    assert!(h.store.notifications_for_item(&item.id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn price_change_claims_exactly_one_notification() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(10000),
        Some(true),
    ))));
    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(12000),
        Some(true),
    ))));
    h.runner.run_check_for_item(&item.id).await;
    let second = h.runner.run_check_for_item(&item.id).await;

    assert!(second.changed);
    let notifications = h.store.notifications_for_item(&item.id, 10).unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].event_type, EventType::PriceChanged);
    // Webhook unconfigured: claimed, recorded, never sent.
    assert_eq!(notifications[0].webhook_status, Some(0));
    assert!(notifications[0].sent_at.is_none());
}

#[tokio::test]
async fn back_in_stock_without_prior_price_skips_price_event() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    // Out of stock with no price, then back with one.
    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        None,
        Some(false),
    ))));
    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(14999),
        Some(true),
    ))));
    h.runner.run_check_for_item(&item.id).await;
    let second = h.runner.run_check_for_item(&item.id).await;

    assert!(second.back_in_stock);
    assert!(!second.changed, "null prior price must not count as a change");

    let notifications = h.store.notifications_for_item(&item.id, 10).unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].event_type, EventType::BackInStock);
}

#[tokio::test]
async fn needs_review_reasons_map_to_status_and_skip_snapshot() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    h.pipeline.push(Ok(ExtractionAttempt::needs_review(
        error_codes::AI_BUDGET_EXCEEDED_OR_DISABLED,
    )));
    let outcome = h.runner.run_check_for_item(&item.id).await;

    assert_eq!(outcome.status, CheckStatus::NeedsReview);
    assert_eq!(
        outcome.error_code.as_deref(),
        Some(error_codes::AI_BUDGET_EXCEEDED_OR_DISABLED)
    );
    assert!(outcome.snapshot_id.is_none());
    assert!(h.store.snapshots_for_item(&item.id, 10).unwrap().is_empty());

    let run = h.store.latest_run(&item.id).unwrap().unwrap();
    assert_eq!(run.status, CheckStatus::NeedsReview);
    assert_eq!(
        run.error_code.as_deref(),
        Some(error_codes::AI_BUDGET_EXCEEDED_OR_DISABLED)
    );

    // A reason outside the diagnostic set lands as FAILED.
    h.pipeline.push(Ok(ExtractionAttempt::needs_review("SOMETHING_ODD")));
    let outcome = h.runner.run_check_for_item(&item.id).await;
    assert_eq!(outcome.status, CheckStatus::Failed);
}

#[tokio::test]
async fn pipeline_error_finalizes_run_as_failed() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    h.pipeline.push(Err(anyhow::anyhow!("connection reset by peer")));
    let outcome = h.runner.run_check_for_item(&item.id).await;

    assert_eq!(outcome.status, CheckStatus::Failed);
    assert_eq!(outcome.error_code.as_deref(), Some(error_codes::CHECK_RUN_FAILED));
    assert!(h.store.snapshots_for_item(&item.id, 10).unwrap().is_empty());

    let run = h.store.latest_run(&item.id).unwrap().unwrap();
    assert_eq!(run.status, CheckStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some(error_codes::CHECK_RUN_FAILED));
    assert!(run.error_message.is_some());
}

#[tokio::test]
async fn exhausted_budget_disables_ai_for_next_run() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    // Burn more than the daily budget in a finished AI run.
    let spent_run = h.store.create_check_run(&item.id).unwrap();
    h.store
        .finalize_check_run(
            &spent_run.id,
            CheckStatus::Success,
            None,
            None,
            false,
            true,
            Some(100_000),
            Some(1_000),
            Some(2.0),
        )
        .unwrap();

    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(4999),
        Some(true),
    ))));
    h.runner.run_check_for_item(&item.id).await;
    assert!(
        !h.pipeline.last_opts().allow_ai,
        "spent budget must disable the AI tier"
    );
}

#[tokio::test]
async fn fresh_budget_enables_ai() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    h.pipeline.push(Ok(ExtractionAttempt::success(result(
        "Widget",
        Some(4999),
        Some(true),
    ))));
    h.runner.run_check_for_item(&item.id).await;
    assert!(h.pipeline.last_opts().allow_ai);
}

#[tokio::test]
async fn missing_item_fails_fast_without_a_run() {
    let h = harness();
    let outcome = h.runner.run_check_for_item("no-such-item").await;

    assert_eq!(outcome.status, CheckStatus::Failed);
    assert!(outcome.run_id.is_empty());
}

#[tokio::test]
async fn ai_usage_counters_land_on_the_run_row() {
    let h = harness();
    let item = h.store.create_item("https://a.com/p", "https://a.com/p", "a.com").unwrap();

    let mut attempt = ExtractionAttempt::success(result("Widget", Some(4999), Some(true)));
    attempt.used_ai = true;
    attempt.used_playwright = true;
    attempt.token_input = Some(1200);
    attempt.token_output = Some(90);
    attempt.estimated_cost_usd = Some(0.00048);
    h.pipeline.push(Ok(attempt));

    h.runner.run_check_for_item(&item.id).await;
    let run = h.store.latest_run(&item.id).unwrap().unwrap();
    assert!(run.used_ai && run.used_playwright);
    assert_eq!(run.token_input, Some(1200));
    assert_eq!(run.token_output, Some(90));
    assert!((run.estimated_cost_usd.unwrap() - 0.00048).abs() < 1e-12);
}
