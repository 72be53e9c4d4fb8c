//! Route handlers for the tracker API.
//!
//! Validation failures are 400, missing items 404, everything else 500,
//! always as `{error}` so the dashboard has one error shape to deal with.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::api::AppState;
use crate::models::{CheckResult, CheckRun, NotificationRecord, PriceSnapshot, TrackedItem};
use crate::storage::PriceChange;
use crate::urlnorm;

const DETAIL_LIMIT: usize = 30;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn internal(err: anyhow::Error) -> ApiError {
    error!("api error: {:#}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "internal error".to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct CreateItemRequest {
    pub url: String,
    /// Accepted for forward compatibility; a single process-wide display
    /// currency is assumed today.
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemResponse {
    pub item_id: String,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_check: Option<CheckResult>,
}

pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<CreateItemResponse>), ApiError> {
    let url = body.url.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(bad_request("url must be http(s)"));
    }
    if let Some(currency) = body.currency.as_deref() {
        if !currency.trim().is_empty() && currency.trim().len() != 3 {
            return Err(bad_request("currency must be a 3-letter code"));
        }
    }

    let canonical = urlnorm::canonicalize(&url).map_err(|e| bad_request(e.to_string()))?;
    let site_host = urlnorm::site_host(&canonical).map_err(|e| bad_request(e.to_string()))?;

    let existing = state
        .store
        .find_item_by_canonical(&canonical)
        .map_err(internal)?;

    match existing {
        Some(item) if item.active => Ok((
            StatusCode::OK,
            Json(CreateItemResponse {
                item_id: item.id,
                created: false,
                initial_check: None,
            }),
        )),
        Some(item) => {
            // Soft-deleted: re-activate under the same id so history reattaches.
            state
                .store
                .set_item_active(&item.id, true, Some(&url))
                .map_err(internal)?;
            let initial_check = state.runner.run_check_for_item(&item.id).await;
            Ok((
                StatusCode::CREATED,
                Json(CreateItemResponse {
                    item_id: item.id,
                    created: true,
                    initial_check: Some(initial_check),
                }),
            ))
        }
        None => {
            let item = state
                .store
                .create_item(&url, &canonical, &site_host)
                .map_err(internal)?;
            let initial_check = state.runner.run_check_for_item(&item.id).await;
            Ok((
                StatusCode::CREATED,
                Json(CreateItemResponse {
                    item_id: item.id,
                    created: true,
                    initial_check: Some(initial_check),
                }),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOverview {
    #[serde(flatten)]
    pub item: TrackedItem,
    pub latest_snapshot: Option<PriceSnapshot>,
    pub latest_check_run: Option<CheckRun>,
    pub last_price_change: Option<PriceChange>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub items: Vec<ItemOverview>,
}

pub async fn list_items(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let items = state
        .store
        .list_active_items(crate::sweep::MAX_SWEEP_ITEMS)
        .map_err(internal)?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let latest_snapshot = state.store.latest_snapshot(&item.id).map_err(internal)?;
        let latest_check_run = state.store.latest_run(&item.id).map_err(internal)?;
        let last_price_change = state.store.last_price_change(&item.id).map_err(internal)?;
        out.push(ItemOverview {
            item,
            latest_snapshot,
            latest_check_run,
            last_price_change,
        });
    }

    Ok(Json(ItemsResponse { items: out }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetail {
    #[serde(flatten)]
    pub item: TrackedItem,
    pub snapshots: Vec<PriceSnapshot>,
    pub check_runs: Vec<CheckRun>,
    pub notifications: Vec<NotificationRecord>,
    pub last_price_change: Option<PriceChange>,
}

pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<ItemDetail>, ApiError> {
    let item = state
        .store
        .get_item(&item_id)
        .map_err(internal)?
        .ok_or_else(|| not_found("item not found"))?;

    let snapshots = state
        .store
        .snapshots_for_item(&item.id, DETAIL_LIMIT)
        .map_err(internal)?;
    let check_runs = state
        .store
        .runs_for_item(&item.id, DETAIL_LIMIT)
        .map_err(internal)?;
    let notifications = state
        .store
        .notifications_for_item(&item.id, DETAIL_LIMIT)
        .map_err(internal)?;
    let last_price_change = state.store.last_price_change(&item.id).map_err(internal)?;

    Ok(Json(ItemDetail {
        item,
        snapshots,
        check_runs,
        notifications,
        last_price_change,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let item = state
        .store
        .get_item(&item_id)
        .map_err(internal)?
        .ok_or_else(|| not_found("item not found"))?;

    state
        .store
        .set_item_active(&item.id, false, None)
        .map_err(internal)?;
    Ok(Json(DeleteResponse { ok: true }))
}

pub async fn check_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<CheckResult>, ApiError> {
    let item = state
        .store
        .get_active_item(&item_id)
        .map_err(internal)?
        .ok_or_else(|| not_found("item not found"))?;

    let result = state.runner.run_check_for_item(&item.id).await;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct DiscordTestResponse {
    pub status: u16,
    pub body: String,
}

pub async fn discord_test(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DiscordTestResponse>, ApiError> {
    let (status, body) = state
        .notifier
        .send_test()
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(DiscordTestResponse { status, body }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub items: i64,
    pub uptime_secs: u64,
}

pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let items = state.store.count_active_items().map_err(internal)?;
    Ok(Json(HealthResponse {
        status: "ok",
        items,
        uptime_secs: state.started.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CheckRunner;
    use crate::extract::{Extractor, PipelineOptions};
    use crate::models::{
        Config, ExtractResult, ExtractionAttempt, ExtractionMethod, StockState,
    };
    use crate::notifier::Notifier;
    use crate::storage::TrackerStore;
    use async_trait::async_trait;

    /// Pipeline stub: every URL extracts cleanly at a fixed price.
    struct StubPipeline;

    #[async_trait]
    impl Extractor for StubPipeline {
        async fn extract(
            &self,
            _url: &str,
            _opts: &PipelineOptions,
        ) -> anyhow::Result<ExtractionAttempt> {
            Ok(ExtractionAttempt::success(ExtractResult {
                product_name: Some("Widget".into()),
                price_cents: Some(4999),
                in_stock: Some(true),
                stock_state: StockState::InStock,
                variant_stock: Vec::new(),
                confidence: 0.95,
                method: ExtractionMethod::Static,
                evidence: serde_json::json!({}),
                content_hash: "cafe".into(),
                signals: Default::default(),
            }))
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

    fn app_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            TrackerStore::new(dir.path().join("api.db").to_str().unwrap()).unwrap(),
        );
        let notifier = Arc::new(Notifier::new(store.clone(), None));
        let runner = Arc::new(CheckRunner::new(
            store.clone(),
            Arc::new(StubPipeline),
            notifier.clone(),
            test_config(),
        ));
        let state = Arc::new(AppState {
            store,
            runner,
            notifier,
            config: test_config(),
            started: std::time::Instant::now(),
        });
        (state, dir)
    }

    #[tokio::test]
    async fn adding_the_same_url_twice_dedupes_on_canonical_form() {
        let (state, _dir) = app_state();

        let (status, Json(first)) = create_item(
            State(state.clone()),
            Json(CreateItemRequest {
                url: "https://a.com/p?utm_source=news&color=blue".into(),
                currency: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(first.created);
        let initial = first.initial_check.expect("new items get an initial check");
        assert_eq!(initial.price_cents, Some(4999));

        // Same canonical URL, different tracking noise.
        let (status, Json(second)) = create_item(
            State(state.clone()),
            Json(CreateItemRequest {
                url: "https://a.com/p?color=blue&fbclid=zzz".into(),
                currency: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(!second.created);
        assert_eq!(second.item_id, first.item_id);
        assert!(second.initial_check.is_none());
    }

    #[tokio::test]
    async fn delete_then_re_add_reactivates_the_same_row() {
        let (state, _dir) = app_state();

        let (_, Json(created)) = create_item(
            State(state.clone()),
            Json(CreateItemRequest {
                url: "https://a.com/p".into(),
                currency: None,
            }),
        )
        .await
        .unwrap();

        delete_item(State(state.clone()), Path(created.item_id.clone()))
            .await
            .unwrap();
        assert!(state.store.get_active_item(&created.item_id).unwrap().is_none());

        let (status, Json(readded)) = create_item(
            State(state.clone()),
            Json(CreateItemRequest {
                url: "https://a.com/p".into(),
                currency: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert!(readded.created);
        assert_eq!(readded.item_id, created.item_id, "history must reattach");
    }

    #[tokio::test]
    async fn rejects_unsupported_schemes_and_bad_currency() {
        let (state, _dir) = app_state();

        let err = create_item(
            State(state.clone()),
            Json(CreateItemRequest {
                url: "ftp://a.com/p".into(),
                currency: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = create_item(
            State(state),
            Json(CreateItemRequest {
                url: "https://a.com/p".into(),
                currency: Some("dollars".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_item_is_404() {
        let (state, _dir) = app_state();
        let err = get_item(State(state.clone()), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        let err = check_item(State(state), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
