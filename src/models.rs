//! Core domain types for the price & stock tracker.
//! Enum wire strings here are load-bearing: the dashboard, the DB columns and
//! the webhook payloads all consume them verbatim.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp format used everywhere (DB columns and API payloads).
/// Fixed-width so lexicographic comparison in SQL matches chronological order.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Stock classification for a whole page or a single variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockState {
    InStock,
    OutOfStock,
    Partial,
    Unknown,
}

impl StockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockState::InStock => "IN_STOCK",
            StockState::OutOfStock => "OUT_OF_STOCK",
            StockState::Partial => "PARTIAL",
            StockState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_STOCK" => StockState::InStock,
            "OUT_OF_STOCK" => StockState::OutOfStock,
            "PARTIAL" => StockState::Partial,
            _ => StockState::Unknown,
        }
    }

    /// Trinary `inStock` projection: PARTIAL counts as purchasable.
    pub fn in_stock(&self) -> Option<bool> {
        match self {
            StockState::InStock | StockState::Partial => Some(true),
            StockState::OutOfStock => Some(false),
            StockState::Unknown => None,
        }
    }
}

/// Which tier of the extraction cascade produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    ShopifyJson,
    BestbuyApi,
    Static,
    Playwright,
    Ai,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::ShopifyJson => "shopify_json",
            ExtractionMethod::BestbuyApi => "bestbuy_api",
            ExtractionMethod::Static => "static",
            ExtractionMethod::Playwright => "playwright",
            ExtractionMethod::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "shopify_json" => ExtractionMethod::ShopifyJson,
            "bestbuy_api" => ExtractionMethod::BestbuyApi,
            "playwright" => ExtractionMethod::Playwright,
            "ai" => ExtractionMethod::Ai,
            _ => ExtractionMethod::Static,
        }
    }
}

/// Terminal status of one check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Success,
    Failed,
    NeedsReview,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "SUCCESS",
            CheckStatus::Failed => "FAILED",
            CheckStatus::NeedsReview => "NEEDS_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => CheckStatus::Success,
            "NEEDS_REVIEW" => CheckStatus::NeedsReview,
            _ => CheckStatus::Failed,
        }
    }
}

/// Notification event kinds. The `(item, snapshot, event)` triple is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PriceChanged,
    BackInStock,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PriceChanged => "PRICE_CHANGED",
            EventType::BackInStock => "BACK_IN_STOCK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRICE_CHANGED" => Some(EventType::PriceChanged),
            "BACK_IN_STOCK" => Some(EventType::BackInStock),
            _ => None,
        }
    }
}

/// Diagnostic reason / error-code taxonomy. Propagated as data, never raised.
pub mod error_codes {
    pub const URL_REDIRECT_BLOCKED: &str = "URL_REDIRECT_BLOCKED";
    pub const REGIONAL_REDIRECT_MISMATCH: &str = "REGIONAL_REDIRECT_MISMATCH";
    pub const AI_BUDGET_EXCEEDED_OR_DISABLED: &str = "AI_BUDGET_EXCEEDED_OR_DISABLED";
    pub const LOW_CONFIDENCE_EXTRACTION: &str = "LOW_CONFIDENCE_EXTRACTION";
    pub const CHECK_RUN_FAILED: &str = "CHECK_RUN_FAILED";
    pub const UNKNOWN_EXTRACTION_ERROR: &str = "UNKNOWN_EXTRACTION_ERROR";
}

/// Reasons that indicate a diagnostic fault (operator triage) rather than an
/// infrastructural failure.
pub const NEEDS_REVIEW_REASONS: &[&str] = &[
    "AI_BUDGET",
    "LOW_CONFIDENCE",
    "REGIONAL_REDIRECT",
    "REDIRECT_BLOCKED",
];

/// Per-variant availability, as shown on the product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStock {
    pub label: String,
    pub stock: StockState,
}

/// Raw counters from the stock arbitration pass. Kept on the result so the
/// pipeline's AI gate can inspect them without re-parsing evidence JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSignals {
    pub in_score: f64,
    pub out_score: f64,
    pub explicit_in: u32,
    pub explicit_out: u32,
    pub enabled_cta: u32,
    pub disabled_cta: u32,
    pub embedded_in: u32,
    pub embedded_out: u32,
}

/// One trusted extraction, whichever cascade tier produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResult {
    pub product_name: Option<String>,
    pub price_cents: Option<i64>,
    pub in_stock: Option<bool>,
    pub stock_state: StockState,
    pub variant_stock: Vec<VariantStock>,
    pub confidence: f64,
    pub method: ExtractionMethod,
    pub evidence: serde_json::Value,
    pub content_hash: String,
    #[serde(default)]
    pub signals: StockSignals,
}

/// Outcome of one full pipeline invocation, including AI usage accounting.
#[derive(Debug, Clone)]
pub struct ExtractionAttempt {
    pub result: Option<ExtractResult>,
    pub reason: Option<String>,
    pub used_playwright: bool,
    pub used_ai: bool,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
}

impl ExtractionAttempt {
    pub fn is_success(&self) -> bool {
        self.result.is_some() && self.reason.is_none()
    }

    pub fn success(result: ExtractResult) -> Self {
        Self {
            result: Some(result),
            reason: None,
            used_playwright: false,
            used_ai: false,
            token_input: None,
            token_output: None,
            estimated_cost_usd: None,
        }
    }

    pub fn needs_review(reason: &str) -> Self {
        Self {
            result: None,
            reason: Some(reason.to_string()),
            used_playwright: false,
            used_ai: false,
            token_input: None,
            token_output: None,
            estimated_cost_usd: None,
        }
    }
}

/// A URL under tracking. Soft-deleted rows keep their snapshot history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedItem {
    pub id: String,
    pub url: String,
    pub canonical_url: String,
    pub site_host: String,
    pub active: bool,
    pub created_at: String,
}

/// Immutable record of one successful extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub id: String,
    pub item_id: String,
    pub checked_at: String,
    pub product_name: String,
    pub price_cents: Option<i64>,
    pub in_stock: Option<bool>,
    pub stock_state: StockState,
    pub extraction_method: ExtractionMethod,
    pub confidence: f64,
    pub evidence_json: String,
    pub content_hash: String,
}

/// Durable record of one check attempt. Created pessimistically as FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRun {
    pub id: String,
    pub item_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: CheckStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub used_playwright: bool,
    pub used_ai: bool,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
}

/// One webhook emission claim. The unique `(item, snapshot, event)` key is
/// what makes delivery at-most-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub item_id: String,
    pub snapshot_id: String,
    pub event_type: EventType,
    pub webhook_status: Option<i64>,
    pub webhook_response: Option<String>,
    pub sent_at: Option<String>,
    pub created_at: String,
}

/// What `runCheckForItem` hands back to callers (API and sweep).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub status: CheckStatus,
    pub run_id: String,
    pub item_id: String,
    pub snapshot_id: Option<String>,
    pub product_name: Option<String>,
    pub price_cents: Option<i64>,
    pub stock_state: Option<StockState>,
    pub changed: bool,
    pub back_in_stock: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub discord_webhook_url: Option<String>,
    pub check_schedule_cron: String,
    pub worker_run_on_boot: bool,
    pub scrape_timeout_ms: u64,
    pub enable_playwright: bool,
    pub render_service_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model_small: String,
    pub ai_daily_budget_usd: f64,
    pub ai_confidence_threshold: f64,
    pub oos_verify_threshold: f64,
    pub ai_evidence_max_chars: usize,
    pub ai_max_output_tokens: u32,
    pub openai_input_cost_per_1m: Option<f64>,
    pub openai_output_cost_per_1m: Option<f64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_path: env_str("DATABASE_PATH", "./pricewatch.db"),
            port: env_u64("PORT", 8080) as u16,
            discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
            check_schedule_cron: env_str("CHECK_SCHEDULE_CRON", "0 9 * * *"),
            worker_run_on_boot: env_bool("WORKER_RUN_ON_BOOT", false),
            scrape_timeout_ms: env_u64("SCRAPE_TIMEOUT_MS", 20_000),
            enable_playwright: env_bool("ENABLE_PLAYWRIGHT", true),
            render_service_url: env_opt("RENDER_SERVICE_URL"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            openai_base_url: env_str("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model_small: env_str("OPENAI_MODEL_SMALL", "gpt-5-mini"),
            ai_daily_budget_usd: env_f64("AI_DAILY_BUDGET_USD", 1.0).max(0.0),
            ai_confidence_threshold: env_f64("AI_FALLBACK_CONFIDENCE_THRESHOLD", 0.88)
                .clamp(0.70, 0.98),
            oos_verify_threshold: env_f64("OUT_OF_STOCK_VERIFY_CONFIDENCE_THRESHOLD", 0.78)
                .clamp(0.60, 0.95),
            ai_evidence_max_chars: (env_u64("AI_EVIDENCE_MAX_CHARS", 6_000) as usize)
                .clamp(2_500, 12_000),
            ai_max_output_tokens: (env_u64("AI_MAX_OUTPUT_TOKENS", 180) as u32).clamp(80, 300),
            openai_input_cost_per_1m: env_opt("OPENAI_INPUT_COST_PER_1M")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0),
            openai_output_cost_per_1m: env_opt("OPENAI_OUTPUT_COST_PER_1M")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0),
        }
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_state_wire_strings() {
        assert_eq!(
            serde_json::to_string(&StockState::OutOfStock).unwrap(),
            "\"OUT_OF_STOCK\""
        );
        assert_eq!(StockState::parse("partial"), StockState::Partial);
        assert_eq!(StockState::parse("bogus"), StockState::Unknown);
    }

    #[test]
    fn in_stock_projection() {
        assert_eq!(StockState::InStock.in_stock(), Some(true));
        assert_eq!(StockState::Partial.in_stock(), Some(true));
        assert_eq!(StockState::OutOfStock.in_stock(), Some(false));
        assert_eq!(StockState::Unknown.in_stock(), None);
    }

    #[test]
    fn extraction_method_wire_strings() {
        assert_eq!(ExtractionMethod::ShopifyJson.as_str(), "shopify_json");
        assert_eq!(ExtractionMethod::parse("bestbuy_api"), ExtractionMethod::BestbuyApi);
        assert_eq!(ExtractionMethod::parse("anything"), ExtractionMethod::Static);
    }

    #[test]
    fn event_type_round_trip() {
        assert_eq!(EventType::parse("PRICE_CHANGED"), Some(EventType::PriceChanged));
        assert_eq!(EventType::parse("nope"), None);
    }
}
