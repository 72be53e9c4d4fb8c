//! LLM extraction fallback.
//!
//! Last tier of the cascade: compact textual evidence from the static pass is
//! handed to a small model in JSON mode. Spend is bounded upstream by the
//! daily budget; this module only reports token usage and estimated cost.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::extract::normalize::normalize_product_name;
use crate::extract::stock::variant_state;
use crate::models::{Config, ExtractResult, ExtractionMethod, StockState, VariantStock};

pub const AI_RESULT_CONFIDENCE: f64 = 0.87;
const MAX_HINTS: usize = 4;
const MAX_VARIANT_LINES: usize = 6;
const MAX_CANDIDATE_LINES: usize = 12;
const MAX_AI_VARIANTS: usize = 8;

/// USD per 1M tokens (input, output). Env overrides win over the table.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-5-mini", 0.25, 2.0),
    ("gpt-5-nano", 0.05, 0.4),
    ("gpt-5", 1.25, 10.0),
    ("gpt-4.1-mini", 0.4, 1.6),
    ("gpt-4.1-nano", 0.1, 0.4),
    ("gpt-4o-mini", 0.15, 0.6),
];
const DEFAULT_PRICING: (f64, f64) = (0.25, 2.0);

#[derive(Debug, Clone)]
pub struct ChatUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub content: String,
    pub usage: ChatUsage,
    pub latency_ms: u64,
}

/// Narrow seam over the chat-completions provider so tests can inject fakes.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete_json(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<ChatOutput>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsageWire>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsageWire {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
}

/// Minimal OpenAI chat-completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("Failed to create OpenAI HTTP client");
        Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete_json(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<ChatOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: 0.0,
            max_tokens,
            response_format: ResponseFormat {
                kind: "json_object".to_string(),
            },
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .context("openai request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("openai {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("openai json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok(ChatOutput {
            content,
            usage: ChatUsage {
                prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
                completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
            },
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Result of one AI extraction, with usage accounting for the run record.
#[derive(Debug, Clone)]
pub struct AiExtraction {
    pub result: ExtractResult,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub estimated_cost_usd: f64,
}

pub struct AiExtractor {
    chat: std::sync::Arc<dyn ChatModel>,
    evidence_max_chars: usize,
    max_output_tokens: u32,
    input_cost_override: Option<f64>,
    output_cost_override: Option<f64>,
}

impl AiExtractor {
    pub fn new(chat: std::sync::Arc<dyn ChatModel>, config: &Config) -> Self {
        Self {
            chat,
            evidence_max_chars: config.ai_evidence_max_chars,
            max_output_tokens: config.ai_max_output_tokens,
            input_cost_override: config.openai_input_cost_per_1m,
            output_cost_override: config.openai_output_cost_per_1m,
        }
    }

    pub async fn extract(
        &self,
        url: &str,
        static_result: &ExtractResult,
        hints: &[String],
        model: &str,
        timeout: Duration,
    ) -> Result<AiExtraction> {
        let evidence = self.build_evidence(url, static_result, hints);

        let system = "You extract product facts from e-commerce page evidence. \
                      Respond with one JSON object: \
                      {\"productName\": string, \"price\": number|null, \
                      \"inStock\": boolean|null, \"stockState\": \
                      \"IN_STOCK\"|\"OUT_OF_STOCK\"|\"PARTIAL\"|\"UNKNOWN\", \
                      \"variantStock\": [{\"label\": string, \"stock\": \
                      \"IN_STOCK\"|\"OUT_OF_STOCK\"|\"UNKNOWN\"}]}. \
                      price is in the page currency (e.g. 49.99), null if not shown. \
                      No prose, no markdown.";

        let output = self
            .chat
            .complete_json(model, system, &evidence, self.max_output_tokens, timeout)
            .await?;

        let parsed = parse_ai_payload(&output.content)?;
        let result = reconcile(parsed, static_result, model, evidence.len());

        let token_input = output.usage.prompt_tokens.map(|t| t as i64);
        let token_output = output.usage.completion_tokens.map(|t| t as i64);
        let (input_rate, output_rate) = self.rates_for(model);
        let estimated_cost_usd = (output.usage.prompt_tokens.unwrap_or(0) as f64 / 1e6)
            * input_rate
            + (output.usage.completion_tokens.unwrap_or(0) as f64 / 1e6) * output_rate;

        tracing::debug!(
            "ai extraction for {} took {}ms (~${:.5})",
            url,
            output.latency_ms,
            estimated_cost_usd
        );

        Ok(AiExtraction {
            result,
            token_input,
            token_output,
            estimated_cost_usd,
        })
    }

    fn rates_for(&self, model: &str) -> (f64, f64) {
        let (table_in, table_out) = MODEL_PRICING
            .iter()
            .find(|(name, _, _)| *name == model)
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or(DEFAULT_PRICING);
        (
            self.input_cost_override.unwrap_or(table_in),
            self.output_cost_override.unwrap_or(table_out),
        )
    }

    /// Assemble the compact evidence document sent to the model.
    pub fn build_evidence(
        &self,
        url: &str,
        static_result: &ExtractResult,
        hints: &[String],
    ) -> String {
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("url={}", url));

        if let Some(title) = static_result.evidence.get("title").and_then(|v| v.as_str()) {
            lines.push(format!("title={}", title));
        }
        if let Some(meta) = static_result.evidence.get("meta").and_then(|v| v.as_str()) {
            lines.push(format!("meta={}", meta));
        }
        lines.push(format!("stockState={}", static_result.stock_state.as_str()));

        for hint in hints.iter().take(MAX_HINTS) {
            lines.push(format!("hint={}", hint));
        }

        for variant in static_result.variant_stock.iter().take(MAX_VARIANT_LINES) {
            let tag = match variant.stock {
                StockState::InStock | StockState::Partial => "IN",
                StockState::OutOfStock => "OUT",
                StockState::Unknown => "UNK",
            };
            lines.push(format!("variant={}|{}", variant.label, tag));
        }

        if let Some(candidates) = static_result
            .evidence
            .get("candidates")
            .and_then(|v| v.as_array())
        {
            for c in candidates.iter().take(MAX_CANDIDATE_LINES) {
                let source = c.get("source").and_then(|v| v.as_str()).unwrap_or("?");
                let price = c
                    .get("priceCents")
                    .and_then(|v| v.as_i64())
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "null".to_string());
                let score = c.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
                lines.push(format!(
                    "candidate={} priceCents={} score={:.3}",
                    source, price, score
                ));
            }
        }

        let mut evidence = lines.join("\n");
        if evidence.len() > self.evidence_max_chars {
            evidence.truncate(floor_char_boundary(&evidence, self.evidence_max_chars));
        }
        evidence
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[derive(Debug)]
struct AiPayload {
    product_name: String,
    price_cents: Option<i64>,
    in_stock: Option<bool>,
    stock_state: StockState,
    variant_stock: Vec<VariantStock>,
}

/// Strict schema validation of the model output. Anything off-contract is an
/// error; the pipeline falls back to the static result.
fn parse_ai_payload(content: &str) -> Result<AiPayload> {
    let trimmed = strip_code_fences(content);
    let value: serde_json::Value =
        serde_json::from_str(trimmed).context("ai response is not valid json")?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("ai response is not a json object"))?;

    let product_name = obj
        .get("productName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("ai response missing productName"))?;

    let price_cents = match obj.get("price") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => {
            let v = n.as_f64().ok_or_else(|| anyhow!("ai price not finite"))?;
            if !v.is_finite() || v <= 0.0 {
                None
            } else {
                Some((v * 100.0).round() as i64)
            }
        }
        Some(_) => return Err(anyhow!("ai price must be number or null")),
    };

    let in_stock = match obj.get("inStock") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Bool(b)) => Some(*b),
        Some(_) => return Err(anyhow!("ai inStock must be boolean or null")),
    };

    let stock_state = match obj.get("stockState") {
        Some(serde_json::Value::String(s))
            if matches!(
                s.as_str(),
                "IN_STOCK" | "OUT_OF_STOCK" | "PARTIAL" | "UNKNOWN"
            ) =>
        {
            StockState::parse(s)
        }
        None | Some(serde_json::Value::Null) => StockState::Unknown,
        Some(_) => return Err(anyhow!("ai stockState invalid")),
    };

    let variant_stock = match obj.get("variantStock") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .take(MAX_AI_VARIANTS)
            .filter_map(|item| {
                let label = item.get("label").and_then(|v| v.as_str())?.trim();
                if label.is_empty() || label.len() > 64 {
                    return None;
                }
                let stock = item
                    .get("stock")
                    .and_then(|v| v.as_str())
                    .map(StockState::parse)
                    .unwrap_or(StockState::Unknown);
                Some(VariantStock {
                    label: label.to_string(),
                    stock,
                })
            })
            .collect(),
        Some(_) => return Err(anyhow!("ai variantStock must be an array")),
    };

    Ok(AiPayload {
        product_name,
        price_cents,
        in_stock,
        stock_state,
        variant_stock,
    })
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

/// Post-process the model output: normalize the name and reconcile
/// `stockState` with `inStock` and the reported variants.
fn reconcile(
    payload: AiPayload,
    static_result: &ExtractResult,
    model: &str,
    evidence_chars: usize,
) -> ExtractResult {
    let mut state = payload.stock_state;
    if state == StockState::Unknown {
        state = variant_state(&payload.variant_stock);
    }
    if state == StockState::Unknown {
        state = match payload.in_stock {
            Some(true) => StockState::InStock,
            Some(false) => StockState::OutOfStock,
            None => StockState::Unknown,
        };
    }

    let in_stock = state.in_stock().or(payload.in_stock);
    let name = normalize_product_name(&payload.product_name);

    ExtractResult {
        product_name: (!name.is_empty()).then_some(name),
        price_cents: payload.price_cents,
        in_stock,
        stock_state: state,
        variant_stock: payload.variant_stock,
        confidence: AI_RESULT_CONFIDENCE,
        method: ExtractionMethod::Ai,
        evidence: serde_json::json!({
            "source": "ai",
            "model": model,
            "evidenceChars": evidence_chars,
            "staticConfidence": static_result.confidence,
        }),
        content_hash: static_result.content_hash.clone(),
        signals: static_result.signals.clone(),
    }
}
