//! Layered extraction pipeline.
//!
//! Tier order: Best Buy API → Shopify JSON → static HTML → headless render →
//! LLM fallback. Confidence gates decide how far down the cascade a check
//! travels; the final gate turns weak results into NEEDS_REVIEW instead of
//! persisting garbage snapshots.

pub mod ai;
pub mod html;
pub mod normalize;
pub mod price;
pub mod rendered;
pub mod stock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::adapters;
use crate::models::{
    error_codes, Config, ExtractResult, ExtractionAttempt, ExtractionMethod, StockState,
};
use ai::AiExtractor;
use rendered::RenderedFetcher;

/// Browser-like UA; obvious automation signatures get blocked outright.
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Final acceptance floor, below which nothing gets persisted.
const MIN_ACCEPT_CONFIDENCE: f64 = 0.70;

/// Regional storefront prefixes: a redirect that swaps one for another means
/// the shop bounced us to a different country's catalog.
const REGIONAL_SUBDOMAINS: &[&str] = &[
    "us", "ca", "uk", "eu", "au", "de", "fr", "it", "es", "jp", "sg", "hk",
];

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub timeout: Duration,
    pub allow_playwright: bool,
    pub allow_ai: bool,
    pub model: String,
    pub ai_hints: Vec<String>,
}

/// Seam the check runner depends on, so tests can swap the whole pipeline.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, opts: &PipelineOptions) -> Result<ExtractionAttempt>;
}

pub struct ExtractionPipeline {
    http: reqwest::Client,
    renderer: Arc<dyn RenderedFetcher>,
    ai: Option<AiExtractor>,
    ai_confidence_threshold: f64,
    oos_verify_threshold: f64,
}

impl ExtractionPipeline {
    pub fn new(
        config: &Config,
        renderer: Arc<dyn RenderedFetcher>,
        ai: Option<AiExtractor>,
    ) -> Self {
        // Redirects are never followed: a 3xx is a signal, not a detour.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create pipeline HTTP client");

        Self {
            http,
            renderer,
            ai,
            ai_confidence_threshold: config.ai_confidence_threshold,
            oos_verify_threshold: config.oos_verify_threshold,
        }
    }

    async fn run(&self, url: &str, opts: &PipelineOptions) -> Result<ExtractionAttempt> {
        // Tiers 1+2: host-specific JSON endpoints.
        if let Some(result) = adapters::bestbuy::try_extract(&self.http, url, opts.timeout).await {
            return Ok(ExtractionAttempt::success(result));
        }
        if let Some(result) = adapters::shopify::try_extract(&self.http, url, opts.timeout).await {
            return Ok(ExtractionAttempt::success(result));
        }

        // Tier 3: static fetch with redirects surfaced, not followed.
        let html = match self.fetch_static(url, opts.timeout).await? {
            StaticFetch::Blocked(reason) => {
                return Ok(ExtractionAttempt::needs_review(&reason));
            }
            StaticFetch::Page(html) => html,
        };

        let mut best = html::extract_static(&html, url);
        let mut used_playwright = false;

        // Tier 4: headless render, only when static confidence is short and
        // the page is not already a confident out-of-stock.
        if best.confidence < self.ai_confidence_threshold
            && opts.allow_playwright
            && (best.in_stock != Some(false) || best.confidence < self.oos_verify_threshold)
        {
            used_playwright = true;
            match self.renderer.fetch_rendered(url, opts.timeout).await {
                Ok(Some(page)) => {
                    if same_url_modulo_fragment(url, &page.final_url) {
                        let mut rendered = html::extract_static(&page.html, url);
                        rendered.method = ExtractionMethod::Playwright;
                        if rendered.confidence > best.confidence {
                            best = rendered;
                        }
                    } else {
                        debug!(
                            "discarding rendered result: final url {} differs from {}",
                            page.final_url, url
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("rendered fetch failed for {}: {:#}", url, e),
            }
        }

        // Tier 5: LLM fallback behind the spend gate.
        let mut used_ai = false;
        let mut token_input = None;
        let mut token_output = None;
        let mut estimated_cost_usd = None;

        if best.confidence < self.ai_confidence_threshold
            && ai_gate_wants(&best, self.oos_verify_threshold)
        {
            let Some(ai) = self.ai.as_ref().filter(|_| opts.allow_ai) else {
                let mut attempt =
                    ExtractionAttempt::needs_review(error_codes::AI_BUDGET_EXCEEDED_OR_DISABLED);
                attempt.used_playwright = used_playwright;
                return Ok(attempt);
            };

            used_ai = true;
            match ai
                .extract(url, &best, &opts.ai_hints, &opts.model, opts.timeout)
                .await
            {
                Ok(out) => {
                    token_input = out.token_input;
                    token_output = out.token_output;
                    estimated_cost_usd = Some(out.estimated_cost_usd);
                    best = out.result;
                }
                Err(e) => warn!("ai extraction failed for {}: {:#}", url, e),
            }
        }

        // Final gate.
        let mut attempt = if fails_final_gate(&best) {
            ExtractionAttempt::needs_review(error_codes::LOW_CONFIDENCE_EXTRACTION)
        } else {
            ExtractionAttempt::success(best)
        };
        attempt.used_playwright = used_playwright;
        attempt.used_ai = used_ai;
        attempt.token_input = token_input;
        attempt.token_output = token_output;
        attempt.estimated_cost_usd = estimated_cost_usd;
        Ok(attempt)
    }

    async fn fetch_static(&self, url: &str, timeout: Duration) -> Result<StaticFetch> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("static fetch of {}", url))?;

        let status = resp.status();
        if status.is_redirection() {
            // Distinguish a regional storefront bounce from a generic block.
            let target_host = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| Url::parse(url).ok()?.join(loc).ok())
                .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));
            let request_host = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

            if let (Some(req), Some(target)) = (request_host, target_host) {
                if is_regional_sibling(&req, &target) {
                    return Ok(StaticFetch::Blocked(
                        error_codes::REGIONAL_REDIRECT_MISMATCH.to_string(),
                    ));
                }
            }
            return Ok(StaticFetch::Blocked(
                error_codes::URL_REDIRECT_BLOCKED.to_string(),
            ));
        }

        if !status.is_success() {
            bail!("static fetch of {} returned {}", url, status);
        }

        // Belt and braces: if the client ever reports a different final host
        // (e.g. internal upgrade), apply the same regional check.
        let final_url = resp.url().clone();
        if let (Ok(req), Some(final_host)) = (Url::parse(url), final_url.host_str()) {
            if let Some(req_host) = req.host_str() {
                if is_regional_sibling(
                    &req_host.to_ascii_lowercase(),
                    &final_host.to_ascii_lowercase(),
                ) {
                    return Ok(StaticFetch::Blocked(
                        error_codes::REGIONAL_REDIRECT_MISMATCH.to_string(),
                    ));
                }
            }
        }

        let html = resp.text().await.context("static fetch body")?;
        Ok(StaticFetch::Page(html))
    }
}

enum StaticFetch {
    Page(String),
    Blocked(String),
}

#[async_trait]
impl Extractor for ExtractionPipeline {
    async fn extract(&self, url: &str, opts: &PipelineOptions) -> Result<ExtractionAttempt> {
        self.run(url, opts).await
    }
}

/// Should the AI tier run at all? Confident out-of-stock pages with hard
/// embedded evidence are not worth tokens.
fn ai_gate_wants(result: &ExtractResult, oos_verify_threshold: f64) -> bool {
    if result.in_stock != Some(false) {
        return true;
    }
    if result.stock_state == StockState::OutOfStock
        && result.signals.embedded_out > 0
        && result.signals.embedded_in == 0
    {
        return false;
    }
    if result.stock_state == StockState::Partial || !result.variant_stock.is_empty() {
        return true;
    }
    result.confidence < oos_verify_threshold
}

fn fails_final_gate(result: &ExtractResult) -> bool {
    result.product_name.is_none()
        || result.confidence < MIN_ACCEPT_CONFIDENCE
        || (result.in_stock != Some(false) && result.price_cents.is_none())
}

/// `us.shop.example.com` vs `ca.shop.example.com`: same root, both prefixes
/// regional. Root must keep at least two labels.
fn is_regional_sibling(host_a: &str, host_b: &str) -> bool {
    if host_a == host_b {
        return false;
    }
    let (Some((first_a, root_a)), Some((first_b, root_b))) =
        (host_a.split_once('.'), host_b.split_once('.'))
    else {
        return false;
    };
    REGIONAL_SUBDOMAINS.contains(&first_a)
        && REGIONAL_SUBDOMAINS.contains(&first_b)
        && root_a == root_b
        && root_a.matches('.').count() >= 1
}

fn same_url_modulo_fragment(a: &str, b: &str) -> bool {
    let strip = |raw: &str| match Url::parse(raw) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => raw.split('#').next().unwrap_or(raw).to_string(),
    };
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StockSignals;

    fn result_with(
        in_stock: Option<bool>,
        state: StockState,
        confidence: f64,
        signals: StockSignals,
    ) -> ExtractResult {
        ExtractResult {
            product_name: Some("X".into()),
            price_cents: Some(1000),
            in_stock,
            stock_state: state,
            variant_stock: Vec::new(),
            confidence,
            method: ExtractionMethod::Static,
            evidence: serde_json::json!({}),
            content_hash: "h".into(),
            signals,
        }
    }

    #[test]
    fn ai_gate_always_runs_when_not_confirmed_out() {
        let r = result_with(Some(true), StockState::InStock, 0.5, Default::default());
        assert!(ai_gate_wants(&r, 0.78));
        let r = result_with(None, StockState::Unknown, 0.5, Default::default());
        assert!(ai_gate_wants(&r, 0.78));
    }

    #[test]
    fn ai_gate_skips_embedded_confirmed_out_of_stock() {
        let signals = StockSignals {
            embedded_out: 3,
            embedded_in: 0,
            ..Default::default()
        };
        let r = result_with(Some(false), StockState::OutOfStock, 0.5, signals);
        assert!(!ai_gate_wants(&r, 0.78));
    }

    #[test]
    fn ai_gate_verifies_weak_out_of_stock() {
        let r = result_with(Some(false), StockState::OutOfStock, 0.60, Default::default());
        assert!(ai_gate_wants(&r, 0.78));
        let r = result_with(Some(false), StockState::OutOfStock, 0.85, Default::default());
        assert!(!ai_gate_wants(&r, 0.78));
    }

    #[test]
    fn ai_gate_runs_for_variants_even_when_out() {
        let mut r = result_with(Some(false), StockState::OutOfStock, 0.85, Default::default());
        r.variant_stock.push(crate::models::VariantStock {
            label: "S".into(),
            stock: StockState::OutOfStock,
        });
        assert!(ai_gate_wants(&r, 0.78));
    }

    #[test]
    fn final_gate_rules() {
        let ok = result_with(Some(true), StockState::InStock, 0.9, Default::default());
        assert!(!fails_final_gate(&ok));

        let mut no_name = ok.clone();
        no_name.product_name = None;
        assert!(fails_final_gate(&no_name));

        let mut weak = ok.clone();
        weak.confidence = 0.5;
        assert!(fails_final_gate(&weak));

        // In-stock-ish without a price is unusable.
        let mut unpriced = ok.clone();
        unpriced.price_cents = None;
        assert!(fails_final_gate(&unpriced));

        // Out-of-stock without a price is fine.
        let mut oos = ok;
        oos.price_cents = None;
        oos.in_stock = Some(false);
        oos.stock_state = StockState::OutOfStock;
        assert!(!fails_final_gate(&oos));
    }

    #[test]
    fn regional_sibling_detection() {
        assert!(is_regional_sibling("us.shop.example.com", "ca.shop.example.com"));
        assert!(is_regional_sibling("uk.store.io", "de.store.io"));
        assert!(!is_regional_sibling("us.shop.example.com", "us.shop.example.com"));
        assert!(!is_regional_sibling("www.shop.example.com", "ca.shop.example.com"));
        assert!(!is_regional_sibling("us.example.com", "ca.other.com"));
        // Root must keep two labels: "us.com" vs "ca.com" is not a sibling pair.
        assert!(!is_regional_sibling("us.com", "ca.com"));
    }

    #[test]
    fn url_fragment_comparison() {
        assert!(same_url_modulo_fragment(
            "https://a.com/p#reviews",
            "https://a.com/p"
        ));
        assert!(!same_url_modulo_fragment(
            "https://a.com/p",
            "https://a.com/q"
        ));
    }
}
