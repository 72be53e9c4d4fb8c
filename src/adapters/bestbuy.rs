//! Best Buy Canada adapter: public product API keyed by SKU.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::adapters::probe_timeout;
use crate::extract::html::content_hash;
use crate::models::{ExtractResult, ExtractionMethod, StockState};

const API_BASE: &str = "https://www.bestbuy.ca/api/v2/json/product";
const CONFIDENCE: f64 = 0.96;

static SKU_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{6,}").expect("sku regex"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BestBuyProduct {
    name: Option<String>,
    sale_price: Option<f64>,
    regular_price: Option<f64>,
    #[serde(default)]
    availability: Option<BestBuyAvailability>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BestBuyAvailability {
    #[serde(default)]
    online_availability: Option<String>,
    #[serde(default)]
    is_available_online: Option<bool>,
    #[serde(default)]
    in_store_availability: Option<String>,
}

pub fn matches_host(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|h| h == "bestbuy.ca" || h.ends_with(".bestbuy.ca"))
        .unwrap_or(false)
}

/// SKU is a 6+ digit run in a path segment, or an explicit `sku`/`id` param.
pub fn extract_sku(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    if let Some(segments) = parsed.path_segments() {
        for segment in segments {
            if let Some(m) = SKU_RE.find(segment) {
                return Some(m.as_str().to_string());
            }
        }
    }

    parsed
        .query_pairs()
        .find(|(k, _)| {
            let k = k.to_ascii_lowercase();
            k == "sku" || k == "id"
        })
        .and_then(|(_, v)| SKU_RE.find(v.as_ref()).map(|m| m.as_str().to_string()))
}

pub async fn try_extract(
    client: &reqwest::Client,
    url: &str,
    total_timeout: Duration,
) -> Option<ExtractResult> {
    if !matches_host(url) {
        return None;
    }
    let sku = extract_sku(url)?;

    match probe(client, &sku, probe_timeout(total_timeout)).await {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!("bestbuy probe for sku {} failed: {:#}", sku, e);
            None
        }
    }
}

async fn probe(
    client: &reqwest::Client,
    sku: &str,
    timeout: Duration,
) -> Result<Option<ExtractResult>> {
    let api_url = format!("{}/{}", API_BASE, sku);
    let resp = client
        .get(&api_url)
        .timeout(timeout)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    let status = resp.status();
    if status.is_redirection() || !status.is_success() {
        return Ok(None);
    }

    let body = resp.text().await?;
    let product: BestBuyProduct = serde_json::from_str(&body)?;
    Ok(Some(result_from_product(product, sku, &body)))
}

fn result_from_product(product: BestBuyProduct, sku: &str, body: &str) -> ExtractResult {
    let stock_state = map_availability(product.availability.as_ref());
    let price_cents = product
        .sale_price
        .or(product.regular_price)
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| (v * 100.0).round() as i64);

    ExtractResult {
        product_name: product
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        price_cents,
        in_stock: stock_state.in_stock(),
        stock_state,
        variant_stock: Vec::new(),
        confidence: CONFIDENCE,
        // Tagged static on purpose: the dashboard groups adapter hits with
        // static extractions.
        method: ExtractionMethod::Static,
        evidence: serde_json::json!({
            "adapter": "bestbuy",
            "sku": sku,
        }),
        content_hash: content_hash(body),
        signals: Default::default(),
    }
}

fn map_availability(availability: Option<&BestBuyAvailability>) -> StockState {
    let Some(avail) = availability else {
        return StockState::Unknown;
    };

    if let Some(online) = avail.online_availability.as_deref() {
        if online.contains("InStock") {
            return StockState::InStock;
        }
        if online.contains("OutOfStock")
            || online.contains("SoldOut")
            || online.contains("Backorder")
        {
            return StockState::OutOfStock;
        }
    }

    match avail.is_available_online {
        Some(true) => return StockState::InStock,
        Some(false) => return StockState::OutOfStock,
        None => {}
    }

    match avail.in_store_availability.as_deref() {
        Some(s) if s.contains("InStock") => StockState::InStock,
        Some(s) if s.contains("OutOfStock") || s.contains("SoldOut") => StockState::OutOfStock,
        _ => StockState::Unknown,
    }
}
