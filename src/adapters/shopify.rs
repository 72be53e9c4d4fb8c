//! Shopify storefront adapter.
//!
//! Shopify shops expose product JSON next to the product page: `.js` first
//! (prices in cents), then `.json` (prices in currency units). Both probes
//! run and the richer response wins by score.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::adapters::probe_timeout;
use crate::extract::html::content_hash;
use crate::extract::price::parse_price;
use crate::extract::stock::{sanitize_variant_label, variant_state};
use crate::models::{ExtractResult, ExtractionMethod, StockState, VariantStock};

const BASE_CONFIDENCE: f64 = 0.84;
const CONFIDENCE_CAP: f64 = 0.99;
const MAX_SCORED_VARIANTS: usize = 8;

/// `.js` endpoint shape: flat product, integer prices in cents.
#[derive(Debug, Deserialize)]
struct JsProduct {
    title: Option<String>,
    #[serde(default)]
    variants: Vec<JsVariant>,
}

#[derive(Debug, Deserialize)]
struct JsVariant {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    available: Option<bool>,
}

/// `.json` endpoint shape: wrapped product, string prices in currency units.
#[derive(Debug, Deserialize)]
struct JsonProductEnvelope {
    product: JsonProduct,
}

#[derive(Debug, Deserialize)]
struct JsonProduct {
    title: Option<String>,
    #[serde(default)]
    variants: Vec<JsonVariant>,
}

#[derive(Debug, Deserialize)]
struct JsonVariant {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    available: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Js,
    Json,
}

/// Internal normalized form shared by both endpoint shapes.
struct ParsedProduct {
    name: Option<String>,
    variants: Vec<(Option<String>, Option<i64>, Option<bool>)>,
}

/// Detect and extract. `None` means "not Shopify or probe failed"; the
/// pipeline falls through to static HTML.
pub async fn try_extract(
    client: &reqwest::Client,
    url: &str,
    total_timeout: Duration,
) -> Option<ExtractResult> {
    let (base, handle) = product_handle(url)?;
    let timeout = probe_timeout(total_timeout);

    let mut best: Option<(f64, ExtractResult)> = None;
    for endpoint in [Endpoint::Js, Endpoint::Json] {
        let suffix = match endpoint {
            Endpoint::Js => "js",
            Endpoint::Json => "json",
        };
        let probe_url = format!("{}/products/{}.{}", base, handle, suffix);

        match probe(client, &probe_url, timeout, endpoint).await {
            Ok(Some(result)) => {
                let score = adapter_score(&result);
                if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best = Some((score, result));
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("shopify probe {} failed: {:#}", probe_url, e);
            }
        }
    }

    best.map(|(_, result)| result)
}

/// `/products/<handle>` anywhere in the path marks a Shopify-style URL.
pub fn product_handle(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();

    let handle = segments
        .iter()
        .enumerate()
        .find(|(_, s)| **s == "products")
        .and_then(|(i, _)| segments.get(i + 1))
        .filter(|s| !s.is_empty())?;

    let base = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };
    Some((base, (*handle).to_string()))
}

async fn probe(
    client: &reqwest::Client,
    probe_url: &str,
    timeout: Duration,
    endpoint: Endpoint,
) -> Result<Option<ExtractResult>> {
    let resp = client
        .get(probe_url)
        .timeout(timeout)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    // Redirects mean "this is not the storefront you were looking for".
    let status = resp.status();
    if status.is_redirection() || !status.is_success() {
        return Ok(None);
    }

    let body = resp.text().await?;
    let parsed = match endpoint {
        Endpoint::Js => {
            let p: JsProduct = serde_json::from_str(&body)?;
            ParsedProduct {
                name: p.title,
                variants: p
                    .variants
                    .into_iter()
                    .map(|v| (v.title, price_value(&v.price, endpoint), v.available))
                    .collect(),
            }
        }
        Endpoint::Json => {
            let p: JsonProductEnvelope = serde_json::from_str(&body)?;
            ParsedProduct {
                name: p.product.title,
                variants: p
                    .product
                    .variants
                    .into_iter()
                    .map(|v| (v.title, price_value(&v.price, endpoint), v.available))
                    .collect(),
            }
        }
    };

    Ok(Some(build_result(parsed, endpoint, &body, probe_url)))
}

/// `.js` integers are already cents; `.json` values are currency units.
fn price_value(raw: &Option<serde_json::Value>, endpoint: Endpoint) -> Option<i64> {
    match raw {
        Some(serde_json::Value::Number(n)) => match endpoint {
            Endpoint::Js => {
                if let Some(i) = n.as_i64() {
                    (i > 0).then_some(i)
                } else {
                    let v = n.as_f64()?;
                    (v.is_finite() && v > 0.0).then(|| v.round() as i64)
                }
            }
            Endpoint::Json => {
                let v = n.as_f64()?;
                (v.is_finite() && v > 0.0).then(|| (v * 100.0).round() as i64)
            }
        },
        Some(serde_json::Value::String(s)) => parse_price(s).map(|p| p.price_cents),
        _ => None,
    }
}

fn build_result(
    parsed: ParsedProduct,
    endpoint: Endpoint,
    body: &str,
    probe_url: &str,
) -> ExtractResult {
    let variant_stock: Vec<VariantStock> = parsed
        .variants
        .iter()
        .filter_map(|(title, _, available)| {
            let label = title.as_deref().and_then(sanitize_variant_label)?;
            let stock = match available {
                Some(true) => StockState::InStock,
                Some(false) => StockState::OutOfStock,
                None => StockState::Unknown,
            };
            Some(VariantStock { label, stock })
        })
        .take(MAX_SCORED_VARIANTS)
        .collect();

    let stock_state = variant_state(&variant_stock);

    // Price preference: first purchasable variant, else the first priced one.
    let price_cents = parsed
        .variants
        .iter()
        .find(|(_, price, available)| price.is_some() && *available == Some(true))
        .and_then(|(_, price, _)| *price)
        .or_else(|| parsed.variants.iter().find_map(|(_, price, _)| *price));

    let mut confidence = BASE_CONFIDENCE;
    if price_cents.is_some() {
        confidence += 0.06;
    }
    if stock_state != StockState::Unknown {
        confidence += 0.07;
    }
    if !variant_stock.is_empty() {
        confidence += 0.03;
    }
    let confidence = confidence.min(CONFIDENCE_CAP);

    let endpoint_name = match endpoint {
        Endpoint::Js => "products.js",
        Endpoint::Json => "products.json",
    };

    ExtractResult {
        product_name: parsed
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        price_cents,
        in_stock: stock_state.in_stock(),
        stock_state,
        variant_stock,
        confidence,
        method: ExtractionMethod::ShopifyJson,
        evidence: serde_json::json!({
            "adapter": "shopify",
            "endpoint": endpoint_name,
            "probeUrl": probe_url,
        }),
        content_hash: content_hash(body),
        signals: Default::default(),
    }
}

/// Rank probe responses when both endpoints answer.
fn adapter_score(result: &ExtractResult) -> f64 {
    let has_price = if result.price_cents.is_some() { 1.0 } else { 0.0 };
    let stock_score = match result.stock_state {
        StockState::Partial => 3.0,
        StockState::InStock | StockState::OutOfStock => 2.4,
        StockState::Unknown => 0.0,
    };
    let known_variants = result
        .variant_stock
        .iter()
        .filter(|v| v.stock != StockState::Unknown)
        .count()
        .min(MAX_SCORED_VARIANTS) as f64;

    2.0 * has_price + stock_score + 0.25 * known_variants + result.confidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_product_handles() {
        assert_eq!(
            product_handle("https://store.example.com/products/day-bag?variant=1"),
            Some(("https://store.example.com".into(), "day-bag".into()))
        );
        assert_eq!(
            product_handle("https://store.example.com/collections/all/products/tee"),
            Some(("https://store.example.com".into(), "tee".into()))
        );
        assert_eq!(product_handle("https://store.example.com/cart"), None);
        assert_eq!(product_handle("not a url"), None);
    }

    #[test]
    fn json_endpoint_partial_stock() {
        // One variant gone, one purchasable: price follows the purchasable one.
        let body = r#"{"product":{"title":"Filter Pack","variants":[
            {"title":"P2S","price":"39.99","available":false},
            {"title":"X1C","price":"42.50","available":true}
        ]}}"#;
        let parsed: JsonProductEnvelope = serde_json::from_str(body).unwrap();
        let product = ParsedProduct {
            name: parsed.product.title,
            variants: parsed
                .product
                .variants
                .into_iter()
                .map(|v| (v.title, price_value(&v.price, Endpoint::Json), v.available))
                .collect(),
        };
        let result = build_result(product, Endpoint::Json, body, "https://s/products/x.json");

        assert_eq!(result.method, ExtractionMethod::ShopifyJson);
        assert_eq!(result.price_cents, Some(4250));
        assert_eq!(result.stock_state, StockState::Partial);
        assert_eq!(result.in_stock, Some(true));
        let labels: Vec<_> = result.variant_stock.iter().map(|v| v.label.as_str()).collect();
        assert!(labels.contains(&"P2S") && labels.contains(&"X1C"));
        // 0.84 + price + stock + variants, capped.
        assert!((result.confidence - 0.99).abs() < 1e-9);
    }

    #[test]
    fn js_endpoint_prices_are_cents() {
        let body = r#"{"title":"Day Bag","variants":[
            {"title":"Black","price":4250,"available":true}
        ]}"#;
        let parsed: JsProduct = serde_json::from_str(body).unwrap();
        let product = ParsedProduct {
            name: parsed.title,
            variants: parsed
                .variants
                .into_iter()
                .map(|v| (v.title, price_value(&v.price, Endpoint::Js), v.available))
                .collect(),
        };
        let result = build_result(product, Endpoint::Js, body, "https://s/products/x.js");

        assert_eq!(result.price_cents, Some(4250));
        assert_eq!(result.stock_state, StockState::InStock);
        assert_eq!(result.product_name.as_deref(), Some("Day Bag"));
    }

    #[test]
    fn unpriced_unavailable_product_scores_low() {
        let product = ParsedProduct {
            name: Some("Ghost".into()),
            variants: vec![],
        };
        let result = build_result(product, Endpoint::Json, "{}", "https://s/products/x.json");
        assert_eq!(result.price_cents, None);
        assert_eq!(result.stock_state, StockState::Unknown);
        assert!((result.confidence - BASE_CONFIDENCE).abs() < 1e-9);
        assert!(adapter_score(&result) < 1.0);
    }

    #[test]
    fn partial_outscores_plain_in_stock() {
        let partial = build_result(
            ParsedProduct {
                name: Some("A".into()),
                variants: vec![
                    (Some("S".into()), Some(1000), Some(true)),
                    (Some("L".into()), Some(1000), Some(false)),
                ],
            },
            Endpoint::Json,
            "{}",
            "u",
        );
        let plain = build_result(
            ParsedProduct {
                name: Some("A".into()),
                variants: vec![(Some("S".into()), Some(1000), Some(true))],
            },
            Endpoint::Json,
            "{}",
            "u",
        );
        assert!(adapter_score(&partial) > adapter_score(&plain));
    }
}
