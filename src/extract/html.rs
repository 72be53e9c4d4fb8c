//! Static HTML extraction: candidate voting over heterogeneous price sources
//! plus the independent stock pass from `stock.rs`.
//!
//! Every source contributes to one candidate pool; the final result is a pure
//! fold over that pool, so no source needs to know about any other.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};

use crate::extract::price::{find_currency_price, parse_price, ParsedPrice};
use crate::extract::{normalize::normalize_product_name, stock};
use crate::models::{ExtractResult, ExtractionMethod, StockState};

/// One scored extraction candidate. The pool is folded into the final result.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: &'static str,
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub score: f64,
    pub evidence: String,
}

const SCORE_CAP: f64 = 0.99;
const AMBIGUITY_GAP: f64 = 0.05;
const AMBIGUITY_PENALTY: f64 = 0.10;
const AMBIGUITY_FLOOR: f64 = 0.50;
const MAX_EVIDENCE_CANDIDATES: usize = 12;

static JSON_LD_SEL: Lazy<Selector> =
    Lazy::new(|| sel(r#"script[type="application/ld+json"]"#));
static META_PRICE_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(
        r#"meta[property="og:price:amount"], meta[property="product:price:amount"], meta[itemprop="price"]"#,
    )
});
static DOM_PRICE_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(
        r#"[class*="price"], [id*="price"], [data-price], [itemprop="price"], .product-price, .price"#,
    )
});
static OG_TITLE_SEL: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:title"]"#));
static META_DESC_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(r#"meta[name="description"], meta[property="og:description"]"#)
});
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| sel("title"));
static H1_SEL: Lazy<Selector> = Lazy::new(|| sel("h1"));

static PRODUCT_SKU_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"productSku"\s*:\s*\{.{0,400}?"price"\s*:\s*"?([0-9][0-9.,]*)"?"#)
        .expect("productSku regex")
});
static DEFAULT_PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""defaultPrice"\s*:\s*"?([0-9][0-9.,]*)"?"#).expect("defaultPrice regex")
});

const DEFAULT_PRICE_CONTEXT: usize = 240;

fn sel(selectors: &str) -> Selector {
    Selector::parse(selectors).expect("html selector")
}

/// Extract a full result from static HTML. Pure and synchronous; the caller
/// owns all fetching.
pub fn extract_static(html: &str, url: &str) -> ExtractResult {
    let doc = Html::parse_document(html);
    let body_text = visible_text(&doc);
    let json_ld = parse_json_ld(&doc);

    let mut candidates = collect_candidates(&doc, html, &body_text, &json_ld);
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    apply_ambiguity_penalty(&mut candidates);

    let stock::StockDetection {
        stock_state: page_state,
        variant_stock,
        signals,
    } = stock::detect(&doc, html, &body_text, &json_ld);
    let vstate = stock::variant_state(&variant_stock);
    let final_state = merge_states(page_state, &variant_stock, vstate);

    let best_score = candidates.first().map(|c| c.score).unwrap_or(0.0);
    let confidence = match final_state {
        StockState::Unknown => best_score,
        StockState::Partial => best_score.max(0.80),
        _ => best_score.max(0.75),
    };

    let product_name = pick_name(&candidates, &doc)
        .map(|n| normalize_product_name(&n))
        .filter(|n| !n.is_empty());
    let price_cents = candidates.first().and_then(|c| c.price_cents);

    let title = first_text(&doc, &TITLE_SEL);
    let meta_description = first_attr(&doc, &META_DESC_SEL, "content");

    let evidence = serde_json::json!({
        "url": url,
        "title": title,
        "meta": meta_description,
        "chosenSource": candidates.first().map(|c| c.source),
        "candidates": candidates
            .iter()
            .take(MAX_EVIDENCE_CANDIDATES)
            .map(|c| serde_json::json!({
                "source": c.source,
                "name": c.name,
                "priceCents": c.price_cents,
                "score": (c.score * 1000.0).round() / 1000.0,
                "evidence": c.evidence,
            }))
            .collect::<Vec<_>>(),
        "stock": &signals,
        "variantState": vstate.as_str(),
    });

    ExtractResult {
        product_name,
        price_cents,
        in_stock: final_state.in_stock(),
        stock_state: final_state,
        variant_stock,
        confidence,
        method: ExtractionMethod::Static,
        evidence,
        content_hash: content_hash(html),
        signals,
    }
}

pub fn content_hash(html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    hex::encode(hasher.finalize())
}

/// Page text excluding script/style subtrees, roughly `innerText`.
pub fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let scripted = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| matches!(a.value().name(), "script" | "style" | "noscript"));
        if !scripted {
            out.push_str(text);
            out.push(' ');
        }
    }
    out
}

/// Parse all ld+json blocks, flattening arrays and `@graph` containers.
/// Malformed blocks are skipped, never surfaced.
pub fn parse_json_ld(doc: &Html) -> Vec<serde_json::Value> {
    let mut blocks = Vec::new();
    for script in doc.select(&JSON_LD_SEL) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw.trim()) else {
            tracing::debug!("skipping malformed ld+json block");
            continue;
        };
        flatten_json_ld(value, &mut blocks);
    }
    blocks
}

fn flatten_json_ld(value: serde_json::Value, out: &mut Vec<serde_json::Value>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_json_ld(item, out);
            }
        }
        serde_json::Value::Object(ref map) => {
            if let Some(serde_json::Value::Array(graph)) = map.get("@graph") {
                for item in graph.clone() {
                    flatten_json_ld(item, out);
                }
            }
            out.push(value);
        }
        _ => {}
    }
}

fn collect_candidates(
    doc: &Html,
    raw_html: &str,
    body_text: &str,
    json_ld: &[serde_json::Value],
) -> Vec<Candidate> {
    let mut out = Vec::new();

    for block in json_ld.iter().filter(|b| is_product_block(b)) {
        if let Some(candidate) = json_ld_candidate(block) {
            out.push(candidate);
        }
    }

    if let Some(candidate) = product_sku_candidate(raw_html) {
        out.push(candidate);
    }
    if let Some(candidate) = default_price_candidate(raw_html) {
        out.push(candidate);
    }
    if let Some(candidate) = meta_candidate(doc) {
        out.push(candidate);
    }
    if let Some(candidate) = dom_candidate(doc) {
        out.push(candidate);
    }
    if let Some(price) = find_currency_price(body_text) {
        out.push(scored(
            "body_scan",
            None,
            Some(price),
            0.60,
            "currency symbol in body text".to_string(),
        ));
    }

    out
}

fn scored(
    source: &'static str,
    name: Option<String>,
    price: Option<ParsedPrice>,
    base: f64,
    evidence: String,
) -> Candidate {
    let mut score = base;
    if name.is_some() {
        score += 0.05;
    }
    if price.is_some() {
        score += 0.05;
    }
    Candidate {
        source,
        name,
        price_cents: price.map(|p| p.price_cents),
        score: score.min(SCORE_CAP),
        evidence,
    }
}

/// Runner-up disagreement on price drags the winner down.
fn apply_ambiguity_penalty(candidates: &mut [Candidate]) {
    if candidates.len() < 2 {
        return;
    }
    let (top_price, top_score) = (candidates[0].price_cents, candidates[0].score);
    let second = &candidates[1];
    let disagrees = matches!((top_price, second.price_cents), (Some(a), Some(b)) if a != b);
    if disagrees && (top_score - second.score) < AMBIGUITY_GAP {
        candidates[0].score = (top_score - AMBIGUITY_PENALTY).max(AMBIGUITY_FLOOR);
    }
}

fn is_product_block(block: &serde_json::Value) -> bool {
    match block.get("@type") {
        Some(serde_json::Value::String(t)) => t == "Product",
        Some(serde_json::Value::Array(types)) => {
            types.iter().any(|t| t.as_str() == Some("Product"))
        }
        _ => false,
    }
}

fn json_ld_candidate(block: &serde_json::Value) -> Option<Candidate> {
    let name = block
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut price = None;
    let mut has_availability = false;
    for offer in offers_of(block) {
        if price.is_none() {
            price = offer
                .get("price")
                .or_else(|| offer.get("lowPrice"))
                .and_then(json_price);
        }
        has_availability |= offer.get("availability").is_some();
    }

    if name.is_none() && price.is_none() && !has_availability {
        return None;
    }

    let base = if price.is_some() { 0.95 } else { 0.88 };
    Some(scored(
        "json_ld",
        name,
        price,
        base,
        "schema.org Product block".to_string(),
    ))
}

fn offers_of(block: &serde_json::Value) -> Vec<&serde_json::Value> {
    match block.get("offers") {
        Some(serde_json::Value::Array(items)) => items.iter().collect(),
        Some(obj @ serde_json::Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn json_price(value: &serde_json::Value) -> Option<ParsedPrice> {
    match value {
        serde_json::Value::String(s) => parse_price(s),
        serde_json::Value::Number(n) => {
            let v = n.as_f64()?;
            (v.is_finite() && v > 0.0).then(|| ParsedPrice {
                price_cents: (v * 100.0).round() as i64,
                raw_number: v,
            })
        }
        _ => None,
    }
}

fn product_sku_candidate(raw_html: &str) -> Option<Candidate> {
    let caps = PRODUCT_SKU_RE.captures(raw_html)?;
    let price = parse_price(caps.get(1)?.as_str())?;
    Some(scored(
        "product_sku",
        None,
        Some(price),
        0.92,
        "embedded productSku state".to_string(),
    ))
}

fn default_price_candidate(raw_html: &str) -> Option<Candidate> {
    for caps in DEFAULT_PRICE_RE.captures_iter(raw_html) {
        let whole = caps.get(0)?;
        let start = floor_char_boundary(raw_html, whole.start().saturating_sub(DEFAULT_PRICE_CONTEXT));
        let end = ceil_char_boundary(
            raw_html,
            (whole.end() + DEFAULT_PRICE_CONTEXT).min(raw_html.len()),
        );
        let context = raw_html[start..end].to_ascii_lowercase();
        if !context.contains("product") && !context.contains("sku") {
            continue;
        }
        if let Some(price) = parse_price(caps.get(1)?.as_str()) {
            return Some(scored(
                "default_price",
                None,
                Some(price),
                0.86,
                "embedded defaultPrice near product context".to_string(),
            ));
        }
    }
    None
}

fn meta_candidate(doc: &Html) -> Option<Candidate> {
    let price = doc
        .select(&META_PRICE_SEL)
        .filter_map(|el| el.value().attr("content"))
        .find_map(parse_price)?;
    let name = first_attr(doc, &OG_TITLE_SEL, "content");
    Some(scored(
        "meta_tags",
        name,
        Some(price),
        0.82,
        "price meta tag".to_string(),
    ))
}

fn dom_candidate(doc: &Html) -> Option<Candidate> {
    for el in doc.select(&DOM_PRICE_SEL) {
        let price = el
            .value()
            .attr("data-price")
            .and_then(parse_price)
            .or_else(|| {
                let text = el.text().collect::<String>();
                // Large containers match [class*="price"] too; skip them.
                (text.trim().len() <= 120).then(|| parse_price(&text)).flatten()
            });
        if let Some(price) = price {
            let name = first_text(doc, &H1_SEL);
            return Some(scored(
                "dom_selector",
                name,
                Some(price),
                0.72,
                "price-like DOM element".to_string(),
            ));
        }
    }
    None
}

fn pick_name(candidates: &[Candidate], doc: &Html) -> Option<String> {
    candidates
        .iter()
        .find_map(|c| c.name.clone())
        .or_else(|| first_attr(doc, &OG_TITLE_SEL, "content"))
        .or_else(|| {
            first_text(doc, &TITLE_SEL)
                .map(|t| t.split('|').next().unwrap_or(&t).trim().to_string())
        })
        .or_else(|| first_text(doc, &H1_SEL))
        .filter(|s| !s.is_empty())
}

fn merge_states(
    page_state: StockState,
    variants: &[crate::models::VariantStock],
    vstate: StockState,
) -> StockState {
    let any_in = variants.iter().any(|v| v.stock == StockState::InStock);
    let any_out = variants.iter().any(|v| v.stock == StockState::OutOfStock);
    if any_in && any_out {
        return StockState::Partial;
    }
    if vstate == page_state {
        return page_state;
    }
    if page_state == StockState::Unknown {
        return vstate;
    }
    page_state
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_attr(doc: &Html, selector: &Selector, attr: &str) -> Option<String> {
    doc.select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_ld_product_is_high_confidence() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Product","name":"Widget Pro","offers":{"price":"49.99","availability":"https://schema.org/InStock"}}
        </script></head><body><h1>Widget Pro</h1></body></html>"#;
        let result = extract_static(html, "https://shop.example.com/p/widget");

        assert_eq!(result.product_name.as_deref(), Some("Widget Pro"));
        assert_eq!(result.price_cents, Some(4999));
        assert!(result.confidence >= 0.85, "confidence {}", result.confidence);
        assert_eq!(result.method, ExtractionMethod::Static);
        // A single ld+json availability string only feeds the embedded mirror
        // counter; it is not explicit markup, so the page stays UNKNOWN.
        assert_eq!(result.signals.embedded_in, 1);
    }

    #[test]
    fn body_scan_only_is_low_confidence() {
        let html = r#"<html><body><h1>Widget</h1><p>Just $19.99 this week</p></body></html>"#;
        let result = extract_static(html, "https://a.com/p");

        assert_eq!(result.price_cents, Some(1999));
        assert!(result.confidence < 0.85, "confidence {}", result.confidence);
        assert_eq!(result.stock_state, StockState::Unknown);
        assert_eq!(result.in_stock, None);
    }

    #[test]
    fn meta_price_tier() {
        let html = r#"<html><head>
            <meta property="og:title" content="Desk Lamp">
            <meta property="og:price:amount" content="39.00">
        </head><body></body></html>"#;
        let result = extract_static(html, "https://a.com/p");

        assert_eq!(result.price_cents, Some(3900));
        assert_eq!(result.product_name.as_deref(), Some("Desk Lamp"));
        // 0.82 base + name + price bonuses.
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn runner_up_disagreement_penalizes_winner() {
        // json_ld (capped 0.99) vs productSku (0.97) with different prices.
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Product","name":"Widget","offers":{"price":"49.99"}}
        </script><script>
            window.state = {"productSku":{"sku":"W-1","price":"44.99","isSoldOut":false}};
        </script></head><body></body></html>"#;
        let result = extract_static(html, "https://a.com/p");

        // Winner stays json_ld but drops by the ambiguity penalty.
        assert_eq!(result.price_cents, Some(4999));
        assert!(
            (result.confidence - 0.89).abs() < 1e-9,
            "confidence {}",
            result.confidence
        );
    }

    #[test]
    fn variant_offers_yield_partial_and_floor() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Product","name":"Tee","offers":[
                {"name":"Small","price":"20.00","availability":"https://schema.org/InStock"},
                {"name":"Large","price":"20.00","availability":"https://schema.org/OutOfStock"}
            ]}
        </script></head><body></body></html>"#;
        let result = extract_static(html, "https://a.com/p");

        assert_eq!(result.stock_state, StockState::Partial);
        assert_eq!(result.in_stock, Some(true));
        assert!(result.confidence >= 0.80);
        let labels: Vec<_> = result.variant_stock.iter().map(|v| v.label.as_str()).collect();
        assert!(labels.contains(&"Small") && labels.contains(&"Large"));
    }

    #[test]
    fn content_hash_stable_for_identical_input() {
        let html = "<html><body>same bytes</body></html>";
        let a = extract_static(html, "https://a.com/p");
        let b = extract_static(html, "https://a.com/p");
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn malformed_json_ld_is_skipped() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Product", broken json
        </script></head><body><p>$12.00</p></body></html>"#;
        let result = extract_static(html, "https://a.com/p");
        assert_eq!(result.price_cents, Some(1200));
    }

    #[test]
    fn name_falls_back_to_title() {
        let html = r#"<html><head><title>Mug | Shop</title></head>
            <body><p>$9.99</p></body></html>"#;
        let result = extract_static(html, "https://a.com/p");
        assert_eq!(result.product_name.as_deref(), Some("Mug"));
    }

    #[test]
    fn evidence_carries_candidates_and_stock_signals() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Product","name":"Widget","offers":{"price":"10.00"}}
        </script></head><body><button>Add to cart</button></body></html>"#;
        let result = extract_static(html, "https://a.com/p");

        let candidates = result.evidence["candidates"].as_array().unwrap();
        assert!(!candidates.is_empty());
        assert_eq!(result.evidence["chosenSource"], "json_ld");
        assert!(result.evidence["stock"]["enabledCta"].as_u64().unwrap() >= 1);
    }
}
