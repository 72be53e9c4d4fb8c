//! Stock-state arbitration for static HTML.
//!
//! Stock signals on real product pages conflict constantly: a page can say
//! "currently unavailable" in a shipping FAQ while showing an enabled
//! "Add to cart" button. This module scores both directions from several
//! independent signal families and resolves them through a fixed precedence
//! ladder instead of trusting any single source.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

use crate::models::{StockSignals, StockState, VariantStock};

pub struct StockDetection {
    pub stock_state: StockState,
    pub variant_stock: Vec<VariantStock>,
    pub signals: StockSignals,
}

const MAX_VARIANTS: usize = 8;
const MAX_EMBEDDED_SIGNALS: u32 = 8;

static OUT_PATTERNS: Lazy<Vec<(Regex, f64)>> = Lazy::new(|| {
    vec![
        (re(r"(?i)out of stock|sold out"), 2.0),
        (re(r"(?i)temporarily out of stock"), 1.6),
        (re(r"(?i)currently unavailable"), 1.4),
        (re(r"(?i)back[- ]?ordered"), 1.2),
        (re(r"(?i)pre[- ]?order"), 0.8),
        (re(r"(?i)unavailable"), 0.5),
    ]
});

static IN_PATTERNS: Lazy<Vec<(Regex, f64)>> = Lazy::new(|| {
    vec![
        (re(r"(?i)add to cart|buy now"), 2.1),
        (re(r"(?i)in stock"), 1.5),
        (re(r"(?i)available now|ready to ship|ships today"), 1.1),
    ]
});

static CTA_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)add to (?:cart|bag|basket)|buy (?:it )?now|purchase"));

static STOCK_SCOPE_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(r#"[class*="stock"], [id*="stock"], [class*="availability"], [id*="availability"]"#)
});

static AVAILABILITY_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(r#"meta[itemprop="availability"], link[itemprop="availability"], [itemprop="availability"]"#)
});

static CTA_SEL: Lazy<Selector> =
    Lazy::new(|| sel(r#"button, input[type="submit"], a[role="button"]"#));

static VARIANT_SEL: Lazy<Selector> = Lazy::new(|| {
    sel(
        r#"select option, [data-size], [data-model], [data-variant], [data-option], [class*="variant"], [class*="swatch"], [class*="size"], [class*="model"]"#,
    )
});

static EMBEDDED_OUT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        re(r#""isSoldOut"\s*:\s*true"#),
        re(r#""availability"\s*:\s*"[^"]*OutOfStock[^"]*""#),
        re(r#""outOfStockMsg"\s*:\s*""#),
    ]
});

static EMBEDDED_IN_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        re(r#""isSoldOut"\s*:\s*false"#),
        re(r#""availability"\s*:\s*"[^"]*InStock[^"]*""#),
    ]
});

static LABEL_NOISE_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)[\s\-–—:(\[]*(out of stock|sold out|in stock|currently unavailable|unavailable|available)[)\]]*")
});

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("stock regex")
}

fn sel(selectors: &str) -> Selector {
    Selector::parse(selectors).expect("stock selector")
}

/// Run the full stock pass over a parsed document.
///
/// `body_text` is the script-free visible text (built once by the caller);
/// `raw_html` is the original markup, scanned for embedded JSON inventory
/// signals; `json_ld` are the parsed ld+json blocks for per-offer variants.
pub fn detect(
    doc: &Html,
    raw_html: &str,
    body_text: &str,
    json_ld: &[serde_json::Value],
) -> StockDetection {
    let mut signals = StockSignals::default();

    // Text patterns, scored over the full body and again over the subset of
    // elements whose class/id mention stock or availability.
    let scoped_text = scoped_stock_text(doc);
    for scope in [body_text, scoped_text.as_str()] {
        signals.out_score += score_patterns(scope, &OUT_PATTERNS);
        signals.in_score += score_patterns(scope, &IN_PATTERNS);
    }

    score_schema_availability(doc, &mut signals);
    score_purchase_ctas(doc, &mut signals);
    score_embedded_json(raw_html, &mut signals);

    let page_state = resolve_page_state(&signals);
    let variant_stock = extract_variants(doc, json_ld);

    StockDetection {
        stock_state: page_state,
        variant_stock,
        signals,
    }
}

fn score_patterns(text: &str, patterns: &[(Regex, f64)]) -> f64 {
    patterns
        .iter()
        .map(|(regex, weight)| {
            let matches = regex.find_iter(text).take(3).count() as f64;
            matches.min(3.0) * weight
        })
        .sum()
}

fn scoped_stock_text(doc: &Html) -> String {
    let mut out = String::new();
    for el in doc.select(&STOCK_SCOPE_SEL) {
        for piece in el.text() {
            out.push_str(piece);
            out.push(' ');
        }
    }
    out
}

/// Explicit schema.org availability values are the strongest static signal.
fn score_schema_availability(doc: &Html, signals: &mut StockSignals) {
    for el in doc.select(&AVAILABILITY_SEL) {
        let value = el
            .value()
            .attr("content")
            .or_else(|| el.value().attr("href"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| el.text().collect::<String>());

        match classify_schema_availability(&value) {
            Some(true) => {
                signals.explicit_in += 1;
                signals.in_score += 3.0;
            }
            Some(false) => {
                signals.explicit_out += 1;
                signals.out_score += 3.0;
            }
            None => {}
        }
    }
}

pub(crate) fn classify_schema_availability(value: &str) -> Option<bool> {
    if value.contains("OutOfStock") || value.contains("SoldOut") || value.contains("Discontinued") {
        Some(false)
    } else if value.contains("InStock") {
        Some(true)
    } else {
        None
    }
}

/// A visible, enabled purchase button is worth more than any amount of page
/// copy; disabled purchase buttons lean the other way.
fn score_purchase_ctas(doc: &Html, signals: &mut StockSignals) {
    for el in doc.select(&CTA_SEL) {
        let label = if el.value().name() == "input" {
            el.value().attr("value").unwrap_or_default().to_string()
        } else {
            el.text().collect::<String>()
        };
        if !CTA_RE.is_match(&label) {
            continue;
        }
        if is_hidden(el) || is_in_page_chrome(el) {
            continue;
        }

        let disabled = el.value().attr("disabled").is_some()
            || el.value().attr("aria-disabled") == Some("true");
        if disabled {
            signals.disabled_cta += 1;
        } else {
            signals.enabled_cta += 1;
        }
    }

    if signals.enabled_cta > 0 {
        signals.in_score += 3.0 + signals.enabled_cta.min(2) as f64;
    }
    if signals.disabled_cta > 0 {
        signals.out_score += 1.0 + signals.disabled_cta.min(2) as f64;
    }
}

fn is_hidden(el: ElementRef) -> bool {
    let hidden_attr = |e: ElementRef| {
        e.value().attr("hidden").is_some() || e.value().attr("aria-hidden") == Some("true")
    };
    hidden_attr(el)
        || el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(hidden_attr)
}

fn is_in_page_chrome(el: ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "header" | "nav" | "footer"))
}

/// Inventory flags inside embedded JSON (Shopify-style storefront state).
fn score_embedded_json(raw_html: &str, signals: &mut StockSignals) {
    let out_count: usize = EMBEDDED_OUT_RES
        .iter()
        .map(|r| r.find_iter(raw_html).count())
        .sum();
    let in_count: usize = EMBEDDED_IN_RES
        .iter()
        .map(|r| r.find_iter(raw_html).count())
        .sum();

    signals.embedded_out = out_count.min(u32::MAX as usize) as u32;
    signals.embedded_in = in_count.min(u32::MAX as usize) as u32;
    signals.out_score += signals.embedded_out.min(MAX_EMBEDDED_SIGNALS) as f64 * 1.6;
    signals.in_score += signals.embedded_in.min(MAX_EMBEDDED_SIGNALS) as f64 * 1.2;
}

/// Precedence ladder: explicit markup beats embedded JSON beats an enabled
/// CTA beats score margins. Order matters and is fixed.
fn resolve_page_state(s: &StockSignals) -> StockState {
    if s.explicit_in > 0 && s.explicit_out == 0 {
        return StockState::InStock;
    }
    if s.explicit_out > 0 && s.explicit_in == 0 && s.enabled_cta == 0 {
        return StockState::OutOfStock;
    }
    if s.embedded_out > 0 && s.embedded_in == 0 && s.enabled_cta == 0 {
        return StockState::OutOfStock;
    }
    if s.enabled_cta > 0 && s.in_score >= s.out_score - 2.0 {
        return StockState::InStock;
    }
    if s.out_score >= s.in_score + 3.0 && s.out_score >= 3.0 {
        return StockState::OutOfStock;
    }
    if s.in_score >= s.out_score + 2.0 && s.in_score >= 2.0 {
        return StockState::InStock;
    }
    StockState::Unknown
}

/// Classify free-form availability text attached to a single variant.
pub(crate) fn classify_variant_text(text: &str) -> StockState {
    let lower = text.to_ascii_lowercase();
    if lower.contains("out of stock")
        || lower.contains("sold out")
        || lower.contains("unavailable")
    {
        StockState::OutOfStock
    } else if lower.contains("in stock")
        || lower.contains("add to cart")
        || lower.contains("available")
    {
        StockState::InStock
    } else {
        StockState::Unknown
    }
}

fn extract_variants(doc: &Html, json_ld: &[serde_json::Value]) -> Vec<VariantStock> {
    let mut out: Vec<VariantStock> = Vec::new();
    let mut seen: HashSet<(String, StockState)> = HashSet::new();

    let mut push = |label: Option<String>, stock: StockState, out: &mut Vec<VariantStock>| {
        if out.len() >= MAX_VARIANTS {
            return;
        }
        let Some(label) = label else { return };
        let key = (label.to_lowercase(), stock);
        if seen.insert(key) {
            out.push(VariantStock { label, stock });
        }
    };

    // JSON-LD offers first; they carry the cleanest per-variant availability.
    for block in json_ld {
        for offer in offers_of(block) {
            let label = offer
                .get("name")
                .and_then(|v| v.as_str())
                .or_else(|| offer.get("sku").and_then(|v| v.as_str()))
                .and_then(sanitize_variant_label);
            let stock = offer
                .get("availability")
                .and_then(|v| v.as_str())
                .map(|v| match classify_schema_availability(v) {
                    Some(true) => StockState::InStock,
                    Some(false) => StockState::OutOfStock,
                    None => StockState::Unknown,
                })
                .unwrap_or(StockState::Unknown);
            push(label, stock, &mut out);
        }
    }

    for el in doc.select(&VARIANT_SEL) {
        if out.len() >= MAX_VARIANTS {
            break;
        }

        let raw_label = if el.value().name() == "option" {
            let text = el.text().collect::<String>();
            if text.trim().is_empty() {
                el.value().attr("value").unwrap_or_default().to_string()
            } else {
                text
            }
        } else {
            el.text().collect::<String>()
        };

        let disabled = el.value().attr("disabled").is_some()
            || el.value().attr("aria-disabled") == Some("true");
        let stock = if disabled {
            StockState::OutOfStock
        } else {
            classify_variant_text(&raw_label)
        };

        push(sanitize_variant_label(&raw_label), stock, &mut out);
    }

    out
}

/// Offers may be a single object, an array, or nested under `offers.offers`.
fn offers_of(block: &serde_json::Value) -> Vec<&serde_json::Value> {
    match block.get("offers") {
        Some(serde_json::Value::Array(items)) => items.iter().collect(),
        Some(obj @ serde_json::Value::Object(_)) => match obj.get("offers") {
            Some(serde_json::Value::Array(items)) => items.iter().collect(),
            _ => vec![obj],
        },
        _ => Vec::new(),
    }
}

/// Variant labels come from messy DOM text; strip availability noise and
/// reject placeholder labels before keeping one.
pub(crate) fn sanitize_variant_label(raw: &str) -> Option<String> {
    let stripped = LABEL_NOISE_RE.replace_all(raw, " ");
    let collapsed: String = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let label = collapsed.trim().to_string();

    if label.is_empty() || label.len() > 64 {
        return None;
    }
    if !label.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let lower = label.to_ascii_lowercase();
    if matches!(lower.as_str(), "select" | "size" | "default title") || lower.starts_with("select ")
    {
        return None;
    }

    Some(label)
}

/// Collapse per-variant states into one page-level verdict.
pub fn variant_state(variants: &[VariantStock]) -> StockState {
    let known_in = variants
        .iter()
        .filter(|v| v.stock == StockState::InStock)
        .count();
    let known_out = variants
        .iter()
        .filter(|v| v.stock == StockState::OutOfStock)
        .count();

    match (known_in, known_out) {
        (0, 0) => StockState::Unknown,
        (_, 0) => StockState::InStock,
        (0, _) => StockState::OutOfStock,
        _ => StockState::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_html(html: &str) -> StockDetection {
        let doc = Html::parse_document(html);
        let body_text = crate::extract::html::visible_text(&doc);
        let json_ld = crate::extract::html::parse_json_ld(&doc);
        detect(&doc, html, &body_text, &json_ld)
    }

    #[test]
    fn explicit_schema_in_stock_wins() {
        let html = r#"<html><body>
            <link itemprop="availability" href="http://schema.org/InStock">
            <p>shipping may be unavailable in your region</p>
        </body></html>"#;
        let d = detect_html(html);
        assert_eq!(d.stock_state, StockState::InStock);
        assert_eq!(d.signals.explicit_in, 1);
    }

    #[test]
    fn explicit_schema_out_of_stock() {
        let html = r#"<html><body>
            <meta itemprop="availability" content="https://schema.org/OutOfStock">
            <p>Check back soon</p>
        </body></html>"#;
        let d = detect_html(html);
        assert_eq!(d.stock_state, StockState::OutOfStock);
    }

    #[test]
    fn enabled_cta_overrides_unavailable_noise() {
        // "currently unavailable" copy loses to live buy buttons.
        let html = r#"<html><body>
            <p>Some shipping options are currently unavailable.</p>
            <button>Add to cart</button>
            <button>Buy now</button>
            <span class="price">$129.99</span>
        </body></html>"#;
        let d = detect_html(html);
        assert_eq!(d.signals.enabled_cta, 2);
        assert_eq!(d.stock_state, StockState::InStock);
    }

    #[test]
    fn disabled_cta_with_sold_out_copy_is_out() {
        let html = r#"<html><body>
            <div class="stock-status">Sold out</div>
            <button disabled>Add to cart</button>
        </body></html>"#;
        let d = detect_html(html);
        assert_eq!(d.signals.enabled_cta, 0);
        assert_eq!(d.stock_state, StockState::OutOfStock);
    }

    #[test]
    fn embedded_json_out_signals_decide_without_cta() {
        let html = r#"<html><head><script>
            var state = {"product":{"isSoldOut":true,"outOfStockMsg":"Gone for the season"}};
        </script></head><body><p>Great product</p></body></html>"#;
        let d = detect_html(html);
        assert!(d.signals.embedded_out >= 1);
        assert_eq!(d.signals.embedded_in, 0);
        assert_eq!(d.stock_state, StockState::OutOfStock);
    }

    #[test]
    fn ctas_inside_page_chrome_do_not_count() {
        let html = r#"<html><body>
            <header><button>Buy now</button></header>
            <footer><a role="button">Add to cart</a></footer>
        </body></html>"#;
        let d = detect_html(html);
        // The CTA elements themselves are excluded; only their body text scores.
        assert_eq!(d.signals.enabled_cta, 0);
        assert!(d.signals.in_score < 5.0);
    }

    #[test]
    fn hidden_cta_does_not_count() {
        let html = r#"<html><body>
            <div hidden><button>Add to cart</button></div>
        </body></html>"#;
        let d = detect_html(html);
        assert_eq!(d.signals.enabled_cta, 0);
    }

    #[test]
    fn quiet_page_is_unknown() {
        let html = "<html><body><h1>Widget</h1><p>A nice widget.</p></body></html>";
        let d = detect_html(html);
        assert_eq!(d.stock_state, StockState::Unknown);
    }

    #[test]
    fn variant_options_classified_and_capped() {
        let html = r#"<html><body><select>
            <option>Select</option>
            <option value="s">Small - In stock</option>
            <option value="m" disabled>Medium</option>
            <option value="l">Large - Sold out</option>
        </select></body></html>"#;
        let d = detect_html(html);
        let labels: Vec<_> = d.variant_stock.iter().map(|v| v.label.as_str()).collect();
        assert!(labels.contains(&"Small"));
        assert!(labels.contains(&"Medium"));
        assert!(labels.contains(&"Large"));
        assert!(!labels.iter().any(|l| l.eq_ignore_ascii_case("select")));

        let medium = d.variant_stock.iter().find(|v| v.label == "Medium").unwrap();
        assert_eq!(medium.stock, StockState::OutOfStock);
        let small = d.variant_stock.iter().find(|v| v.label == "Small").unwrap();
        assert_eq!(small.stock, StockState::InStock);
    }

    #[test]
    fn variant_state_resolution() {
        let mixed = vec![
            VariantStock { label: "A".into(), stock: StockState::InStock },
            VariantStock { label: "B".into(), stock: StockState::OutOfStock },
        ];
        assert_eq!(variant_state(&mixed), StockState::Partial);

        let unknown_only = vec![VariantStock { label: "A".into(), stock: StockState::Unknown }];
        assert_eq!(variant_state(&unknown_only), StockState::Unknown);
        assert_eq!(variant_state(&[]), StockState::Unknown);
    }

    #[test]
    fn sanitize_label_rules() {
        assert_eq!(sanitize_variant_label("  Small - Sold Out "), Some("Small".into()));
        assert_eq!(sanitize_variant_label("Default Title"), None);
        assert_eq!(sanitize_variant_label("Select"), None);
        assert_eq!(sanitize_variant_label("---"), None);
        assert_eq!(sanitize_variant_label(""), None);
        assert!(sanitize_variant_label(&"x".repeat(80)).is_none());
    }
}
