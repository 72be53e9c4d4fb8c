//! Product-name cleanup shared by the static and AI extraction tiers.
//! Listing titles are marketing copy; snapshots want the short canonical name
//! plus the model number when the title buries one.

use once_cell::sync::Lazy;
use regex::Regex;

static MODEL_CORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(Core)\s+([A-Z0-9-]{3,})\b").expect("core model regex"));

static MODEL_GENERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]+[0-9]{2,}[A-Z0-9-]*\b").expect("generic model regex"));

/// Trim a raw listing title down to a stable product name.
pub fn normalize_product_name(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    // Everything after the first qualifier clause is marketing noise.
    let mut cut = raw.len();
    for sep in [" with ", " for ", ","] {
        if let Some(pos) = raw.find(sep) {
            cut = cut.min(pos);
        }
    }
    let mut name = raw[..cut].trim().to_string();
    if name.is_empty() {
        name = raw.to_string();
    }

    name = name.replace("Air Purifiers", "Air Purifier");

    // Model hint scanned over the full raw title; last match wins.
    let hint = MODEL_CORE_RE
        .captures_iter(raw)
        .last()
        .map(|c| c[2].to_string())
        .or_else(|| {
            MODEL_GENERIC_RE
                .find_iter(raw)
                .last()
                .map(|m| m.as_str().to_string())
        });

    if let Some(model) = hint {
        let model = model.strip_suffix("-P").unwrap_or(&model).to_string();
        if !name.contains(&model) {
            name = format!("{} - {}", name, model);
        }
    }

    name
}
