//! Canonical URL normalization.
//! The canonical form is the dedupe key for tracked items: tracking params
//! stripped, query sorted, fragment dropped, single trailing slash removed.

use anyhow::{Context, Result};
use url::Url;

/// Query parameters dropped when the (lowercased) name starts with one of these.
const TRACKING_PREFIXES: &[&str] = &[
    "utm_", "fbclid", "gclid", "msclkid", "ref", "ref_", "source",
];

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TRACKING_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Canonicalize a URL for dedupe. Idempotent.
pub fn canonicalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid url: {}", raw))?;

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !is_tracking_param(k))
        .collect();
    // Stable sort: value order is preserved within a repeated name.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        drop(serializer);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(&path[..path.len() - 1]);
    }

    Ok(url.to_string())
}

/// Host component used to group items from the same shop.
pub fn site_host(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid url: {}", raw))?;
    url.host_str()
        .map(|h| h.to_ascii_lowercase())
        .context("url has no host")
}
