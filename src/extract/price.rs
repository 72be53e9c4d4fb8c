//! Locale-robust price parsing: arbitrary text → integer minor-currency units.
//!
//! Handles both `1,299.95` and `1.299,95` style locales plus space-grouped
//! thousands. All money downstream of this module is integer cents.

use once_cell::sync::Lazy;
use regex::Regex;

/// A parsed price. `raw_number` keeps the pre-rounding value for evidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedPrice {
    pub price_cents: i64,
    pub raw_number: f64,
}

// Grouped-with-separators form first so "1,299.95" is not split at "1".
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\d{1,3}(?:[., ]\d{3})+|\d+)(?:[.,]\d{2})?").expect("number regex")
});

static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[$€£]\s*((?:\d{1,3}(?:[., ]\d{3})+|\d+)(?:[.,]\d{2})?)")
        .expect("currency regex")
});

/// Parse the first numeric token in `text` as a price.
pub fn parse_price(text: &str) -> Option<ParsedPrice> {
    let normalized = normalize_whitespace(text);
    let token = NUMBER_RE.find(&normalized)?.as_str();
    token_to_price(token)
}

/// Parse the first currency-symbol-anchored price in `text`. Used by the
/// body-text scan, where bare numbers would be far too noisy.
pub fn find_currency_price(text: &str) -> Option<ParsedPrice> {
    let normalized = normalize_whitespace(text);
    let caps = CURRENCY_RE.captures(&normalized)?;
    token_to_price(caps.get(1)?.as_str())
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

/// Decide which separator is decimal and normalize the token to `1234.56`.
fn token_to_price(token: &str) -> Option<ParsedPrice> {
    let last_dot = token.rfind('.');
    let last_comma = token.rfind(',');

    let decimal_pos = match (last_dot, last_comma) {
        // Both present: the later one is the decimal separator.
        (Some(d), Some(c)) => Some(d.max(c)),
        // One present: decimal only with exactly two trailing digits.
        (Some(p), None) | (None, Some(p)) => {
            let trailing = token.len() - p - 1;
            (trailing == 2).then_some(p)
        }
        (None, None) => None,
    };

    let mut normalized = String::with_capacity(token.len());
    for (i, c) in token.char_indices() {
        match c {
            '0'..='9' => normalized.push(c),
            '.' | ',' if Some(i) == decimal_pos => normalized.push('.'),
            '.' | ',' | ' ' => {}
            _ => return None,
        }
    }

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    Some(ParsedPrice {
        price_cents: (value * 100.0).round() as i64,
        raw_number: value,
    })
}
