//! Host-specific JSON adapters, tried before any HTML parsing.
//!
//! Adapters are strictly best-effort: any non-2xx response, redirect, or
//! parse failure is a silent fall-through to the next cascade tier.

pub mod bestbuy;
pub mod shopify;

use std::time::Duration;

pub(crate) const ADAPTER_MIN_TIMEOUT: Duration = Duration::from_millis(2500);

/// Per-probe timeout: adapters must not eat the whole check budget.
pub(crate) fn probe_timeout(total: Duration) -> Duration {
    ADAPTER_MIN_TIMEOUT.max(total / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_timeout_floors_at_2500ms() {
        assert_eq!(
            probe_timeout(Duration::from_millis(1000)),
            Duration::from_millis(2500)
        );
        assert_eq!(
            probe_timeout(Duration::from_millis(20_000)),
            Duration::from_millis(10_000)
        );
    }
}
