//! Webhook notifications with claim-then-send semantics.
//!
//! The unique `(item, snapshot, event)` row is claimed in the store *before*
//! any network I/O; losing the claim means another run already owns the
//! event and this one aborts silently. A crash between claim and send leaves
//! the row with `sent_at = NULL` for operator triage.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{now_ts, EventType, PriceSnapshot, TrackedItem};
use crate::storage::TrackerStore;

const WEBHOOK_RESPONSE_MAX_CHARS: usize = 1000;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);
const NOT_CONFIGURED_MESSAGE: &str = "DISCORD_WEBHOOK_URL not configured";

pub struct Notifier {
    store: Arc<TrackerStore>,
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(store: Arc<TrackerStore>, webhook_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("Failed to create webhook HTTP client");
        Self {
            store,
            http,
            webhook_url,
        }
    }

    pub async fn notify_price_change(
        &self,
        item: &TrackedItem,
        snapshot: &PriceSnapshot,
        old_price_cents: i64,
        new_price_cents: i64,
    ) -> Result<()> {
        let content = price_change_message(
            &snapshot.product_name,
            old_price_cents,
            new_price_cents,
            &item.url,
            &snapshot.checked_at,
        );
        self.emit(item, snapshot, EventType::PriceChanged, &content)
            .await
    }

    pub async fn notify_back_in_stock(
        &self,
        item: &TrackedItem,
        snapshot: &PriceSnapshot,
    ) -> Result<()> {
        let content = back_in_stock_message(
            &snapshot.product_name,
            snapshot.price_cents,
            &item.url,
            &snapshot.checked_at,
        );
        self.emit(item, snapshot, EventType::BackInStock, &content)
            .await
    }

    async fn emit(
        &self,
        item: &TrackedItem,
        snapshot: &PriceSnapshot,
        event_type: EventType,
        content: &str,
    ) -> Result<()> {
        // Claim first. Losing the race is normal operation, not an error.
        let Some(notification_id) =
            self.store
                .claim_notification(&item.id, &snapshot.id, event_type)?
        else {
            debug!(
                "notification {:?} for item {} snapshot {} already claimed",
                event_type, item.id, snapshot.id
            );
            return Ok(());
        };

        let Some(webhook_url) = self.webhook_url.as_deref() else {
            self.store.record_notification_outcome(
                &notification_id,
                0,
                NOT_CONFIGURED_MESSAGE,
                None,
            )?;
            warn!("webhook not configured; {:?} for {} recorded unsent", event_type, item.id);
            return Ok(());
        };

        let (status, body) = self.post(webhook_url, content).await;
        let truncated: String = body.chars().take(WEBHOOK_RESPONSE_MAX_CHARS).collect();
        let sent_at = now_ts();
        self.store.record_notification_outcome(
            &notification_id,
            status as i64,
            &truncated,
            Some(&sent_at),
        )?;

        info!(
            "sent {:?} webhook for item {} (status {})",
            event_type, item.id, status
        );
        Ok(())
    }

    async fn post(&self, webhook_url: &str, content: &str) -> (u16, String) {
        let payload = serde_json::json!({ "content": content });
        match self.http.post(webhook_url).json(&payload).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                (status, body)
            }
            Err(e) => (0, format!("webhook request failed: {}", e)),
        }
    }

    /// Fire a test message at the configured webhook; used by the API.
    pub async fn send_test(&self) -> Result<(u16, String)> {
        let webhook_url = self
            .webhook_url
            .as_deref()
            .ok_or_else(|| anyhow!(NOT_CONFIGURED_MESSAGE))?;
        let (status, body) = self
            .post(webhook_url, "PriceWatch webhook test: it works.")
            .await;
        let truncated: String = body.chars().take(WEBHOOK_RESPONSE_MAX_CHARS).collect();
        Ok((status, truncated))
    }
}

/// `$1,299.99`: two fraction digits, en-CA style grouping.
pub fn format_money(cents: i64) -> String {
    let negative = cents < 0;
    let cents = cents.unsigned_abs();
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if negative { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, frac)
}

pub fn price_change_message(
    product_name: &str,
    old_price_cents: i64,
    new_price_cents: i64,
    url: &str,
    checked_at: &str,
) -> String {
    format!(
        "**Price Change Detected**\nProduct: {}\nOld Price: {}\nNew Price: {}\nLink: {}\nChecked: {}",
        product_name,
        format_money(old_price_cents),
        format_money(new_price_cents),
        url,
        checked_at,
    )
}

pub fn back_in_stock_message(
    product_name: &str,
    price_cents: Option<i64>,
    url: &str,
    checked_at: &str,
) -> String {
    let price = price_cents
        .map(format_money)
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "**Back In Stock**\nProduct: {}\nPrice: {}\nLink: {}\nChecked: {}",
        product_name, price, url, checked_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_formatting() {
        assert_eq!(format_money(1), "$0.01");
        assert_eq!(format_money(99), "$0.99");
        assert_eq!(format_money(100), "$1.00");
        assert_eq!(format_money(12345), "$123.45");
        assert_eq!(format_money(129999), "$1,299.99");
        assert_eq!(format_money(123456789), "$1,234,567.89");
    }

    #[test]
    fn price_change_format() {
        let msg = price_change_message(
            "Widget Pro",
            12999,
            9999,
            "https://a.com/p",
            "2026-08-01T09:00:00.000000Z",
        );
        assert!(msg.starts_with("**Price Change Detected**\n"));
        assert!(msg.contains("Old Price: $129.99"));
        assert!(msg.contains("New Price: $99.99"));
        assert!(msg.contains("Link: https://a.com/p"));
        assert!(msg.contains("Checked: 2026-08-01T09:00:00.000000Z"));
    }

    #[test]
    fn back_in_stock_format() {
        let msg = back_in_stock_message(
            "Widget",
            Some(14999),
            "https://a.com/p",
            "2026-08-01T09:00:00.000000Z",
        );
        assert!(msg.starts_with("**Back In Stock**\n"));
        assert!(msg.contains("Price: $149.99"));

        let unpriced = back_in_stock_message("Widget", None, "u", "t");
        assert!(unpriced.contains("Price: unknown"));
    }

    #[tokio::test]
    async fn unconfigured_webhook_records_unsent_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            crate::storage::TrackerStore::new(dir.path().join("n.db").to_str().unwrap()).unwrap(),
        );
        let item = store.create_item("u", "u", "h").unwrap();
        let snapshot = crate::models::PriceSnapshot {
            id: "snap-1".into(),
            item_id: item.id.clone(),
            checked_at: now_ts(),
            product_name: "Widget".into(),
            price_cents: Some(1000),
            in_stock: Some(true),
            stock_state: crate::models::StockState::InStock,
            extraction_method: crate::models::ExtractionMethod::Static,
            confidence: 0.9,
            evidence_json: "{}".into(),
            content_hash: "x".into(),
        };
        store.insert_snapshot(&snapshot).unwrap();

        let notifier = Notifier::new(store.clone(), None);
        notifier
            .notify_price_change(&item, &snapshot, 900, 1000)
            .await
            .unwrap();
        // Second emission is a silent no-op.
        notifier
            .notify_price_change(&item, &snapshot, 900, 1000)
            .await
            .unwrap();

        let rows = store.notifications_for_item(&item.id, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].webhook_status, Some(0));
        assert_eq!(rows[0].webhook_response.as_deref(), Some(NOT_CONFIGURED_MESSAGE));
        assert!(rows[0].sent_at.is_none());

        assert!(notifier.send_test().await.is_err());
    }
}
