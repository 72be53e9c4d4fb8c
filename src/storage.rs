//! SQLite persistence for items, snapshots, check runs and notifications.
//!
//! Single connection behind a mutex, WAL mode, cached statements. Snapshots
//! and check runs are append-only; notifications are claimed with
//! `INSERT OR IGNORE` on a unique key, which is the at-most-once primitive
//! the notifier relies on.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    now_ts, CheckRun, CheckStatus, EventType, ExtractionMethod, NotificationRecord, PriceSnapshot,
    StockState, TrackedItem,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tracked_items (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    canonical_url TEXT NOT NULL,
    site_host TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_items_canonical
    ON tracked_items(canonical_url);

CREATE INDEX IF NOT EXISTS idx_items_active_created
    ON tracked_items(active, created_at);

CREATE TABLE IF NOT EXISTS price_snapshots (
    id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL REFERENCES tracked_items(id),
    checked_at TEXT NOT NULL,
    product_name TEXT NOT NULL,
    price_cents INTEGER,
    in_stock INTEGER,
    stock_state TEXT NOT NULL,
    extraction_method TEXT NOT NULL,
    confidence REAL NOT NULL,
    evidence_json TEXT NOT NULL,
    content_hash TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshots_item_checked
    ON price_snapshots(item_id, checked_at DESC);

CREATE TABLE IF NOT EXISTS check_runs (
    id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL REFERENCES tracked_items(id),
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    used_playwright INTEGER NOT NULL DEFAULT 0,
    used_ai INTEGER NOT NULL DEFAULT 0,
    token_input INTEGER,
    token_output INTEGER,
    estimated_cost_usd REAL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_runs_item_started
    ON check_runs(item_id, started_at DESC);

-- Daily AI budget aggregation scans this.
CREATE INDEX IF NOT EXISTS idx_runs_ai_started
    ON check_runs(started_at) WHERE used_ai = 1;

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    item_id TEXT NOT NULL REFERENCES tracked_items(id),
    snapshot_id TEXT NOT NULL REFERENCES price_snapshots(id),
    event_type TEXT NOT NULL,
    webhook_status INTEGER,
    webhook_response TEXT,
    sent_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(item_id, snapshot_id, event_type)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_notifications_item_created
    ON notifications(item_id, created_at DESC);
"#;

/// Price transition surfaced on the items overview.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChange {
    pub old_price_cents: i64,
    pub new_price_cents: i64,
    pub changed_at: String,
}

pub struct TrackerStore {
    conn: Arc<Mutex<Connection>>,
}

impl TrackerStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let items: i64 = conn
            .query_row("SELECT COUNT(*) FROM tracked_items WHERE active = 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);
        info!("📊 Tracker database ready at {} ({} active items)", db_path, items);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- items -----------------------------------------------------------

    pub fn create_item(&self, url: &str, canonical_url: &str, site_host: &str) -> Result<TrackedItem> {
        let item = TrackedItem {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            canonical_url: canonical_url.to_string(),
            site_host: site_host.to_string(),
            active: true,
            created_at: now_ts(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tracked_items (id, url, canonical_url, site_host, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                item.id,
                item.url,
                item.canonical_url,
                item.site_host,
                item.created_at
            ],
        )?;
        Ok(item)
    }

    /// Any row for the canonical URL, active first. Dedupe and re-activation
    /// both go through this.
    pub fn find_item_by_canonical(&self, canonical_url: &str) -> Result<Option<TrackedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, url, canonical_url, site_host, active, created_at
             FROM tracked_items
             WHERE canonical_url = ?1
             ORDER BY active DESC, created_at ASC
             LIMIT 1",
        )?;
        let mut rows = stmt.query([canonical_url])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_item(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, url, canonical_url, site_host, active, created_at
             FROM tracked_items WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([item_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_item(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_active_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        Ok(self.get_item(item_id)?.filter(|i| i.active))
    }

    /// Flip the soft-delete flag. Also refreshes the as-entered URL on
    /// re-activation so the latest user input wins.
    pub fn set_item_active(&self, item_id: &str, active: bool, url: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        match url {
            Some(url) => {
                conn.execute(
                    "UPDATE tracked_items SET active = ?1, url = ?2 WHERE id = ?3",
                    params![active as i64, url, item_id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE tracked_items SET active = ?1 WHERE id = ?2",
                    params![active as i64, item_id],
                )?;
            }
        }
        Ok(())
    }

    pub fn list_active_items(&self, limit: usize) -> Result<Vec<TrackedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, url, canonical_url, site_host, active, created_at
             FROM tracked_items
             WHERE active = 1
             ORDER BY created_at ASC
             LIMIT ?1",
        )?;
        let items = stmt
            .query_map([limit], Self::row_to_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    pub fn count_active_items(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM tracked_items WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- snapshots -------------------------------------------------------

    pub fn insert_snapshot(&self, snapshot: &PriceSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_snapshots
             (id, item_id, checked_at, product_name, price_cents, in_stock,
              stock_state, extraction_method, confidence, evidence_json, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                snapshot.id,
                snapshot.item_id,
                snapshot.checked_at,
                snapshot.product_name,
                snapshot.price_cents,
                snapshot.in_stock.map(|b| b as i64),
                snapshot.stock_state.as_str(),
                snapshot.extraction_method.as_str(),
                snapshot.confidence,
                snapshot.evidence_json,
                snapshot.content_hash,
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self, item_id: &str) -> Result<Option<PriceSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, item_id, checked_at, product_name, price_cents, in_stock,
                    stock_state, extraction_method, confidence, evidence_json, content_hash
             FROM price_snapshots
             WHERE item_id = ?1
             ORDER BY checked_at DESC, id
             LIMIT 1",
        )?;
        let mut rows = stmt.query([item_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    pub fn snapshots_for_item(&self, item_id: &str, limit: usize) -> Result<Vec<PriceSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, item_id, checked_at, product_name, price_cents, in_stock,
                    stock_state, extraction_method, confidence, evidence_json, content_hash
             FROM price_snapshots
             WHERE item_id = ?1
             ORDER BY checked_at DESC, id
             LIMIT ?2",
        )?;
        let snapshots = stmt
            .query_map(params![item_id, limit], Self::row_to_snapshot)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(snapshots)
    }

    /// Latest snapshots from *other* active items on the same host; used as
    /// extraction hints for the AI tier.
    pub fn recent_snapshots_for_host(
        &self,
        site_host: &str,
        exclude_item_id: &str,
        limit: usize,
    ) -> Result<Vec<PriceSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.item_id, s.checked_at, s.product_name, s.price_cents, s.in_stock,
                    s.stock_state, s.extraction_method, s.confidence, s.evidence_json, s.content_hash
             FROM price_snapshots s
             JOIN tracked_items i ON i.id = s.item_id
             WHERE i.site_host = ?1 AND i.active = 1 AND i.id != ?2
             ORDER BY s.checked_at DESC, s.id
             LIMIT ?3",
        )?;
        let snapshots = stmt
            .query_map(params![site_host, exclude_item_id, limit], Self::row_to_snapshot)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(snapshots)
    }

    /// Most recent adjacent pair of snapshots whose numeric prices differ.
    pub fn last_price_change(&self, item_id: &str) -> Result<Option<PriceChange>> {
        let history = self.snapshots_for_item(item_id, 100)?;
        for pair in history.windows(2) {
            let (newer, older) = (&pair[0], &pair[1]);
            if let (Some(new_price), Some(old_price)) = (newer.price_cents, older.price_cents) {
                if new_price != old_price {
                    return Ok(Some(PriceChange {
                        old_price_cents: old_price,
                        new_price_cents: new_price,
                        changed_at: newer.checked_at.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    // ---- check runs ------------------------------------------------------

    /// Durable sentinel: the run exists as FAILED before any I/O happens.
    pub fn create_check_run(&self, item_id: &str) -> Result<CheckRun> {
        let run = CheckRun {
            id: Uuid::new_v4().to_string(),
            item_id: item_id.to_string(),
            started_at: now_ts(),
            finished_at: None,
            status: CheckStatus::Failed,
            error_code: None,
            error_message: None,
            used_playwright: false,
            used_ai: false,
            token_input: None,
            token_output: None,
            estimated_cost_usd: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO check_runs (id, item_id, started_at, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![run.id, run.item_id, run.started_at, run.status.as_str()],
        )?;
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize_check_run(
        &self,
        run_id: &str,
        status: CheckStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        used_playwright: bool,
        used_ai: bool,
        token_input: Option<i64>,
        token_output: Option<i64>,
        estimated_cost_usd: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE check_runs SET
                finished_at = ?1,
                status = ?2,
                error_code = ?3,
                error_message = ?4,
                used_playwright = ?5,
                used_ai = ?6,
                token_input = ?7,
                token_output = ?8,
                estimated_cost_usd = ?9
             WHERE id = ?10",
            params![
                now_ts(),
                status.as_str(),
                error_code,
                error_message,
                used_playwright as i64,
                used_ai as i64,
                token_input,
                token_output,
                estimated_cost_usd,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn runs_for_item(&self, item_id: &str, limit: usize) -> Result<Vec<CheckRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, item_id, started_at, finished_at, status, error_code, error_message,
                    used_playwright, used_ai, token_input, token_output, estimated_cost_usd
             FROM check_runs
             WHERE item_id = ?1
             ORDER BY started_at DESC, id
             LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![item_id, limit], Self::row_to_run)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(runs)
    }

    pub fn latest_run(&self, item_id: &str) -> Result<Option<CheckRun>> {
        Ok(self.runs_for_item(item_id, 1)?.into_iter().next())
    }

    /// Aggregate AI spend since `since_ts` (inclusive). Read-time budget
    /// bookkeeping: stateless and crash-safe.
    pub fn ai_cost_since(&self, since_ts: &str) -> Result<f64> {
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(estimated_cost_usd), 0.0)
             FROM check_runs
             WHERE used_ai = 1 AND started_at >= ?1",
            [since_ts],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ---- notifications ---------------------------------------------------

    /// Claim an emission slot. Returns the new row id, or None when the
    /// unique key already exists (someone else claimed it).
    pub fn claim_notification(
        &self,
        item_id: &str,
        snapshot_id: &str,
        event_type: EventType,
    ) -> Result<Option<String>> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO notifications (id, item_id, snapshot_id, event_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, item_id, snapshot_id, event_type.as_str(), now_ts()],
        )?;
        Ok((changed > 0).then_some(id))
    }

    pub fn record_notification_outcome(
        &self,
        notification_id: &str,
        webhook_status: i64,
        webhook_response: &str,
        sent_at: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE notifications SET webhook_status = ?1, webhook_response = ?2, sent_at = ?3
             WHERE id = ?4",
            params![webhook_status, webhook_response, sent_at, notification_id],
        )?;
        Ok(())
    }

    pub fn notifications_for_item(
        &self,
        item_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, item_id, snapshot_id, event_type, webhook_status, webhook_response,
                    sent_at, created_at
             FROM notifications
             WHERE item_id = ?1
             ORDER BY created_at DESC, id
             LIMIT ?2",
        )?;
        let notifications = stmt
            .query_map(params![item_id, limit], Self::row_to_notification)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(notifications)
    }

    // ---- row converters --------------------------------------------------

    fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<TrackedItem> {
        Ok(TrackedItem {
            id: row.get(0)?,
            url: row.get(1)?,
            canonical_url: row.get(2)?,
            site_host: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            created_at: row.get(5)?,
        })
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<PriceSnapshot> {
        let stock_state: String = row.get(6)?;
        let method: String = row.get(7)?;
        Ok(PriceSnapshot {
            id: row.get(0)?,
            item_id: row.get(1)?,
            checked_at: row.get(2)?,
            product_name: row.get(3)?,
            price_cents: row.get(4)?,
            in_stock: row.get::<_, Option<i64>>(5)?.map(|v| v != 0),
            stock_state: StockState::parse(&stock_state),
            extraction_method: ExtractionMethod::parse(&method),
            confidence: row.get(8)?,
            evidence_json: row.get(9)?,
            content_hash: row.get(10)?,
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<CheckRun> {
        let status: String = row.get(4)?;
        Ok(CheckRun {
            id: row.get(0)?,
            item_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            status: CheckStatus::parse(&status),
            error_code: row.get(5)?,
            error_message: row.get(6)?,
            used_playwright: row.get::<_, i64>(7)? != 0,
            used_ai: row.get::<_, i64>(8)? != 0,
            token_input: row.get(9)?,
            token_output: row.get(10)?,
            estimated_cost_usd: row.get(11)?,
        })
    }

    fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<NotificationRecord> {
        let event: String = row.get(3)?;
        Ok(NotificationRecord {
            id: row.get(0)?,
            item_id: row.get(1)?,
            snapshot_id: row.get(2)?,
            event_type: EventType::parse(&event).unwrap_or(EventType::PriceChanged),
            webhook_status: row.get(4)?,
            webhook_response: row.get(5)?,
            sent_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}
