//! Durable charge ledger backed by SQLite.
//!
//! All SQL lives here: callers go through `Ledger` methods and never execute
//! statements themselves. One merge batch per (period, source) pair runs in a
//! single transaction; a dry run performs every write and rolls the
//! transaction back at the commit boundary.

use crate::error::{ChargebackError, Result};
use crate::normalize::NormalizedCharge;
use crate::utils::{is_period_key, money_eq, round_half_even};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS billing_periods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_key TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed', 'finalized')),
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    closed_by TEXT,
    finalized_at TEXT,
    finalized_by TEXT,
    reopened_at TEXT,
    reopened_by TEXT,
    reopen_reason TEXT,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source_type TEXT NOT NULL DEFAULT 'file' CHECK (source_type IN ('file', 'api')),
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_sync_at TEXT,
    last_sync_status TEXT,
    last_sync_message TEXT
);

CREATE TABLE IF NOT EXISTS charges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    billing_period_id INTEGER NOT NULL REFERENCES billing_periods(id),
    source_id INTEGER NOT NULL REFERENCES sources(id),
    charge_period_start TEXT,
    charge_period_end TEXT,
    list_cost REAL,
    contracted_cost REAL,
    billed_cost REAL NOT NULL DEFAULT 0,
    effective_cost REAL,
    resource_id TEXT,
    resource_name TEXT,
    service_name TEXT,
    pi_email TEXT NOT NULL,
    project_id TEXT,
    fund_org TEXT,
    reference_1 TEXT,
    reference_2 TEXT,
    raw_tags TEXT,
    needs_review INTEGER NOT NULL DEFAULT 0,
    review_reason TEXT,
    reviewed_at TEXT,
    reviewed_by TEXT,
    imported_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_charges_natural_key
    ON charges (billing_period_id, source_id, IFNULL(resource_id, ''), IFNULL(charge_period_start, ''));

CREATE INDEX IF NOT EXISTS idx_charges_review
    ON charges (billing_period_id, needs_review);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    billing_period_id INTEGER NOT NULL REFERENCES billing_periods(id),
    row_count INTEGER NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    flagged_rows INTEGER NOT NULL DEFAULT 0,
    flagged_cost REAL NOT NULL DEFAULT 0,
    imported_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Open,
    Closed,
    Finalized,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Open => "open",
            PeriodStatus::Closed => "closed",
            PeriodStatus::Finalized => "finalized",
        }
    }
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ToSql for PeriodStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for PeriodStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "open" => Ok(PeriodStatus::Open),
            "closed" => Ok(PeriodStatus::Closed),
            "finalized" => Ok(PeriodStatus::Finalized),
            other => Err(FromSqlError::Other(
                format!("unknown period status '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Api,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Api => "api",
        }
    }
}

impl ToSql for SourceType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SourceType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "file" => Ok(SourceType::File),
            "api" => Ok(SourceType::Api),
            other => Err(FromSqlError::Other(
                format!("unknown source type '{}'", other).into(),
            )),
        }
    }
}

/// A monthly accounting window. Status only moves forward
/// (open → closed → finalized) except for the single closed → open reopen
/// escape hatch, which requires a reason and is refused once finalized.
#[derive(Debug, Clone, Serialize)]
pub struct BillingPeriod {
    pub id: i64,
    pub period_key: String,
    pub status: PeriodStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<String>,
    pub reopened_at: Option<DateTime<Utc>>,
    pub reopened_by: Option<String>,
    pub reopen_reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub source_type: SourceType,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub last_sync_message: Option<String>,
}

/// A persisted charge row.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerCharge {
    pub id: i64,
    pub period_id: i64,
    pub source_id: i64,
    pub charge_period_start: Option<String>,
    pub charge_period_end: Option<String>,
    pub list_cost: Option<f64>,
    pub contracted_cost: Option<f64>,
    pub billed_cost: f64,
    pub effective_cost: Option<f64>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub service_name: Option<String>,
    pub pi_email: String,
    pub project_id: Option<String>,
    pub fund_org: Option<String>,
    pub reference_1: Option<String>,
    pub reference_2: Option<String>,
    /// JSON text of the decoded tag map, `None` when the row had no tags.
    pub raw_tags: Option<String>,
    pub needs_review: bool,
    pub review_reason: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub imported_at: DateTime<Utc>,
}

impl LedgerCharge {
    /// Decodes the stored tag map; absent or undecodable tags yield an
    /// empty map.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.raw_tags
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRecord {
    pub id: i64,
    pub filename: String,
    pub source_id: i64,
    pub period_id: i64,
    pub row_count: i64,
    pub total_cost: f64,
    pub flagged_rows: i64,
    pub flagged_cost: f64,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PeriodStats {
    pub charge_count: i64,
    pub total_cost: f64,
    pub pi_count: i64,
    pub project_count: i64,
    pub flagged_count: i64,
    pub flagged_cost: f64,
}

/// Three-way classification of one upserted charge. Classification is a
/// reporting concern only: the write is performed in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated(Vec<&'static str>),
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

const PERIOD_COLUMNS: &str = "id, period_key, status, opened_at, closed_at, closed_by, \
     finalized_at, finalized_by, reopened_at, reopened_by, reopen_reason, notes";

const SOURCE_COLUMNS: &str =
    "id, name, source_type, enabled, created_at, last_sync_at, last_sync_status, last_sync_message";

const CHARGE_COLUMNS: &str = "id, billing_period_id, source_id, charge_period_start, \
     charge_period_end, list_cost, contracted_cost, billed_cost, effective_cost, resource_id, \
     resource_name, service_name, pi_email, project_id, fund_org, reference_1, reference_2, \
     raw_tags, needs_review, review_reason, reviewed_at, reviewed_by, imported_at";

const IMPORT_COLUMNS: &str = "id, filename, source_id, billing_period_id, row_count, \
     total_cost, flagged_rows, flagged_cost, imported_at";

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Opens (or creates) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Opens an in-memory ledger (used in tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Applies the embedded schema. Safe to call on every open.
    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ── Billing periods ────────────────────────────────────────

    pub fn get_or_create_period(&self, period_key: &str) -> Result<BillingPeriod> {
        get_or_create_period_impl(&self.conn, period_key, Utc::now())
    }

    pub fn get_period(&self, period_id: i64) -> Result<Option<BillingPeriod>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM billing_periods WHERE id = ?1",
                    PERIOD_COLUMNS
                ),
                params![period_id],
                period_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_period_by_key(&self, period_key: &str) -> Result<Option<BillingPeriod>> {
        period_by_key(&self.conn, period_key)
    }

    /// All periods, most recent first.
    pub fn list_periods(&self) -> Result<Vec<BillingPeriod>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM billing_periods ORDER BY period_key DESC",
            PERIOD_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], period_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn close_period(&self, period_id: i64, actor: &str) -> Result<BillingPeriod> {
        let period = self.require_period(period_id)?;
        if period.status != PeriodStatus::Open {
            return Err(invalid_transition(&period, PeriodStatus::Closed));
        }
        self.conn.execute(
            "UPDATE billing_periods SET status = 'closed', closed_at = ?1, closed_by = ?2 \
             WHERE id = ?3",
            params![Utc::now(), actor, period_id],
        )?;
        info!("Closed billing period {}", period.period_key);
        self.require_period(period_id)
    }

    pub fn finalize_period(&self, period_id: i64, actor: &str) -> Result<BillingPeriod> {
        let period = self.require_period(period_id)?;
        if period.status != PeriodStatus::Closed {
            return Err(invalid_transition(&period, PeriodStatus::Finalized));
        }
        self.conn.execute(
            "UPDATE billing_periods SET status = 'finalized', finalized_at = ?1, finalized_by = ?2 \
             WHERE id = ?3",
            params![Utc::now(), actor, period_id],
        )?;
        info!("Finalized billing period {}", period.period_key);
        self.require_period(period_id)
    }

    /// Reopens a closed period. The reason is mandatory, and finalized
    /// periods cannot be reopened.
    pub fn reopen_period(&self, period_id: i64, actor: &str, reason: &str) -> Result<BillingPeriod> {
        let period = self.require_period(period_id)?;
        if reason.trim().is_empty() {
            return Err(ChargebackError::ReopenReasonRequired(period.period_key));
        }
        if period.status != PeriodStatus::Closed {
            return Err(invalid_transition(&period, PeriodStatus::Open));
        }
        self.conn.execute(
            "UPDATE billing_periods SET status = 'open', reopened_at = ?1, reopened_by = ?2, \
             reopen_reason = ?3 WHERE id = ?4",
            params![Utc::now(), actor, reason, period_id],
        )?;
        info!("Reopened billing period {}: {}", period.period_key, reason);
        self.require_period(period_id)
    }

    pub fn update_period_notes(&self, period_id: i64, notes: &str) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE billing_periods SET notes = ?1 WHERE id = ?2",
            params![notes, period_id],
        )?;
        if affected == 0 {
            return Err(ChargebackError::PeriodNotFound(period_id));
        }
        Ok(())
    }

    fn require_period(&self, period_id: i64) -> Result<BillingPeriod> {
        self.get_period(period_id)?
            .ok_or(ChargebackError::PeriodNotFound(period_id))
    }

    // ── Sources ────────────────────────────────────────────────

    pub fn get_or_create_source(&self, name: &str, source_type: SourceType) -> Result<Source> {
        get_or_create_source_impl(&self.conn, name, source_type, Utc::now())
    }

    pub fn get_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        source_by_name(&self.conn, name)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sources ORDER BY name",
            SOURCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], source_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE sources SET enabled = ?1 WHERE name = ?2",
            params![enabled, name],
        )?;
        if affected == 0 {
            return Err(ChargebackError::SourceNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn update_source_sync(&self, name: &str, status: &str, message: Option<&str>) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE sources SET last_sync_at = ?1, last_sync_status = ?2, last_sync_message = ?3 \
             WHERE name = ?4",
            params![Utc::now(), status, message, name],
        )?;
        if affected == 0 {
            return Err(ChargebackError::SourceNotFound(name.to_string()));
        }
        Ok(())
    }

    // ── Charges ────────────────────────────────────────────────

    /// Merges one batch of normalized charges, all belonging to the given
    /// period, as a single atomic unit: the upserts and the import record
    /// either all land or none do. The period and the source are created on
    /// first use (file sources; API collaborators pre-register theirs via
    /// `get_or_create_source`). A dry run executes every write and rolls
    /// back at the commit boundary.
    ///
    /// Merging into a closed or finalized period is refused.
    pub fn merge_charges(
        &mut self,
        period_key: &str,
        source_name: &str,
        charges: &[NormalizedCharge],
        filename: &str,
        dry_run: bool,
    ) -> Result<MergeStats> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;

        let source = get_or_create_source_impl(&tx, source_name, SourceType::File, now)?;
        let period = get_or_create_period_impl(&tx, period_key, now)?;
        if period.status != PeriodStatus::Open {
            return Err(ChargebackError::PeriodNotOpen {
                period: period.period_key,
                status: period.status.to_string(),
            });
        }

        let mut stats = MergeStats::default();
        let mut total_cost = 0.0;
        let mut flagged_rows: i64 = 0;
        let mut flagged_cost = 0.0;

        for charge in charges {
            match upsert_charge(&tx, period.id, source.id, charge, now)? {
                MergeOutcome::Inserted => stats.inserted += 1,
                MergeOutcome::Updated(fields) => {
                    debug!(
                        "Charge ({:?}, {:?}) updated: {:?}",
                        charge.resource_id, charge.charge_period_start, fields
                    );
                    stats.updated += 1;
                }
                MergeOutcome::Unchanged => stats.skipped += 1,
            }
            total_cost += charge.billed_cost;
            if charge.needs_review {
                flagged_rows += 1;
                flagged_cost += charge.billed_cost;
            }
        }

        insert_import(
            &tx,
            period.id,
            source.id,
            filename,
            charges.len() as i64,
            total_cost,
            flagged_rows,
            flagged_cost,
            now,
        )?;

        if dry_run {
            tx.rollback()?;
            info!(
                "Dry run: discarded merge of {} charges into period {}",
                charges.len(),
                period_key
            );
        } else {
            tx.commit()?;
            info!(
                "Merged {} charges into period {}: {} inserted, {} updated, {} skipped",
                charges.len(),
                period_key,
                stats.inserted,
                stats.updated,
                stats.skipped
            );
        }

        Ok(stats)
    }

    /// Charges for a period, optionally filtered by review flag.
    pub fn charges_for_period(
        &self,
        period_id: i64,
        needs_review: Option<bool>,
    ) -> Result<Vec<LedgerCharge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM charges WHERE billing_period_id = ?1 \
             AND (?2 IS NULL OR needs_review = ?2) ORDER BY id",
            CHARGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![period_id, needs_review], charge_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Flagged charges, across all periods or one.
    pub fn flagged_charges(&self, period_id: Option<i64>) -> Result<Vec<LedgerCharge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM charges WHERE needs_review = 1 \
             AND (?1 IS NULL OR billing_period_id = ?1) ORDER BY id",
            CHARGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![period_id], charge_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Approves a flagged charge: the review flag and its reason are cleared
    /// together, and the reviewer is recorded.
    pub fn approve_charge(&self, charge_id: i64, reviewer: &str) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE charges SET needs_review = 0, review_reason = NULL, reviewed_at = ?1, \
             reviewed_by = ?2 WHERE id = ?3",
            params![Utc::now(), reviewer, charge_id],
        )?;
        if affected == 0 {
            return Err(ChargebackError::ChargeNotFound(charge_id));
        }
        Ok(())
    }

    /// Approves every flagged charge in a period; returns how many were
    /// cleared.
    pub fn approve_all_for_period(&self, period_id: i64, reviewer: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE charges SET needs_review = 0, review_reason = NULL, reviewed_at = ?1, \
             reviewed_by = ?2 WHERE billing_period_id = ?3 AND needs_review = 1",
            params![Utc::now(), reviewer, period_id],
        )?;
        info!("Approved {} flagged charges in period id {}", affected, period_id);
        Ok(affected)
    }

    /// Rejects a charge by deleting its ledger row.
    pub fn reject_charge(&self, charge_id: i64) -> Result<()> {
        let affected = self
            .conn
            .execute("DELETE FROM charges WHERE id = ?1", params![charge_id])?;
        if affected == 0 {
            return Err(ChargebackError::ChargeNotFound(charge_id));
        }
        Ok(())
    }

    // ── Imports & statistics ───────────────────────────────────

    pub fn imports_for_period(&self, period_id: i64) -> Result<Vec<ImportRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM imports WHERE billing_period_id = ?1 ORDER BY id",
            IMPORT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![period_id], import_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn period_stats(&self, period_id: i64) -> Result<PeriodStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(id), COALESCE(SUM(billed_cost), 0), COUNT(DISTINCT pi_email), \
             COUNT(DISTINCT project_id), \
             COALESCE(SUM(CASE WHEN needs_review THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN needs_review THEN billed_cost ELSE 0 END), 0) \
             FROM charges WHERE billing_period_id = ?1",
            params![period_id],
            |row| {
                Ok(PeriodStats {
                    charge_count: row.get(0)?,
                    total_cost: row.get(1)?,
                    pi_count: row.get(2)?,
                    project_count: row.get(3)?,
                    flagged_count: row.get(4)?,
                    flagged_cost: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }
}

fn invalid_transition(period: &BillingPeriod, to: PeriodStatus) -> ChargebackError {
    ChargebackError::InvalidPeriodTransition {
        period: period.period_key.clone(),
        from: period.status.to_string(),
        to: to.to_string(),
    }
}

fn period_from_row(row: &Row<'_>) -> rusqlite::Result<BillingPeriod> {
    Ok(BillingPeriod {
        id: row.get(0)?,
        period_key: row.get(1)?,
        status: row.get(2)?,
        opened_at: row.get(3)?,
        closed_at: row.get(4)?,
        closed_by: row.get(5)?,
        finalized_at: row.get(6)?,
        finalized_by: row.get(7)?,
        reopened_at: row.get(8)?,
        reopened_by: row.get(9)?,
        reopen_reason: row.get(10)?,
        notes: row.get(11)?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        source_type: row.get(2)?,
        enabled: row.get(3)?,
        created_at: row.get(4)?,
        last_sync_at: row.get(5)?,
        last_sync_status: row.get(6)?,
        last_sync_message: row.get(7)?,
    })
}

fn charge_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerCharge> {
    Ok(LedgerCharge {
        id: row.get(0)?,
        period_id: row.get(1)?,
        source_id: row.get(2)?,
        charge_period_start: row.get(3)?,
        charge_period_end: row.get(4)?,
        list_cost: row.get(5)?,
        contracted_cost: row.get(6)?,
        billed_cost: row.get(7)?,
        effective_cost: row.get(8)?,
        resource_id: row.get(9)?,
        resource_name: row.get(10)?,
        service_name: row.get(11)?,
        pi_email: row.get(12)?,
        project_id: row.get(13)?,
        fund_org: row.get(14)?,
        reference_1: row.get(15)?,
        reference_2: row.get(16)?,
        raw_tags: row.get(17)?,
        needs_review: row.get(18)?,
        review_reason: row.get(19)?,
        reviewed_at: row.get(20)?,
        reviewed_by: row.get(21)?,
        imported_at: row.get(22)?,
    })
}

fn import_from_row(row: &Row<'_>) -> rusqlite::Result<ImportRecord> {
    Ok(ImportRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        source_id: row.get(2)?,
        period_id: row.get(3)?,
        row_count: row.get(4)?,
        total_cost: row.get(5)?,
        flagged_rows: row.get(6)?,
        flagged_cost: row.get(7)?,
        imported_at: row.get(8)?,
    })
}

fn period_by_key(conn: &Connection, period_key: &str) -> Result<Option<BillingPeriod>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM billing_periods WHERE period_key = ?1",
                PERIOD_COLUMNS
            ),
            params![period_key],
            period_from_row,
        )
        .optional()?;
    Ok(row)
}

fn source_by_name(conn: &Connection, name: &str) -> Result<Option<Source>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM sources WHERE name = ?1", SOURCE_COLUMNS),
            params![name],
            source_from_row,
        )
        .optional()?;
    Ok(row)
}

fn get_or_create_period_impl(
    conn: &Connection,
    period_key: &str,
    now: DateTime<Utc>,
) -> Result<BillingPeriod> {
    if !is_period_key(period_key) {
        return Err(ChargebackError::InvalidPeriodKey(period_key.to_string()));
    }
    if let Some(period) = period_by_key(conn, period_key)? {
        return Ok(period);
    }
    conn.execute(
        "INSERT INTO billing_periods (period_key, status, opened_at) VALUES (?1, 'open', ?2)",
        params![period_key, now],
    )?;
    debug!("Created billing period {}", period_key);
    period_by_key(conn, period_key)?
        .ok_or_else(|| ChargebackError::UnknownPeriodKey(period_key.to_string()))
}

fn get_or_create_source_impl(
    conn: &Connection,
    name: &str,
    source_type: SourceType,
    now: DateTime<Utc>,
) -> Result<Source> {
    if let Some(source) = source_by_name(conn, name)? {
        return Ok(source);
    }
    conn.execute(
        "INSERT INTO sources (name, source_type, created_at) VALUES (?1, ?2, ?3)",
        params![name, source_type, now],
    )?;
    debug!("Registered source '{}'", name);
    source_by_name(conn, name)?.ok_or_else(|| ChargebackError::SourceNotFound(name.to_string()))
}

/// Incoming values in their persisted form: costs rounded to cents,
/// tags serialized.
struct IncomingCharge {
    list_cost: Option<f64>,
    contracted_cost: Option<f64>,
    billed_cost: f64,
    effective_cost: Option<f64>,
    raw_tags: Option<String>,
}

impl IncomingCharge {
    fn build(charge: &NormalizedCharge) -> Result<Self> {
        let raw_tags = if charge.raw_tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&charge.raw_tags)?)
        };
        Ok(Self {
            list_cost: charge.list_cost.map(|v| round_half_even(v, 2)),
            contracted_cost: charge.contracted_cost.map(|v| round_half_even(v, 2)),
            billed_cost: round_half_even(charge.billed_cost, 2),
            effective_cost: charge.effective_cost.map(|v| round_half_even(v, 2)),
            raw_tags,
        })
    }
}

/// The mutable columns considered when classifying an upsert as updated or
/// unchanged. `charge_period_start` is part of the natural key and
/// `charge_period_end` is write-once alongside it.
fn diff_charge(
    existing: &LedgerCharge,
    charge: &NormalizedCharge,
    incoming: &IncomingCharge,
) -> Vec<&'static str> {
    let mut changed = Vec::new();

    if !money_eq(existing.list_cost, incoming.list_cost) {
        changed.push("list_cost");
    }
    if !money_eq(existing.contracted_cost, incoming.contracted_cost) {
        changed.push("contracted_cost");
    }
    if !money_eq(Some(existing.billed_cost), Some(incoming.billed_cost)) {
        changed.push("billed_cost");
    }
    if !money_eq(existing.effective_cost, incoming.effective_cost) {
        changed.push("effective_cost");
    }
    if existing.resource_name != charge.resource_name {
        changed.push("resource_name");
    }
    if existing.service_name != charge.service_name {
        changed.push("service_name");
    }
    if existing.pi_email != charge.pi_email {
        changed.push("pi_email");
    }
    if existing.project_id != charge.project_id {
        changed.push("project_id");
    }
    if existing.fund_org != charge.fund_org {
        changed.push("fund_org");
    }
    if existing.reference_1 != charge.reference_1 {
        changed.push("reference_1");
    }
    if existing.reference_2 != charge.reference_2 {
        changed.push("reference_2");
    }
    if existing.raw_tags != incoming.raw_tags {
        changed.push("raw_tags");
    }
    if existing.needs_review != charge.needs_review {
        changed.push("needs_review");
    }
    if existing.review_reason != charge.review_reason {
        changed.push("review_reason");
    }

    changed
}

fn upsert_charge(
    conn: &Connection,
    period_id: i64,
    source_id: i64,
    charge: &NormalizedCharge,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let incoming = IncomingCharge::build(charge)?;

    // The null-safe IS comparison keeps rows with no resource id or charge
    // start matched to themselves rather than always inserting.
    let existing = conn
        .query_row(
            &format!(
                "SELECT {} FROM charges WHERE billing_period_id = ?1 AND source_id = ?2 \
                 AND resource_id IS ?3 AND charge_period_start IS ?4",
                CHARGE_COLUMNS
            ),
            params![
                period_id,
                source_id,
                charge.resource_id,
                charge.charge_period_start
            ],
            charge_from_row,
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO charges (billing_period_id, source_id, charge_period_start, \
                 charge_period_end, list_cost, contracted_cost, billed_cost, effective_cost, \
                 resource_id, resource_name, service_name, pi_email, project_id, fund_org, \
                 reference_1, reference_2, raw_tags, needs_review, review_reason, imported_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20)",
                params![
                    period_id,
                    source_id,
                    charge.charge_period_start,
                    charge.charge_period_end,
                    incoming.list_cost,
                    incoming.contracted_cost,
                    incoming.billed_cost,
                    incoming.effective_cost,
                    charge.resource_id,
                    charge.resource_name,
                    charge.service_name,
                    charge.pi_email,
                    charge.project_id,
                    charge.fund_org,
                    charge.reference_1,
                    charge.reference_2,
                    incoming.raw_tags,
                    charge.needs_review,
                    charge.review_reason,
                    now,
                ],
            )?;
            Ok(MergeOutcome::Inserted)
        }
        Some(existing) => {
            let changed = diff_charge(&existing, charge, &incoming);
            // The write happens regardless of classification; the merge is
            // idempotent either way.
            conn.execute(
                "UPDATE charges SET list_cost = ?1, contracted_cost = ?2, billed_cost = ?3, \
                 effective_cost = ?4, resource_name = ?5, service_name = ?6, pi_email = ?7, \
                 project_id = ?8, fund_org = ?9, reference_1 = ?10, reference_2 = ?11, \
                 raw_tags = ?12, needs_review = ?13, review_reason = ?14 WHERE id = ?15",
                params![
                    incoming.list_cost,
                    incoming.contracted_cost,
                    incoming.billed_cost,
                    incoming.effective_cost,
                    charge.resource_name,
                    charge.service_name,
                    charge.pi_email,
                    charge.project_id,
                    charge.fund_org,
                    charge.reference_1,
                    charge.reference_2,
                    incoming.raw_tags,
                    charge.needs_review,
                    charge.review_reason,
                    existing.id,
                ],
            )?;
            if changed.is_empty() {
                Ok(MergeOutcome::Unchanged)
            } else {
                Ok(MergeOutcome::Updated(changed))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_import(
    conn: &Connection,
    period_id: i64,
    source_id: i64,
    filename: &str,
    row_count: i64,
    total_cost: f64,
    flagged_rows: i64,
    flagged_cost: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO imports (filename, source_id, billing_period_id, row_count, total_cost, \
         flagged_rows, flagged_cost, imported_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            filename,
            source_id,
            period_id,
            row_count,
            round_half_even(total_cost, 2),
            flagged_rows,
            round_half_even(flagged_cost, 2),
            now,
        ],
    )?;
    Ok(())
}
