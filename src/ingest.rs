//! FOCUS CSV ingest: normalize, flag, allocate subsidies and merge, one file
//! at a time.
//!
//! Row failures never abort the file: each bad row is reported with its line
//! number and the rest of the batch continues. Rows are grouped by derived
//! period key and each group merges as its own atomic batch.

use crate::config::ChargebackConfig;
use crate::error::Result;
use crate::ledger::{Ledger, SourceType};
use crate::normalize::{map_headers, normalize_row, raw_record, NormalizedCharge};
use crate::review::RuleSet;
use crate::subsidy::{Allocation, SubsidyLedger};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Knobs for one ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Run the full pipeline, including subsidy computation, but discard
    /// every write at the commit boundary.
    pub dry_run: bool,
    /// When set, rows whose derived period key differs are flagged for
    /// review rather than imported silently.
    pub expected_period: Option<String>,
}

/// Per-period slice of an ingest run.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodOutcome {
    pub period_key: String,
    pub rows: usize,
    pub total_cost: f64,
    pub flagged_rows: usize,
    pub flagged_cost: f64,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Everything a caller needs to surface after one file: merge counts, costs,
/// flagged totals, row errors and the subsidy splits that were applied.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub periods: Vec<PeriodOutcome>,
    pub total_rows: usize,
    pub total_cost: f64,
    pub flagged_rows: usize,
    pub flagged_cost: f64,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Row-fatal errors, each prefixed with the 1-based CSV line number.
    pub errors: Vec<String>,
    /// Charges a subsidy rule matched, in input order.
    pub allocations: Vec<Allocation>,
}

/// Ingests one FOCUS-format CSV file into the ledger.
///
/// The subsidy state is mutated in place; the caller decides whether to
/// persist it afterwards. On a dry run every ledger write is rolled back at
/// the commit boundary and the source sync status is left untouched.
pub fn ingest_focus_csv(
    ledger: &mut Ledger,
    config: &ChargebackConfig,
    subsidy_state: &mut SubsidyLedger,
    path: &Path,
    source_name: &str,
    options: &IngestOptions,
) -> Result<IngestReport> {
    info!("Ingesting {} as source '{}'", path.display(), source_name);

    let rules = RuleSet::compile(&config.review);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let columns = map_headers(&headers);

    let mut report = IngestReport::default();
    let mut batches: BTreeMap<String, Vec<NormalizedCharge>> = BTreeMap::new();

    for (idx, record) in reader.records().enumerate() {
        // Line 1 is the header row.
        let line = idx + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                report.errors.push(format!("Line {}: {}", line, err));
                continue;
            }
        };

        let raw = raw_record(&columns, &record);
        let mut charge = match normalize_row(&raw, &config.tags) {
            Ok(charge) => charge,
            Err(err) => {
                report.errors.push(format!("Line {}: {}", line, err));
                continue;
            }
        };

        rules.apply(&mut charge, options.expected_period.as_deref());

        report.total_rows += 1;
        report.total_cost += charge.billed_cost;
        if charge.needs_review {
            report.flagged_rows += 1;
            report.flagged_cost += charge.billed_cost;
        }

        batches
            .entry(charge.period_key.clone())
            .or_default()
            .push(charge);
    }

    if !report.errors.is_empty() {
        warn!(
            "{} rows in {} were skipped as unusable",
            report.errors.len(),
            path.display()
        );
    }

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    for (period_key, charges) in &batches {
        let mut outcome = PeriodOutcome {
            period_key: period_key.clone(),
            rows: charges.len(),
            total_cost: 0.0,
            flagged_rows: 0,
            flagged_cost: 0.0,
            inserted: 0,
            updated: 0,
            skipped: 0,
        };

        for charge in charges {
            outcome.total_cost += charge.billed_cost;
            if charge.needs_review {
                outcome.flagged_rows += 1;
                outcome.flagged_cost += charge.billed_cost;
            }
            if let Some(date) = charge.charge_date() {
                let allocation = subsidy_state.allocate(
                    &config.subsidies,
                    charge.project_id.as_deref(),
                    charge.service_name.as_deref(),
                    date,
                    charge.billed_cost,
                );
                if allocation.rule.is_some() {
                    report.allocations.push(allocation);
                }
            }
        }

        let stats =
            ledger.merge_charges(period_key, source_name, charges, &filename, options.dry_run)?;
        outcome.inserted = stats.inserted;
        outcome.updated = stats.updated;
        outcome.skipped = stats.skipped;

        report.inserted += stats.inserted;
        report.updated += stats.updated;
        report.skipped += stats.skipped;
        report.periods.push(outcome);
    }

    if !options.dry_run {
        // The source row exists even when every row failed, so the sync
        // status always has somewhere to land.
        ledger.get_or_create_source(source_name, SourceType::File)?;
        if report.errors.is_empty() {
            ledger.update_source_sync(source_name, "success", None)?;
        } else {
            let message = format!("{} errors", report.errors.len());
            ledger.update_source_sync(source_name, "error", Some(&message))?;
        }
    }

    info!(
        "Ingest of {} complete: {} rows across {} periods ({} inserted, {} updated, {} skipped, {} errors)",
        filename,
        report.total_rows,
        report.periods.len(),
        report.inserted,
        report.updated,
        report.skipped,
        report.errors.len()
    );

    Ok(report)
}
