//! # Cloud Chargeback
//!
//! A library for turning FOCUS-format cloud billing exports into a reviewed,
//! deduplicated chargeback ledger with per-PI cost rollups and capped
//! subsidy tracking.
//!
//! ## Core Concepts
//!
//! - **Normalization**: FOCUS CSV columns (matched case-insensitively) plus a serialized tag map become `NormalizedCharge` rows keyed by a `YYYY-MM` billing period
//! - **Review Flags**: configurable regex rules mark suspect rows `needs_review` with a single machine-readable reason; flagged rows are kept for human review, never dropped
//! - **Idempotent Merge**: charges upsert by natural key (period, source, resource, charge start) inside one transaction per batch, so re-imports converge instead of duplicating
//! - **Rollups**: ledger charges aggregate person → project → service with list-vs-billed discount math
//! - **Capped Subsidies**: the first matching rule splits each charge into subsidized and billable portions against persisted per-project, per-fiscal-year running totals
//!
//! ## Example
//!
//! ```rust,ignore
//! use cloud_chargeback::*;
//! use std::path::Path;
//!
//! let config = ChargebackConfig::from_file(Path::new("chargeback.json"))?;
//! let mut processor = ChargebackProcessor::open(
//!     Path::new("ledger.db"),
//!     Path::new("subsidy_state.json"),
//!     config,
//! )?;
//!
//! let report = processor.ingest_file(
//!     Path::new("aws_2025-01.csv"),
//!     "aws-focus",
//!     &IngestOptions::default(),
//! )?;
//! println!("{} inserted, {} flagged", report.inserted, report.flagged_rows);
//!
//! let rollup = processor.rollup_for_period("2025-01", false)?;
//! for (pi, summary) in &rollup {
//!     println!("{}: ${:.2}", pi, summary.total_cost());
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod normalize;
pub mod review;
pub mod subsidy;
pub mod utils;

pub use aggregate::{
    aggregate_charges, PersonSummary, ProjectSummary, FALLBACK_SERVICE, NO_PROJECT,
};
pub use config::*;
pub use error::{ChargebackError, Result};
pub use ingest::{ingest_focus_csv, IngestOptions, IngestReport, PeriodOutcome};
pub use ledger::{
    BillingPeriod, ImportRecord, Ledger, LedgerCharge, MergeOutcome, MergeStats, PeriodStats,
    PeriodStatus, Source, SourceType,
};
pub use normalize::*;
pub use review::{
    RuleSet, INVALID_FUND_ORG, MISSING_FUND_ORG, MISSING_PROJECT, PATTERN_MATCH_PREFIX,
    PERIOD_MISMATCH,
};
pub use subsidy::{Allocation, RuleUsage, SubsidyLedger};
pub use utils::*;

use log::info;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One handle over the ledger database, the subsidy state file and the
/// validated configuration.
pub struct ChargebackProcessor {
    ledger: Ledger,
    config: ChargebackConfig,
    subsidy_state: SubsidyLedger,
    state_path: PathBuf,
}

impl ChargebackProcessor {
    pub fn open(db_path: &Path, state_path: &Path, config: ChargebackConfig) -> Result<Self> {
        config.validate()?;

        let ledger = Ledger::open(db_path)?;
        ledger.migrate()?;
        let subsidy_state = SubsidyLedger::load(state_path)?;

        info!("Opened chargeback ledger at {}", db_path.display());
        Ok(Self {
            ledger,
            config,
            subsidy_state,
            state_path: state_path.to_path_buf(),
        })
    }

    /// Ingests one FOCUS CSV file and persists the subsidy state alongside
    /// the ledger writes. On a dry run, or when the run fails partway, the
    /// in-memory subsidy totals are restored from disk so nothing simulated
    /// or partial survives.
    pub fn ingest_file(
        &mut self,
        csv_path: &Path,
        source_name: &str,
        options: &IngestOptions,
    ) -> Result<IngestReport> {
        let result = ingest_focus_csv(
            &mut self.ledger,
            &self.config,
            &mut self.subsidy_state,
            csv_path,
            source_name,
            options,
        );

        match result {
            Ok(report) => {
                if options.dry_run {
                    self.subsidy_state = SubsidyLedger::load(&self.state_path)?;
                } else {
                    self.subsidy_state.save(&self.state_path)?;
                }
                Ok(report)
            }
            Err(err) => {
                // In-memory totals only survive a committed run.
                self.subsidy_state = SubsidyLedger::load(&self.state_path)?;
                Err(err)
            }
        }
    }

    /// Person → project rollup for one period. Pass `include_flagged = false`
    /// to restrict the rollup to charges that passed or cleared review.
    pub fn rollup_for_period(
        &self,
        period_key: &str,
        include_flagged: bool,
    ) -> Result<BTreeMap<String, PersonSummary>> {
        let period = self
            .ledger
            .get_period_by_key(period_key)?
            .ok_or_else(|| ChargebackError::UnknownPeriodKey(period_key.to_string()))?;
        let filter = if include_flagged { None } else { Some(false) };
        let charges = self.ledger.charges_for_period(period.id, filter)?;
        Ok(aggregate_charges(&charges))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn config(&self) -> &ChargebackConfig {
        &self.config
    }

    pub fn subsidy_state(&self) -> &SubsidyLedger {
        &self.subsidy_state
    }
}

/// Opens the ledger and state at the given paths, ingests one file and
/// returns the report.
pub fn ingest_focus_file(
    db_path: &Path,
    state_path: &Path,
    config: ChargebackConfig,
    csv_path: &Path,
    source_name: &str,
    options: &IngestOptions,
) -> Result<IngestReport> {
    let mut processor = ChargebackProcessor::open(db_path, state_path, config)?;
    processor.ingest_file(csv_path, source_name, options)
}
