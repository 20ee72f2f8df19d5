//! Capped subsidy allocation with persistent running totals.
//!
//! Unlike the rest of the pipeline this component is stateful: each
//! allocation consumes cap from a `(project, period bucket, rule)` cell, so a
//! charge must be routed through it exactly once per run. The caller owns
//! persistence: load the state before an import run, save it after the run
//! commits, and throw the mutated copy away on a dry run.

use crate::config::{PeriodBasis, SubsidyRule};
use crate::error::Result;
use crate::utils::{fiscal_year_bucket, parse_fiscal_start, round_half_even};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Running totals for one (project, bucket, rule) cell.
///
/// `used` accumulates gross charge amounts unrounded; `subsidized` is the sum
/// of the rounded amounts actually covered; `remaining` is recomputed from
/// the cap after every allocation and never goes negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleUsage {
    pub used: f64,
    pub subsidized: f64,
    pub remaining: f64,
}

/// How one charge was split between a subsidy and the project's own funding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub project_id: Option<String>,
    /// Name of the rule that matched, if any.
    pub rule: Option<String>,
    pub funding_target: Option<String>,
    /// Period bucket the cap was consumed from, e.g. "FY2026" or "CY2025".
    pub bucket: Option<String>,
    pub subsidized: f64,
    pub billable: f64,
}

impl Allocation {
    /// A pass-through allocation: the full amount is billable and no cap
    /// was consumed.
    pub fn unsubsidized(project_id: Option<&str>, cost: f64) -> Self {
        Self {
            project_id: project_id.map(str::to_string),
            rule: None,
            funding_target: None,
            bucket: None,
            subsidized: 0.0,
            billable: cost,
        }
    }
}

/// Persistent subsidy totals, keyed project → period bucket → rule name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubsidyLedger {
    #[serde(default)]
    pub projects: BTreeMap<String, BTreeMap<String, BTreeMap<String, RuleUsage>>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl SubsidyLedger {
    /// Loads persisted totals; a missing file starts a fresh ledger.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(
                "No subsidy state at {}, starting fresh",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let ledger = serde_json::from_str(&raw)?;
        Ok(ledger)
    }

    /// Persists the totals, stamping `last_updated`. The write goes through
    /// a sibling temp file and a rename so a crash cannot leave a truncated
    /// state file behind.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Some(Utc::now());
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, path)?;
        debug!("Saved subsidy state to {}", path.display());
        Ok(())
    }

    pub fn usage_for(
        &self,
        project_id: &str,
        bucket: &str,
        rule_name: &str,
    ) -> Option<&RuleUsage> {
        self.projects.get(project_id)?.get(bucket)?.get(rule_name)
    }

    /// Splits one charge between subsidy and project funding.
    ///
    /// The first enabled rule (in list order) whose service set contains the
    /// charge's service wins; rules never stack. Charges with no project, no
    /// matching rule, or a non-positive amount pass through fully billable
    /// without touching any totals. An exhausted cap is not an error: the
    /// subsidized portion is simply whatever remains, possibly zero, while
    /// `used` keeps accruing gross usage.
    pub fn allocate(
        &mut self,
        rules: &[SubsidyRule],
        project_id: Option<&str>,
        service_name: Option<&str>,
        charge_date: NaiveDate,
        cost: f64,
    ) -> Allocation {
        let Some(project_id) = project_id else {
            return Allocation::unsubsidized(None, cost);
        };

        let matched = rules.iter().find(|rule| {
            rule.enabled
                && service_name
                    .is_some_and(|service| rule.applicable_services.iter().any(|s| s == service))
        });
        let Some(rule) = matched else {
            return Allocation::unsubsidized(Some(project_id), cost);
        };

        if cost <= 0.0 {
            return Allocation::unsubsidized(Some(project_id), cost);
        }

        let bucket = match rule.period_basis {
            PeriodBasis::FiscalYear => match parse_fiscal_start(&rule.fiscal_start) {
                Ok((month, day)) => fiscal_year_bucket(charge_date, month, day),
                Err(err) => {
                    warn!(
                        "Subsidy rule '{}' has an unusable fiscal start: {}",
                        rule.name, err
                    );
                    return Allocation::unsubsidized(Some(project_id), cost);
                }
            },
            PeriodBasis::CalendarYear => format!("CY{}", charge_date.year()),
        };

        let usage = self
            .projects
            .entry(project_id.to_string())
            .or_default()
            .entry(bucket.clone())
            .or_default()
            .entry(rule.name.clone())
            .or_insert(RuleUsage {
                used: 0.0,
                subsidized: 0.0,
                remaining: rule.cap_amount,
            });

        let subsidized = round_half_even(cost.min(usage.remaining), 2);
        let billable = round_half_even(cost - subsidized, 2);

        usage.used += cost;
        usage.subsidized += subsidized;
        // Recomputed from the cap rather than decremented, so float dust
        // cannot drift the total.
        usage.remaining = (rule.cap_amount - usage.subsidized).max(0.0);

        Allocation {
            project_id: Some(project_id.to_string()),
            rule: Some(rule.name.clone()),
            funding_target: Some(rule.funding_target.clone()),
            bucket: Some(bucket),
            subsidized,
            billable,
        }
    }
}
