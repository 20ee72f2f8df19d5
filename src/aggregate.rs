//! Rollups of ledger charges into per-person, per-project summaries.
//!
//! Aggregation is a pure read-side computation: it never mutates the ledger
//! and can be rerun at any time. Flagged charges are included or excluded by
//! the caller's choice of input set.

use crate::ledger::LedgerCharge;
use serde::Serialize;
use std::collections::BTreeMap;

/// Bucket for charges with no project attribution.
pub const NO_PROJECT: &str = "(no project)";

/// Service bucket for charges with no service name.
pub const FALLBACK_SERVICE: &str = "Other";

/// Costs attributed to one project under one person.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub project_id: String,
    /// Funding organization, taken from the first charge seen for the
    /// project. Later charges never overwrite it.
    pub fund_org: Option<String>,
    pub total_cost: f64,
    pub total_list_cost: f64,
    pub service_breakdown: BTreeMap<String, f64>,
    pub charge_count: usize,
}

impl ProjectSummary {
    fn new(project_id: String, fund_org: Option<String>) -> Self {
        Self {
            project_id,
            fund_org,
            total_cost: 0.0,
            total_list_cost: 0.0,
            service_breakdown: BTreeMap::new(),
            charge_count: 0,
        }
    }

    fn add_charge(&mut self, charge: &LedgerCharge) {
        self.total_cost += charge.billed_cost;
        // A row without a list price contributes its billed cost, so the
        // discount for that row is zero rather than the full amount.
        self.total_list_cost += charge.list_cost.unwrap_or(charge.billed_cost);
        let service = charge
            .service_name
            .clone()
            .unwrap_or_else(|| FALLBACK_SERVICE.to_string());
        *self.service_breakdown.entry(service).or_insert(0.0) += charge.billed_cost;
        self.charge_count += 1;
    }

    pub fn discount_amount(&self) -> f64 {
        self.total_list_cost - self.total_cost
    }

    pub fn discount_percent(&self) -> f64 {
        if self.total_list_cost > 0.0 {
            self.discount_amount() / self.total_list_cost * 100.0
        } else {
            0.0
        }
    }
}

/// All projects billed to one principal investigator.
#[derive(Debug, Clone, Serialize)]
pub struct PersonSummary {
    pub pi_email: String,
    pub projects: BTreeMap<String, ProjectSummary>,
}

impl PersonSummary {
    fn new(pi_email: String) -> Self {
        Self {
            pi_email,
            projects: BTreeMap::new(),
        }
    }

    fn add_charge(&mut self, charge: &LedgerCharge) {
        let key = charge
            .project_id
            .clone()
            .unwrap_or_else(|| NO_PROJECT.to_string());
        self.projects
            .entry(key.clone())
            .or_insert_with(|| ProjectSummary::new(key, charge.fund_org.clone()))
            .add_charge(charge);
    }

    pub fn total_cost(&self) -> f64 {
        self.projects.values().map(|p| p.total_cost).sum()
    }

    pub fn total_list_cost(&self) -> f64 {
        self.projects.values().map(|p| p.total_list_cost).sum()
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }
}

/// Groups charges by PI email, then by project. Every input charge lands in
/// exactly one (person, project, service) cell, so the grand total of the
/// rollup equals the sum of the input costs.
pub fn aggregate_charges(charges: &[LedgerCharge]) -> BTreeMap<String, PersonSummary> {
    let mut people: BTreeMap<String, PersonSummary> = BTreeMap::new();
    for charge in charges {
        people
            .entry(charge.pi_email.clone())
            .or_insert_with(|| PersonSummary::new(charge.pi_email.clone()))
            .add_charge(charge);
    }
    people
}
