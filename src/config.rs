use crate::error::{ChargebackError, Result};
use crate::utils::parse_fiscal_start;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Maps canonical charge fields onto the tag keys a provider actually emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TagMappingConfig {
    #[serde(default = "default_pi_email_tag")]
    #[schemars(description = "Tag key holding the responsible person's email address (required on every charge)")]
    pub pi_email: String,

    #[serde(default = "default_project_tag")]
    #[schemars(description = "Tag key holding the project identifier")]
    pub project_id: String,

    #[serde(default = "default_fund_org_tag")]
    #[schemars(description = "Tag key holding the fund/org accounting code")]
    pub fund_org: String,

    #[serde(default = "default_cost_center_tag")]
    #[schemars(description = "Tag key holding the cost center")]
    pub cost_center: String,

    #[serde(default)]
    #[schemars(description = "Optional tag key copied into the first free-form reference field")]
    pub reference_1: Option<String>,

    #[serde(default)]
    #[schemars(description = "Optional tag key copied into the second free-form reference field")]
    pub reference_2: Option<String>,
}

fn default_pi_email_tag() -> String {
    "pi_email".to_string()
}

fn default_project_tag() -> String {
    "project".to_string()
}

fn default_fund_org_tag() -> String {
    "fund_org".to_string()
}

fn default_cost_center_tag() -> String {
    "cost_center".to_string()
}

impl Default for TagMappingConfig {
    fn default() -> Self {
        Self {
            pi_email: default_pi_email_tag(),
            project_id: default_project_tag(),
            fund_org: default_fund_org_tag(),
            cost_center: default_cost_center_tag(),
            reference_1: None,
            reference_2: None,
        }
    }
}

/// Regular-expression rule sets driving the review flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ReviewConfig {
    #[serde(default)]
    #[schemars(
        description = "Patterns searched (case-insensitively) against service name, resource id and resource name; a match flags the charge for review"
    )]
    pub flag_patterns: Vec<String>,

    #[serde(default)]
    #[schemars(
        description = "Patterns a fund/org code must match at its start (any one suffices). An empty list disables fund/org validation"
    )]
    pub fund_org_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PeriodBasis {
    #[schemars(
        description = "Buckets charges by the fiscal year containing their date, per the rule's fiscal start"
    )]
    FiscalYear,

    #[schemars(description = "Buckets charges by plain calendar year")]
    CalendarYear,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubsidyRuleType {
    #[default]
    #[schemars(description = "Caps the subsidized total per project within each period bucket")]
    PerProjectCap,
}

/// A capped-subsidy policy. Rules are evaluated in configured order and the
/// first enabled rule covering a charge's service wins; rules never stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct SubsidyRule {
    #[schemars(description = "Unique rule name; also keys the persisted running totals")]
    pub name: String,

    #[serde(default)]
    #[schemars(description = "Human-readable description of the subsidy program")]
    pub description: String,

    #[schemars(description = "The fund that absorbs the subsidized portion (e.g. a startup allocation fund)")]
    pub funding_target: String,

    #[serde(default, rename = "type")]
    pub rule_type: SubsidyRuleType,

    #[schemars(description = "Maximum amount subsidized per project within one period bucket")]
    pub cap_amount: f64,

    #[schemars(description = "Whether the cap resets on a fiscal or calendar year")]
    pub period_basis: PeriodBasis,

    #[serde(default = "default_fiscal_start")]
    #[schemars(description = "First day of the fiscal year in MM-DD form (ignored for calendar basis)")]
    pub fiscal_start: String,

    #[serde(default)]
    #[schemars(description = "Exact service names this rule covers; a charge must match one to be subsidized")]
    pub applicable_services: Vec<String>,

    #[serde(default = "default_true")]
    #[schemars(description = "Disabled rules are skipped during allocation")]
    pub enabled: bool,
}

fn default_fiscal_start() -> String {
    "07-01".to_string()
}

fn default_true() -> bool {
    true
}

impl SubsidyRule {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ChargebackError::InvalidSubsidyRule {
                name: self.name.clone(),
                details: "name must not be empty".to_string(),
            });
        }
        if !self.cap_amount.is_finite() || self.cap_amount < 0.0 {
            return Err(ChargebackError::InvalidSubsidyRule {
                name: self.name.clone(),
                details: format!("cap_amount {} must be a non-negative number", self.cap_amount),
            });
        }
        if self.period_basis == PeriodBasis::FiscalYear {
            parse_fiscal_start(&self.fiscal_start)?;
        }
        Ok(())
    }
}

/// Top-level configuration for the chargeback pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChargebackConfig {
    #[serde(default)]
    pub tags: TagMappingConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    #[schemars(description = "Ordered list of subsidy rules; first match wins")]
    pub subsidies: Vec<SubsidyRule>,
}

impl ChargebackConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Structural validation. Review patterns are deliberately not checked
    /// here: malformed regexes are skipped at compile time, never fatal.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.subsidies {
            rule.validate()?;
        }

        let mut names: Vec<&str> = self.subsidies.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(ChargebackError::InvalidSubsidyRule {
                    name: pair[0].to_string(),
                    details: "duplicate rule name".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ChargebackConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
