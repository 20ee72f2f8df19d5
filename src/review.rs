use crate::config::ReviewConfig;
use crate::normalize::NormalizedCharge;
use log::warn;
use regex::{Regex, RegexBuilder};

pub const PERIOD_MISMATCH: &str = "period_mismatch";
pub const MISSING_PROJECT: &str = "missing_project";
pub const MISSING_FUND_ORG: &str = "missing_fund_org";
pub const INVALID_FUND_ORG: &str = "invalid_fund_org";
pub const PATTERN_MATCH_PREFIX: &str = "pattern_match:";

/// Compiled review rules. Both families are compiled once per run;
/// malformed patterns are logged and dropped, never fatal.
#[derive(Debug, Default)]
pub struct RuleSet {
    flag_patterns: Vec<Regex>,
    fund_org_patterns: Vec<Regex>,
}

fn compile_patterns(patterns: &[String], family: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping invalid {} pattern '{}': {}", family, pattern, e);
                    None
                }
            }
        })
        .collect()
}

// re.match semantics: the pattern must match starting at the first character.
fn matches_at_start(re: &Regex, value: &str) -> bool {
    re.find(value).is_some_and(|m| m.start() == 0)
}

impl RuleSet {
    pub fn compile(config: &ReviewConfig) -> Self {
        Self {
            flag_patterns: compile_patterns(&config.flag_patterns, "flag"),
            fund_org_patterns: compile_patterns(&config.fund_org_patterns, "fund/org"),
        }
    }

    pub fn flag_pattern_count(&self) -> usize {
        self.flag_patterns.len()
    }

    pub fn fund_org_pattern_count(&self) -> usize {
        self.fund_org_patterns.len()
    }

    /// Searches service name, resource id and resource name (in that order)
    /// for each content pattern; the first hit wins.
    pub fn content_flag_reason(&self, charge: &NormalizedCharge) -> Option<String> {
        let candidates = [
            charge.service_name.as_deref(),
            charge.resource_id.as_deref(),
            charge.resource_name.as_deref(),
        ];
        for re in &self.flag_patterns {
            for value in candidates.iter().flatten() {
                if re.is_match(value) {
                    return Some(format!("{}{}", PATTERN_MATCH_PREFIX, re.as_str()));
                }
            }
        }
        None
    }

    /// A non-empty fund/org code must match at least one configured pattern
    /// at its start. An empty pattern list means no validation is performed.
    /// Missing codes are the normalizer's concern, never checked here.
    pub fn fund_org_valid(&self, code: &str) -> bool {
        if self.fund_org_patterns.is_empty() {
            return true;
        }
        self.fund_org_patterns
            .iter()
            .any(|re| matches_at_start(re, code))
    }

    /// Yields the single review reason a charge retains, first-assigned wins:
    /// period mismatch, then the normalizer's queued reason (missing project
    /// or fund/org), then fund/org validity, then content patterns.
    pub fn evaluate(
        &self,
        charge: &NormalizedCharge,
        expected_period: Option<&str>,
    ) -> Option<String> {
        if let Some(expected) = expected_period {
            if charge.period_key != expected {
                return Some(PERIOD_MISMATCH.to_string());
            }
        }

        if let Some(reason) = &charge.review_reason {
            return Some(reason.clone());
        }

        if let Some(code) = charge.fund_org.as_deref() {
            if !self.fund_org_valid(code) {
                return Some(INVALID_FUND_ORG.to_string());
            }
        }

        self.content_flag_reason(charge)
    }

    /// Applies the evaluation outcome, keeping the review flag and its
    /// reason in lockstep.
    pub fn apply(&self, charge: &mut NormalizedCharge, expected_period: Option<&str>) {
        let reason = self.evaluate(charge, expected_period);
        charge.needs_review = reason.is_some();
        charge.review_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn charge() -> NormalizedCharge {
        NormalizedCharge {
            period_key: "2025-01".to_string(),
            billing_period_start: Some("2025-01-01".to_string()),
            billing_period_end: None,
            charge_period_start: None,
            charge_period_end: None,
            list_cost: None,
            contracted_cost: None,
            billed_cost: 10.0,
            effective_cost: None,
            resource_id: Some("i-abc123".to_string()),
            resource_name: Some("web-server-1".to_string()),
            service_name: Some("Amazon EC2".to_string()),
            pi_email: "smith@example.edu".to_string(),
            project_id: Some("genomics-1".to_string()),
            fund_org: Some("12345".to_string()),
            cost_center: None,
            reference_1: None,
            reference_2: None,
            raw_tags: BTreeMap::new(),
            needs_review: false,
            review_reason: None,
        }
    }

    fn rules(flag: &[&str], fund: &[&str]) -> RuleSet {
        RuleSet::compile(&ReviewConfig {
            flag_patterns: flag.iter().map(|s| s.to_string()).collect(),
            fund_org_patterns: fund.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_compile_skips_malformed_patterns() {
        let rules = rules(&["gpu", "[invalid"], &["(unclosed"]);
        assert_eq!(rules.flag_pattern_count(), 1);
        assert_eq!(rules.fund_org_pattern_count(), 0);
    }

    #[test]
    fn test_content_flag_is_case_insensitive_search() {
        let rules = rules(&["ec2"], &[]);
        let reason = rules.content_flag_reason(&charge()).unwrap();
        assert_eq!(reason, "pattern_match:ec2");
    }

    #[test]
    fn test_content_flag_first_pattern_wins() {
        // Both patterns hit some field, but the first configured pattern wins
        let rules = rules(&["web-server", "ec2"], &[]);
        let reason = rules.content_flag_reason(&charge()).unwrap();
        assert_eq!(reason, "pattern_match:web-server");
    }

    #[test]
    fn test_content_flag_reaches_resource_fields() {
        let rules = rules(&["abc123"], &[]);
        let mut c = charge();
        c.service_name = None;
        assert_eq!(
            rules.content_flag_reason(&c).as_deref(),
            Some("pattern_match:abc123")
        );
    }

    #[test]
    fn test_content_flag_no_match() {
        let rules = rules(&["slurm"], &[]);
        assert!(rules.content_flag_reason(&charge()).is_none());
    }

    #[test]
    fn test_fund_org_empty_pattern_list_always_valid() {
        let rules = rules(&[], &[]);
        assert!(rules.fund_org_valid("anything"));
    }

    #[test]
    fn test_fund_org_any_pattern_passes() {
        let rules = rules(&[], &[r"1\d{4}", r"9\d{4}"]);
        assert!(rules.fund_org_valid("12345"));
        assert!(rules.fund_org_valid("98765"));
        assert!(!rules.fund_org_valid("55555"));
    }

    #[test]
    fn test_fund_org_matches_at_start_only() {
        let rules = rules(&[], &["345"]);
        assert!(rules.fund_org_valid("34599"));
        assert!(!rules.fund_org_valid("12345"));
    }

    #[test]
    fn test_evaluate_period_mismatch_takes_precedence() {
        let rules = rules(&["ec2"], &[]);
        let mut c = charge();
        c.project_id = None;
        c.review_reason = Some(MISSING_PROJECT.to_string());
        c.needs_review = true;

        let reason = rules.evaluate(&c, Some("2025-02"));
        assert_eq!(reason.as_deref(), Some(PERIOD_MISMATCH));
    }

    #[test]
    fn test_evaluate_queued_reason_beats_invalid_fund_org() {
        let rules = rules(&[], &[r"9\d{4}"]);
        let mut c = charge();
        c.review_reason = Some(MISSING_PROJECT.to_string());
        c.needs_review = true;

        // fund_org "12345" fails validation, but the queued reason is kept
        let reason = rules.evaluate(&c, None);
        assert_eq!(reason.as_deref(), Some(MISSING_PROJECT));
    }

    #[test]
    fn test_evaluate_invalid_fund_org_beats_pattern_match() {
        let rules = rules(&["ec2"], &[r"9\d{4}"]);
        let reason = rules.evaluate(&charge(), None);
        assert_eq!(reason.as_deref(), Some(INVALID_FUND_ORG));
    }

    #[test]
    fn test_evaluate_clean_charge() {
        let rules = rules(&["slurm"], &[r"1\d{4}"]);
        assert!(rules.evaluate(&charge(), None).is_none());
        assert!(rules.evaluate(&charge(), Some("2025-01")).is_none());
    }

    #[test]
    fn test_apply_keeps_flag_and_reason_in_lockstep() {
        let rules = rules(&["ec2"], &[]);
        let mut c = charge();
        rules.apply(&mut c, None);
        assert!(c.needs_review);
        assert_eq!(c.review_reason.as_deref(), Some("pattern_match:ec2"));

        let empty = RuleSet::default();
        let mut c = charge();
        c.needs_review = true;
        c.review_reason = None;
        empty.apply(&mut c, None);
        assert!(!c.needs_review);
        assert!(c.review_reason.is_none());
    }
}
