use crate::config::TagMappingConfig;
use crate::review::{MISSING_FUND_ORG, MISSING_PROJECT};
use crate::utils::{parse_cost, parse_date_flexible, period_key_from_date};
use chrono::NaiveDate;
use csv::StringRecord;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Canonical FOCUS column names and their internal field names.
const FOCUS_COLUMNS: [(&str, &str); 12] = [
    ("billingperiodstart", "billing_period_start"),
    ("billingperiodend", "billing_period_end"),
    ("chargeperiodstart", "charge_period_start"),
    ("chargeperiodend", "charge_period_end"),
    ("listcost", "list_cost"),
    ("contractedcost", "contracted_cost"),
    ("billedcost", "billed_cost"),
    ("effectivecost", "effective_cost"),
    ("resourceid", "resource_id"),
    ("resourcename", "resource_name"),
    ("servicename", "service_name"),
    ("tags", "tags"),
];

/// One input row keyed by canonical field name.
pub type RawRecord = BTreeMap<String, String>;

/// Matches a header against the canonical column set, ignoring case,
/// surrounding whitespace and a leading BOM. Unknown headers map to `None`.
pub fn canonical_field(header: &str) -> Option<&'static str> {
    let cleaned = header.trim_start_matches('\u{feff}').trim().to_ascii_lowercase();
    FOCUS_COLUMNS
        .iter()
        .find(|(focus, _)| *focus == cleaned)
        .map(|(_, internal)| *internal)
}

/// Maps CSV headers to column indices by canonical field name.
/// The first occurrence wins if a header repeats.
pub fn map_headers(headers: &StringRecord) -> BTreeMap<String, usize> {
    let mut columns = BTreeMap::new();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(name) = canonical_field(header) {
            columns.entry(name.to_string()).or_insert(idx);
        }
    }
    columns
}

/// Projects a CSV record onto the canonical fields found in its header.
pub fn raw_record(columns: &BTreeMap<String, usize>, record: &StringRecord) -> RawRecord {
    let mut raw = RawRecord::new();
    for (name, &idx) in columns {
        if let Some(value) = record.get(idx) {
            raw.insert(name.clone(), value.to_string());
        }
    }
    raw
}

/// The embedded tag payload of a raw record, before resolution.
///
/// Providers ship tags as a serialized JSON object, as an already-structured
/// map (API sources), or not at all. `resolve` collapses all three into one
/// canonical string map; downstream code never sees the raw forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagBlob {
    Absent,
    Structured(BTreeMap<String, String>),
    Unparsed(String),
}

impl TagBlob {
    pub fn from_field(value: Option<&str>) -> Self {
        match value {
            None => TagBlob::Absent,
            Some(s) if s.trim().is_empty() => TagBlob::Absent,
            Some(s) => TagBlob::Unparsed(s.to_string()),
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => TagBlob::Structured(
                map.into_iter().map(|(k, v)| (k, stringify_tag(v))).collect(),
            ),
            Value::String(s) => TagBlob::from_field(Some(&s)),
            _ => TagBlob::Absent,
        }
    }

    /// Resolves the payload into a canonical tag map.
    /// Decode failures yield an empty map, never an error.
    pub fn resolve(self) -> BTreeMap<String, String> {
        match self {
            TagBlob::Absent => BTreeMap::new(),
            TagBlob::Structured(map) => map,
            TagBlob::Unparsed(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => {
                    map.into_iter().map(|(k, v)| (k, stringify_tag(v))).collect()
                }
                Ok(_) => {
                    debug!("Tag payload is valid JSON but not an object; ignoring");
                    BTreeMap::new()
                }
                Err(e) => {
                    debug!("Failed to decode tag payload: {}", e);
                    BTreeMap::new()
                }
            },
        }
    }
}

fn stringify_tag(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// One cost line after field mapping, ready for flagging and merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCharge {
    /// Billing period key in `YYYY-MM` form, derived from the period start.
    pub period_key: String,
    pub billing_period_start: Option<String>,
    pub billing_period_end: Option<String>,
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
    pub cost_center: Option<String>,
    pub reference_1: Option<String>,
    pub reference_2: Option<String>,
    /// Full decoded tag map, provider keys preserved.
    pub raw_tags: BTreeMap<String, String>,
    pub needs_review: bool,
    pub review_reason: Option<String>,
}

impl NormalizedCharge {
    /// The date used for subsidy bucketing: the charge period start when
    /// parseable, otherwise the billing period start, otherwise the first
    /// day of the billing period.
    pub fn charge_date(&self) -> Option<NaiveDate> {
        self.charge_period_start
            .as_deref()
            .and_then(parse_date_flexible)
            .or_else(|| {
                self.billing_period_start
                    .as_deref()
                    .and_then(parse_date_flexible)
            })
            .or_else(|| parse_date_flexible(&self.period_key))
    }
}

fn opt_field(raw: &RawRecord, key: &str) -> Option<String> {
    raw.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn tag_value(tags: &BTreeMap<String, String>, key: &str) -> Option<String> {
    tags.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Normalizes one raw record into a `NormalizedCharge`.
///
/// Row-fatal conditions (missing or unparseable period start, missing
/// responsible person) come back as an error string for the caller's error
/// list. A missing project or fund/org is not fatal: the charge is kept and
/// a review reason is queued, project first.
pub fn normalize_row(
    raw: &RawRecord,
    tags_config: &TagMappingConfig,
) -> std::result::Result<NormalizedCharge, String> {
    let period_value = raw
        .get("billing_period_start")
        .map(String::as_str)
        .unwrap_or("")
        .trim();
    if period_value.is_empty() {
        return Err("Missing BillingPeriodStart".to_string());
    }
    let period_key = period_key_from_date(period_value)
        .ok_or_else(|| "Invalid BillingPeriodStart format".to_string())?;

    let tags = TagBlob::from_field(raw.get("tags").map(String::as_str)).resolve();

    let pi_email = tag_value(&tags, &tags_config.pi_email)
        .ok_or_else(|| format!("Missing {} tag", tags_config.pi_email))?;

    let project_id = tag_value(&tags, &tags_config.project_id);
    let fund_org = tag_value(&tags, &tags_config.fund_org);
    let cost_center = tag_value(&tags, &tags_config.cost_center);
    let reference_1 = tags_config
        .reference_1
        .as_deref()
        .and_then(|key| tag_value(&tags, key));
    let reference_2 = tags_config
        .reference_2
        .as_deref()
        .and_then(|key| tag_value(&tags, key));

    let review_reason = if project_id.is_none() {
        Some(MISSING_PROJECT.to_string())
    } else if fund_org.is_none() {
        Some(MISSING_FUND_ORG.to_string())
    } else {
        None
    };

    let billed_cost = raw
        .get("billed_cost")
        .and_then(|v| parse_cost(v))
        .unwrap_or(0.0);

    Ok(NormalizedCharge {
        period_key,
        billing_period_start: Some(period_value.to_string()),
        billing_period_end: opt_field(raw, "billing_period_end"),
        charge_period_start: opt_field(raw, "charge_period_start"),
        charge_period_end: opt_field(raw, "charge_period_end"),
        list_cost: raw.get("list_cost").and_then(|v| parse_cost(v)),
        contracted_cost: raw.get("contracted_cost").and_then(|v| parse_cost(v)),
        billed_cost,
        effective_cost: raw.get("effective_cost").and_then(|v| parse_cost(v)),
        resource_id: opt_field(raw, "resource_id"),
        resource_name: opt_field(raw, "resource_name"),
        service_name: opt_field(raw, "service_name"),
        pi_email,
        project_id,
        fund_org,
        cost_center,
        reference_1,
        reference_2,
        raw_tags: tags,
        needs_review: review_reason.is_some(),
        review_reason,
    })
}
