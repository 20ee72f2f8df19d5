use cloud_chargeback::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const FOCUS_HEADER: &str = "BillingPeriodStart,BillingPeriodEnd,ChargePeriodStart,ListCost,BilledCost,ResourceId,ResourceName,ServiceName,Tags\n";

fn tags_field(pairs: &[(&str, &str)]) -> String {
    let inner = pairs
        .iter()
        .map(|(k, v)| format!("\"\"{}\"\": \"\"{}\"\"", k, v))
        .collect::<Vec<_>>()
        .join(", ");
    format!("\"{{{}}}\"", inner)
}

fn focus_row(
    period_start: &str,
    charge_start: &str,
    list_cost: &str,
    billed_cost: &str,
    resource_id: &str,
    service: &str,
    tags: &[(&str, &str)],
) -> String {
    format!(
        "{},,{},{},{},{},,{},{}\n",
        period_start,
        charge_start,
        list_cost,
        billed_cost,
        resource_id,
        service,
        tags_field(tags)
    )
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn open_processor(dir: &TempDir, config: ChargebackConfig) -> ChargebackProcessor {
    ChargebackProcessor::open(
        &dir.path().join("ledger.db"),
        &dir.path().join("subsidy_state.json"),
        config,
    )
    .unwrap()
}

fn review_config() -> ChargebackConfig {
    let mut config = ChargebackConfig::default();
    config.review.fund_org_patterns = vec![r"^\d{5}$".to_string()];
    config.review.flag_patterns = vec!["gpu-experimental".to_string()];
    config
}

fn provost_rule(cap: f64) -> SubsidyRule {
    SubsidyRule {
        name: "provost_ai".to_string(),
        description: "Provost covers initial AI usage per project".to_string(),
        funding_target: "provost-fund".to_string(),
        rule_type: SubsidyRuleType::PerProjectCap,
        cap_amount: cap,
        period_basis: PeriodBasis::FiscalYear,
        fiscal_start: "07-01".to_string(),
        applicable_services: vec!["OpenAI".to_string()],
        enabled: true,
    }
}

#[test]
fn test_monthly_billing_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = ChargebackConfig::default();
    config.tags.reference_1 = Some("award_number".to_string());

    let mut csv = String::from(FOCUS_HEADER);
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "100.00",
        "80.00",
        "i-aaa1",
        "Amazon EC2",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "genomics-1"),
            ("fund_org", "12345"),
            ("award_number", "NSF-2301"),
        ],
    ));
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-04",
        "",
        "20.00",
        "bucket-b1",
        "Amazon S3",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "genomics-1"),
            ("fund_org", "12345"),
        ],
    ));
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-05",
        "50.00",
        "50.00",
        "i-ccc3",
        "Amazon EC2",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "climate-2"),
            ("fund_org", "67890"),
        ],
    ));
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-06",
        "",
        "10.00",
        "vm-dd4",
        "Compute Engine",
        &[
            ("pi_email", "jones@example.edu"),
            ("project", "biology-3"),
            ("fund_org", "11223"),
        ],
    ));
    let csv_path = write_file(&dir, "aws_2025-01.csv", &csv);

    let mut processor = open_processor(&dir, config);
    let report = processor
        .ingest_file(&csv_path, "aws-focus", &IngestOptions::default())
        .unwrap();

    assert_eq!(report.total_rows, 4);
    assert_eq!(report.inserted, 4);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.flagged_rows, 0);
    assert_eq!(report.total_cost, 160.0);
    assert!(report.errors.is_empty());
    assert_eq!(report.periods.len(), 1);
    assert_eq!(report.periods[0].period_key, "2025-01");

    let ledger = processor.ledger();
    let period = ledger.get_period_by_key("2025-01").unwrap().unwrap();
    assert_eq!(period.status, PeriodStatus::Open);

    let stats = ledger.period_stats(period.id).unwrap();
    assert_eq!(stats.charge_count, 4);
    assert_eq!(stats.total_cost, 160.0);
    assert_eq!(stats.pi_count, 2);
    assert_eq!(stats.project_count, 3);
    assert_eq!(stats.flagged_count, 0);

    let charges = ledger.charges_for_period(period.id, None).unwrap();
    let ec2 = charges
        .iter()
        .find(|c| c.resource_id.as_deref() == Some("i-aaa1"))
        .unwrap();
    assert_eq!(ec2.list_cost, Some(100.0));
    assert_eq!(ec2.reference_1.as_deref(), Some("NSF-2301"));
    assert_eq!(
        ec2.tags().get("award_number").map(String::as_str),
        Some("NSF-2301")
    );

    let imports = ledger.imports_for_period(period.id).unwrap();
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].filename, "aws_2025-01.csv");
    assert_eq!(imports[0].row_count, 4);
    assert_eq!(imports[0].total_cost, 160.0);

    let source = ledger.get_source_by_name("aws-focus").unwrap().unwrap();
    assert_eq!(source.source_type, SourceType::File);
    assert_eq!(source.last_sync_status.as_deref(), Some("success"));
    assert!(source.last_sync_message.is_none());

    let rollup = processor.rollup_for_period("2025-01", false).unwrap();
    assert_eq!(rollup.len(), 2);

    let smith = &rollup["smith@example.edu"];
    assert_eq!(smith.project_count(), 2);
    assert_eq!(smith.total_cost(), 150.0);

    let genomics = &smith.projects["genomics-1"];
    assert_eq!(genomics.total_cost, 100.0);
    assert_eq!(genomics.total_list_cost, 120.0);
    assert_eq!(genomics.discount_amount(), 20.0);
    assert_eq!(genomics.fund_org.as_deref(), Some("12345"));
    assert_eq!(genomics.service_breakdown["Amazon EC2"], 80.0);
    assert_eq!(genomics.service_breakdown["Amazon S3"], 20.0);

    let jones = &rollup["jones@example.edu"];
    assert_eq!(jones.total_cost(), 10.0);
    assert_eq!(
        jones.projects["biology-3"].service_breakdown["Compute Engine"],
        10.0
    );
}

#[test]
fn test_reingest_converges_then_updates() {
    let dir = TempDir::new().unwrap();
    let tags: &[(&str, &str)] = &[
        ("pi_email", "smith@example.edu"),
        ("project", "genomics-1"),
        ("fund_org", "12345"),
    ];

    let mut original = String::from(FOCUS_HEADER);
    original.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "10.00",
        "res-123",
        "Amazon EC2",
        tags,
    ));
    let original_path = write_file(&dir, "jan.csv", &original);

    let mut corrected = String::from(FOCUS_HEADER);
    corrected.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "25.00",
        "res-123",
        "Amazon EC2",
        tags,
    ));
    let corrected_path = write_file(&dir, "jan_corrected.csv", &corrected);

    let mut processor = open_processor(&dir, ChargebackConfig::default());

    let first = processor
        .ingest_file(&original_path, "aws", &IngestOptions::default())
        .unwrap();
    assert_eq!(first.inserted, 1);

    let second = processor
        .ingest_file(&original_path, "aws", &IngestOptions::default())
        .unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 1);

    let third = processor
        .ingest_file(&corrected_path, "aws", &IngestOptions::default())
        .unwrap();
    assert_eq!(third.inserted, 0);
    assert_eq!(third.updated, 1);

    let ledger = processor.ledger();
    let period = ledger.get_period_by_key("2025-01").unwrap().unwrap();
    let charges = ledger.charges_for_period(period.id, None).unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].billed_cost, 25.0);

    // Every run logs an import, converged or not
    assert_eq!(ledger.imports_for_period(period.id).unwrap().len(), 3);
}

#[test]
fn test_review_flags_and_workflow() {
    let dir = TempDir::new().unwrap();

    let mut csv = String::from(FOCUS_HEADER);
    // No project tag
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "10.00",
        "res-a",
        "Amazon EC2",
        &[("pi_email", "smith@example.edu"), ("fund_org", "12345")],
    ));
    // No fund/org tag
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "20.00",
        "res-b",
        "Amazon EC2",
        &[("pi_email", "smith@example.edu"), ("project", "genomics-1")],
    ));
    // Fund/org fails the validity pattern
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "30.00",
        "res-c",
        "Amazon EC2",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "genomics-1"),
            ("fund_org", "abc"),
        ],
    ));
    // Resource id matches a content flag pattern
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "40.00",
        "gpu-experimental-01",
        "Amazon EC2",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "genomics-1"),
            ("fund_org", "12345"),
        ],
    ));
    // Clean
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "5.00",
        "res-e",
        "Amazon EC2",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "genomics-1"),
            ("fund_org", "12345"),
        ],
    ));
    let csv_path = write_file(&dir, "jan.csv", &csv);

    let mut processor = open_processor(&dir, review_config());
    let report = processor
        .ingest_file(&csv_path, "aws", &IngestOptions::default())
        .unwrap();

    assert_eq!(report.total_rows, 5);
    assert_eq!(report.flagged_rows, 4);
    assert_eq!(report.flagged_cost, 100.0);
    assert_eq!(report.total_cost, 105.0);

    let ledger = processor.ledger();
    let period = ledger.get_period_by_key("2025-01").unwrap().unwrap();
    let flagged = ledger.flagged_charges(Some(period.id)).unwrap();
    assert_eq!(flagged.len(), 4);

    let reason_for = |resource: &str| {
        flagged
            .iter()
            .find(|c| c.resource_id.as_deref() == Some(resource))
            .and_then(|c| c.review_reason.clone())
            .unwrap()
    };
    assert_eq!(reason_for("res-a"), MISSING_PROJECT);
    assert_eq!(reason_for("res-b"), MISSING_FUND_ORG);
    assert_eq!(reason_for("res-c"), INVALID_FUND_ORG);
    assert_eq!(reason_for("gpu-experimental-01"), "pattern_match:gpu-experimental");

    // Every stored charge keeps flag and reason in lockstep
    for charge in ledger.charges_for_period(period.id, None).unwrap() {
        assert_eq!(charge.needs_review, charge.review_reason.is_some());
    }

    // Flagged charges are excluded from the clean rollup but present in the full one
    let clean = processor.rollup_for_period("2025-01", false).unwrap();
    assert_eq!(clean["smith@example.edu"].total_cost(), 5.0);
    let full = processor.rollup_for_period("2025-01", true).unwrap();
    assert_eq!(full["smith@example.edu"].total_cost(), 105.0);

    // Approving the missing-project charge clears flag and reason together
    let missing_project = flagged
        .iter()
        .find(|c| c.resource_id.as_deref() == Some("res-a"))
        .unwrap();
    processor
        .ledger()
        .approve_charge(missing_project.id, "admin@example.edu")
        .unwrap();
    let clean = processor.rollup_for_period("2025-01", false).unwrap();
    assert_eq!(clean["smith@example.edu"].total_cost(), 15.0);

    // Rejecting deletes the row outright
    let invalid_fund = flagged
        .iter()
        .find(|c| c.resource_id.as_deref() == Some("res-c"))
        .unwrap();
    processor.ledger().reject_charge(invalid_fund.id).unwrap();
    assert_eq!(
        processor
            .ledger()
            .charges_for_period(period.id, None)
            .unwrap()
            .len(),
        4
    );

    // Everything else clears in one sweep
    let cleared = processor
        .ledger()
        .approve_all_for_period(period.id, "admin@example.edu")
        .unwrap();
    assert_eq!(cleared, 2);
    assert!(processor
        .ledger()
        .flagged_charges(Some(period.id))
        .unwrap()
        .is_empty());
}

#[test]
fn test_period_lifecycle_gates_imports() {
    let dir = TempDir::new().unwrap();
    let tags: &[(&str, &str)] = &[
        ("pi_email", "smith@example.edu"),
        ("project", "genomics-1"),
        ("fund_org", "12345"),
    ];

    let mut csv = String::from(FOCUS_HEADER);
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "10.00",
        "res-123",
        "Amazon EC2",
        tags,
    ));
    let csv_path = write_file(&dir, "jan.csv", &csv);

    let mut corrected = String::from(FOCUS_HEADER);
    corrected.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "25.00",
        "res-123",
        "Amazon EC2",
        tags,
    ));
    let corrected_path = write_file(&dir, "jan_corrected.csv", &corrected);

    let mut processor = open_processor(&dir, ChargebackConfig::default());
    processor
        .ingest_file(&csv_path, "aws", &IngestOptions::default())
        .unwrap();

    let period = processor
        .ledger()
        .get_period_by_key("2025-01")
        .unwrap()
        .unwrap();
    processor.ledger().close_period(period.id, "admin").unwrap();

    // Imports into a closed period are refused wholesale
    let err = processor
        .ingest_file(&corrected_path, "aws", &IngestOptions::default())
        .unwrap_err();
    assert!(matches!(err, ChargebackError::PeriodNotOpen { .. }));
    let charges = processor
        .ledger()
        .charges_for_period(period.id, None)
        .unwrap();
    assert_eq!(charges[0].billed_cost, 10.0);
    assert_eq!(
        processor.ledger().imports_for_period(period.id).unwrap().len(),
        1
    );

    // Reopening requires a reason, after which the correction lands
    processor
        .ledger()
        .reopen_period(period.id, "admin", "late correction from provider")
        .unwrap();
    let report = processor
        .ingest_file(&corrected_path, "aws", &IngestOptions::default())
        .unwrap();
    assert_eq!(report.updated, 1);
    let charges = processor
        .ledger()
        .charges_for_period(period.id, None)
        .unwrap();
    assert_eq!(charges[0].billed_cost, 25.0);

    // Finalized is terminal
    processor.ledger().close_period(period.id, "admin").unwrap();
    processor.ledger().finalize_period(period.id, "admin").unwrap();
    let err = processor
        .ledger()
        .reopen_period(period.id, "admin", "one more fix")
        .unwrap_err();
    assert!(matches!(err, ChargebackError::InvalidPeriodTransition { .. }));
    let err = processor
        .ingest_file(&corrected_path, "aws", &IngestOptions::default())
        .unwrap_err();
    assert!(matches!(err, ChargebackError::PeriodNotOpen { .. }));
}

#[test]
fn test_capped_subsidy_over_fiscal_year() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let state_path = dir.path().join("subsidy_state.json");

    let mut config = ChargebackConfig::default();
    config.subsidies.push(provost_rule(500.0));

    let tags: &[(&str, &str)] = &[
        ("pi_email", "smith@example.edu"),
        ("project", "ai-strategy"),
        ("fund_org", "12345"),
    ];

    let months = [("2025-08-01", "aug"), ("2025-09-01", "sep"), ("2025-10-01", "oct")];
    let mut reports = Vec::new();
    for (start, name) in months {
        let mut csv = String::from(FOCUS_HEADER);
        csv.push_str(&focus_row(
            start,
            start,
            "",
            "200.00",
            "openai:tokens",
            "OpenAI",
            tags,
        ));
        let path = write_file(&dir, &format!("openai_{}.csv", name), &csv);
        // A fresh processor per run: the cap must survive through the state file
        let report = ingest_focus_file(
            &db_path,
            &state_path,
            config.clone(),
            &path,
            "openai",
            &IngestOptions::default(),
        )
        .unwrap();
        reports.push(report);
    }

    let subsidized: Vec<f64> = reports
        .iter()
        .map(|r| r.allocations[0].subsidized)
        .collect();
    let billable: Vec<f64> = reports.iter().map(|r| r.allocations[0].billable).collect();
    assert_eq!(subsidized, vec![200.0, 200.0, 100.0]);
    assert_eq!(billable, vec![0.0, 0.0, 100.0]);
    assert_eq!(reports[2].allocations[0].bucket.as_deref(), Some("FY2026"));
    assert_eq!(
        reports[2].allocations[0].funding_target.as_deref(),
        Some("provost-fund")
    );

    let state = SubsidyLedger::load(&state_path).unwrap();
    let usage = state
        .usage_for("ai-strategy", "FY2026", "provost_ai")
        .unwrap();
    assert_eq!(usage.used, 600.0);
    assert_eq!(usage.subsidized, 500.0);
    assert_eq!(usage.remaining, 0.0);

    // The ledger keeps the provider's gross amounts
    let processor = open_processor(&dir, ChargebackConfig::default());
    for key in ["2025-08", "2025-09", "2025-10"] {
        let period = processor.ledger().get_period_by_key(key).unwrap().unwrap();
        let charges = processor
            .ledger()
            .charges_for_period(period.id, None)
            .unwrap();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].billed_cost, 200.0);
    }
}

#[test]
fn test_dry_run_rehearses_without_committing() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("subsidy_state.json");

    let mut config = review_config();
    config.subsidies.push(provost_rule(500.0));

    let mut csv = String::from(FOCUS_HEADER);
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "300.00",
        "openai:tokens",
        "OpenAI",
        &[
            ("pi_email", "smith@example.edu"),
            ("project", "ai-strategy"),
            ("fund_org", "12345"),
        ],
    ));
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "10.00",
        "res-x",
        "Amazon EC2",
        &[("pi_email", "smith@example.edu"), ("fund_org", "12345")],
    ));
    let csv_path = write_file(&dir, "jan.csv", &csv);

    let mut processor = open_processor(&dir, config);
    let dry = IngestOptions {
        dry_run: true,
        expected_period: None,
    };

    let report = processor.ingest_file(&csv_path, "mix", &dry).unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.flagged_rows, 1);
    assert_eq!(report.allocations.len(), 1);
    assert_eq!(report.allocations[0].subsidized, 300.0);

    // Nothing committed anywhere
    assert!(processor.ledger().list_periods().unwrap().is_empty());
    assert!(processor.ledger().get_source_by_name("mix").unwrap().is_none());
    assert!(!state_path.exists());
    assert!(processor.subsidy_state().projects.is_empty());

    // The real run starts from a clean slate
    let report = processor
        .ingest_file(&csv_path, "mix", &IngestOptions::default())
        .unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.allocations[0].subsidized, 300.0);
    assert!(state_path.exists());
    assert_eq!(processor.ledger().list_periods().unwrap().len(), 1);
}

#[test]
fn test_multi_period_file_with_expected_period() {
    let dir = TempDir::new().unwrap();
    let tags: &[(&str, &str)] = &[
        ("pi_email", "smith@example.edu"),
        ("project", "genomics-1"),
        ("fund_org", "12345"),
    ];

    let mut csv = String::from(FOCUS_HEADER);
    csv.push_str(&focus_row("2025-01-01", "2025-01-03", "", "10.00", "res-1", "Amazon EC2", tags));
    csv.push_str(&focus_row("2025-01-01", "2025-01-20", "", "15.00", "res-2", "Amazon EC2", tags));
    csv.push_str(&focus_row("2025-02-01", "2025-02-02", "", "20.00", "res-3", "Amazon EC2", tags));
    let csv_path = write_file(&dir, "aws_jan.csv", &csv);

    let mut processor = open_processor(&dir, ChargebackConfig::default());
    let options = IngestOptions {
        dry_run: false,
        expected_period: Some("2025-01".to_string()),
    };
    let report = processor.ingest_file(&csv_path, "aws", &options).unwrap();

    assert_eq!(report.periods.len(), 2);
    assert_eq!(report.periods[0].period_key, "2025-01");
    assert_eq!(report.periods[0].rows, 2);
    assert_eq!(report.periods[0].flagged_rows, 0);
    assert_eq!(report.periods[1].period_key, "2025-02");
    assert_eq!(report.periods[1].flagged_rows, 1);
    assert_eq!(report.flagged_rows, 1);

    let ledger = processor.ledger();
    assert_eq!(ledger.list_periods().unwrap().len(), 2);

    // The stray row was imported into its own period, flagged rather than lost
    let feb = ledger.get_period_by_key("2025-02").unwrap().unwrap();
    let charges = ledger.charges_for_period(feb.id, None).unwrap();
    assert_eq!(charges.len(), 1);
    assert!(charges[0].needs_review);
    assert_eq!(charges[0].review_reason.as_deref(), Some(PERIOD_MISMATCH));

    // One import record per period batch, same filename
    let jan = ledger.get_period_by_key("2025-01").unwrap().unwrap();
    let jan_imports = ledger.imports_for_period(jan.id).unwrap();
    let feb_imports = ledger.imports_for_period(feb.id).unwrap();
    assert_eq!(jan_imports.len(), 1);
    assert_eq!(feb_imports.len(), 1);
    assert_eq!(jan_imports[0].filename, "aws_jan.csv");
    assert_eq!(feb_imports[0].filename, "aws_jan.csv");
    assert_eq!(jan_imports[0].row_count, 2);
    assert_eq!(feb_imports[0].row_count, 1);
}

#[test]
fn test_row_failures_are_isolated() {
    let dir = TempDir::new().unwrap();
    let good_tags: &[(&str, &str)] = &[
        ("pi_email", "smith@example.edu"),
        ("project", "genomics-1"),
        ("fund_org", "12345"),
    ];

    let mut csv = String::from(FOCUS_HEADER);
    csv.push_str(&focus_row("", "2025-01-03", "", "10.00", "res-1", "Amazon EC2", good_tags));
    csv.push_str(&focus_row("not-a-date", "2025-01-03", "", "10.00", "res-2", "Amazon EC2", good_tags));
    csv.push_str(&focus_row(
        "2025-01-01",
        "2025-01-03",
        "",
        "10.00",
        "res-3",
        "Amazon EC2",
        &[("project", "genomics-1"), ("fund_org", "12345")],
    ));
    csv.push_str(&focus_row("2025-01-01", "2025-01-03", "", "10.00", "res-4", "Amazon EC2", good_tags));
    let csv_path = write_file(&dir, "jan.csv", &csv);

    let mut processor = open_processor(&dir, ChargebackConfig::default());
    let report = processor
        .ingest_file(&csv_path, "aws", &IngestOptions::default())
        .unwrap();

    assert_eq!(
        report.errors,
        vec![
            "Line 2: Missing BillingPeriodStart",
            "Line 3: Invalid BillingPeriodStart format",
            "Line 4: Missing pi_email tag",
        ]
    );
    assert_eq!(report.total_rows, 1);
    assert_eq!(report.inserted, 1);

    let ledger = processor.ledger();
    let period = ledger.get_period_by_key("2025-01").unwrap().unwrap();
    let charges = ledger.charges_for_period(period.id, None).unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].resource_id.as_deref(), Some("res-4"));

    let source = ledger.get_source_by_name("aws").unwrap().unwrap();
    assert_eq!(source.last_sync_status.as_deref(), Some("error"));
    assert_eq!(source.last_sync_message.as_deref(), Some("3 errors"));
}

#[test]
fn test_config_round_trip_and_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chargeback.json");

    let mut config = ChargebackConfig::default();
    config.tags.reference_1 = Some("award_number".to_string());
    config.review.flag_patterns = vec!["gpu".to_string()];
    config.subsidies.push(provost_rule(500.0));

    config.to_file(&path).unwrap();
    let reloaded = ChargebackConfig::from_file(&path).unwrap();
    assert_eq!(reloaded.tags, config.tags);
    assert_eq!(reloaded.review, config.review);
    assert_eq!(reloaded.subsidies, config.subsidies);

    // Duplicate rule names are rejected at load time
    let mut bad = config.clone();
    bad.subsidies.push(provost_rule(100.0));
    bad.to_file(&path).unwrap();
    assert!(ChargebackConfig::from_file(&path).is_err());
}

#[test]
fn test_schema_generation() {
    let schema_json = ChargebackConfig::schema_as_json().unwrap();

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("schema_output.json"), schema_json.as_bytes()).unwrap();

    assert!(schema_json.contains("flag_patterns"));
    assert!(schema_json.contains("fund_org_patterns"));
    assert!(schema_json.contains("cap_amount"));
    assert!(schema_json.contains("period_basis"));
    assert!(schema_json.contains("applicable_services"));
    assert!(schema_json.contains("pi_email"));

    println!("✓ Schema generation test passed");
}
