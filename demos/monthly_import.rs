use cloud_chargeback::{
    ChargebackConfig, ChargebackProcessor, IngestOptions, PeriodBasis, SubsidyRule,
    SubsidyRuleType,
};
use std::fs;

const SAMPLE_CSV: &str = r#"BillingPeriodStart,BillingPeriodEnd,ChargePeriodStart,ListCost,BilledCost,ResourceId,ResourceName,ServiceName,Tags
2025-03-01,,2025-03-04,550.00,412.50,i-0a1b2c,train-box-1,Amazon EC2,"{""pi_email"": ""smith@example.edu"", ""project"": ""research-alpha"", ""fund_org"": ""12345""}"
2025-03-01,,2025-03-09,,87.25,bucket-ra-data,,Amazon S3,"{""pi_email"": ""smith@example.edu"", ""project"": ""research-alpha"", ""fund_org"": ""12345""}"
2025-03-01,,2025-03-15,,620.00,openai:gpt-tokens,,OpenAI,"{""pi_email"": ""jones@example.edu"", ""project"": ""ai-pilot"", ""fund_org"": ""23456""}"
2025-03-01,,2025-03-20,,45.00,i-9z8y7x,scratch-vm,Amazon EC2,"{""pi_email"": ""jones@example.edu"", ""fund_org"": ""23456""}"
"#;

fn main() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let csv_path = dir.path().join("aws_2025-03.csv");
    fs::write(&csv_path, SAMPLE_CSV)?;

    let mut config = ChargebackConfig::default();
    config.review.fund_org_patterns = vec![r"^\d{5}$".to_string()];
    config.subsidies.push(SubsidyRule {
        name: "provost_ai".to_string(),
        description: "Provost covers the first $500 of AI usage per project".to_string(),
        funding_target: "provost-fund".to_string(),
        rule_type: SubsidyRuleType::PerProjectCap,
        cap_amount: 500.0,
        period_basis: PeriodBasis::FiscalYear,
        fiscal_start: "07-01".to_string(),
        applicable_services: vec!["OpenAI".to_string()],
        enabled: true,
    });

    let mut processor = ChargebackProcessor::open(
        &dir.path().join("ledger.db"),
        &dir.path().join("subsidy_state.json"),
        config,
    )?;

    let options = IngestOptions {
        dry_run: true,
        expected_period: Some("2025-03".to_string()),
    };
    let dry = processor.ingest_file(&csv_path, "aws-focus", &options)?;
    println!(
        "Dry run: {} rows totalling ${:.2}, {} flagged for review, {} subsidy split(s)",
        dry.total_rows,
        dry.total_cost,
        dry.flagged_rows,
        dry.allocations.len()
    );

    let options = IngestOptions {
        dry_run: false,
        expected_period: Some("2025-03".to_string()),
    };
    let report = processor.ingest_file(&csv_path, "aws-focus", &options)?;
    println!(
        "Imported: {} inserted, {} updated, {} skipped",
        report.inserted, report.updated, report.skipped
    );
    for allocation in &report.allocations {
        println!(
            "  {} covers ${:.2} of {} ({}), leaving ${:.2} billable",
            allocation.rule.as_deref().unwrap_or("?"),
            allocation.subsidized,
            allocation.project_id.as_deref().unwrap_or("?"),
            allocation.bucket.as_deref().unwrap_or("?"),
            allocation.billable
        );
    }

    println!("\nClean rollup (flagged charges excluded):");
    let rollup = processor.rollup_for_period("2025-03", false)?;
    for (pi_email, person) in &rollup {
        println!(
            "  {} owes ${:.2} across {} project(s)",
            pi_email,
            person.total_cost(),
            person.project_count()
        );
        for (project, summary) in &person.projects {
            println!(
                "    {}: ${:.2} (fund/org {})",
                project,
                summary.total_cost,
                summary.fund_org.as_deref().unwrap_or("?")
            );
        }
    }

    let period = processor
        .ledger()
        .get_period_by_key("2025-03")?
        .expect("period exists after import");
    let stats = processor.ledger().period_stats(period.id)?;
    println!(
        "\nPeriod {} is {}: {} charges, ${:.2} total, {} awaiting review",
        period.period_key, period.status, stats.charge_count, stats.total_cost, stats.flagged_count
    );

    Ok(())
}
