use crate::compare::FIELDS;
use crate::models::{DisplayValue, EvaluationMetrics, FieldComparison, RunSummary, TestComparison};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use tracing::info;

/// Output format options for the run summary on stdout
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

const PLACEHOLDER: &str = "—";
const UNDEFINED: &str = "n/a";
const PASS: &str = "✅";
const FAIL: &str = "❌";

/// Write the detailed and summary reports into `dir`, returning their paths
pub fn write_reports(
    comparisons: &[TestComparison],
    metrics: &EvaluationMetrics,
    dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let results_path = dir.join(format!("{}_results.md", timestamp));
    let summary_path = dir.join(format!("{}_summary.md", timestamp));

    write_report(&results_path, &build_results_markdown(comparisons))?;
    write_report(&summary_path, &build_summary_markdown(metrics))?;

    Ok((results_path, summary_path))
}

fn write_report(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to: {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

/// Per-case table with one cell per compared field
pub fn build_results_markdown(comparisons: &[TestComparison]) -> String {
    let mut headers = vec!["Test", "Input", "Overall", "Method", "AI Calls"];
    headers.extend(FIELDS.iter().map(|spec| spec.label));
    headers.push("Errors");

    let mut lines = vec!["# Evaluation Results".to_string(), String::new()];
    lines.push(table_row(headers.iter().copied()));
    lines.push(table_row(headers.iter().map(|_| "---")));

    for comparison in comparisons {
        let execution = &comparison.execution;
        let mut row = vec![
            escape_markdown(&execution.case.identifier),
            escape_markdown(&execution.case.utterance),
            format_overall_cell(comparison),
            escape_markdown(execution.method.as_deref().unwrap_or(PLACEHOLDER)),
            execution.ai_calls().to_string(),
        ];
        for spec in FIELDS.iter() {
            let field = comparison.fields.iter().find(|f| f.field == spec.name);
            row.push(format_field_cell(field));
        }
        row.push(format_errors_cell(comparison));
        lines.push(table_row(row.iter().map(String::as_str)));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Run-level metric table followed by per-field accuracy
pub fn build_summary_markdown(metrics: &EvaluationMetrics) -> String {
    let tests_using_ai = match metrics.ai_usage_rate() {
        Some(rate) => format!("{} ({})", metrics.ai_usage_count, format_percent(Some(rate))),
        None => "0".to_string(),
    };

    let rows = [
        ("Total tests", metrics.total_tests.to_string()),
        ("Passed", metrics.passed_tests.to_string()),
        ("Failed", metrics.failed_tests().to_string()),
        ("Overall accuracy", format_percent(metrics.overall_accuracy)),
        ("Tests using AI", tests_using_ai),
        ("Total AI calls", metrics.total_ai_calls.to_string()),
        ("Avg total time", format_ms(metrics.average_total_ms)),
        ("Avg stage0 time", format_ms(metrics.average_stage0_ms)),
        ("Avg stage1 time", format_ms(metrics.average_stage1_ms)),
    ];

    let mut lines = vec![
        "# Evaluation Summary".to_string(),
        String::new(),
        "| Metric | Value |".to_string(),
        "| --- | --- |".to_string(),
    ];
    for (metric, value) in rows {
        lines.push(format!("| {} | {} |", metric, value));
    }

    lines.push(String::new());
    lines.push("## Per-field Accuracy".to_string());
    lines.push(String::new());
    lines.push("| Field | Accuracy | Samples |".to_string());
    lines.push("| --- | --- | --- |".to_string());
    for spec in FIELDS.iter() {
        let accuracy = metrics.per_field_accuracy.get(spec.name).copied().flatten();
        let samples = metrics.field_samples.get(spec.name).copied().unwrap_or(0);
        lines.push(format!(
            "| {} | {} | {} |",
            spec.label,
            format_percent(accuracy),
            samples
        ));
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Print the run summary on stdout
pub fn print_run_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print_plain(summary),
        OutputFormat::Json => print_json(summary),
    }
}

fn print_plain(summary: &RunSummary) {
    println!("Model: {}", summary.model);
    println!("Tests processed: {}", summary.total_tests);
    println!(
        "Passed: {} | Failed: {}",
        summary.passed_tests, summary.failed_tests
    );
    println!("Results written to: {}", summary.results_path);
    println!("Summary written to: {}", summary.summary_path);
    if !summary.failing_ids.is_empty() {
        println!("Failing test IDs: {}", summary.failing_ids.join(", "));
    }
}

fn print_json(summary: &RunSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing run summary to JSON: {}", e),
    }
}

fn table_row<'a>(cells: impl Iterator<Item = &'a str>) -> String {
    format!("| {} |", cells.collect::<Vec<_>>().join(" | "))
}

fn format_overall_cell(comparison: &TestComparison) -> String {
    let mark = if comparison.overall_match { PASS } else { FAIL };
    let status = &comparison.execution.status;
    if status.is_complete() {
        mark.to_string()
    } else {
        escape_markdown(&format!("{} ({})", mark, status))
    }
}

fn format_field_cell(field: Option<&FieldComparison>) -> String {
    let Some(field) = field else {
        return PLACEHOLDER.to_string();
    };

    let mark = if field.matched { PASS } else { FAIL };
    let actual = value_text(field.actual.as_ref());
    let expected = value_text(field.expected.as_ref());
    if expected == PLACEHOLDER {
        escape_markdown(&format!("{} {}", mark, actual))
    } else {
        escape_markdown(&format!("{} {} / {}", mark, actual, expected))
    }
}

fn format_errors_cell(comparison: &TestComparison) -> String {
    let execution = &comparison.execution;
    if !execution.errors.is_empty() {
        escape_markdown(&execution.errors.join("; "))
    } else if !execution.status.is_complete() {
        escape_markdown(execution.status.label())
    } else {
        PLACEHOLDER.to_string()
    }
}

/// Display text of a compared value; lists are sorted and comma-joined
fn value_text(value: Option<&DisplayValue>) -> String {
    match value {
        None => PLACEHOLDER.to_string(),
        Some(DisplayValue::Text(text)) => text.clone(),
        Some(DisplayValue::List(items)) if items.is_empty() => PLACEHOLDER.to_string(),
        Some(DisplayValue::List(items)) => {
            let mut sorted = items.clone();
            sorted.sort();
            sorted.join(", ")
        }
    }
}

fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(ratio) => format!("{:.1}%", ratio * 100.0),
        None => UNDEFINED.to_string(),
    }
}

fn format_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{:.1} ms", ms),
        None => UNDEFINED.to_string(),
    }
}

/// Escape pipes and newlines so text stays inside one table cell
pub fn escape_markdown(text: &str) -> String {
    let escaped = text
        .replace('|', "\\|")
        .replace("\r\n", "<br>")
        .replace('\n', "<br>");
    if escaped.is_empty() {
        PLACEHOLDER.to_string()
    } else {
        escaped
    }
}
