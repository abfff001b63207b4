use crate::compare::FIELDS;
use crate::models::{EvaluationMetrics, TestComparison};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Aggregate comparisons into run-level metrics
pub fn compute_metrics(comparisons: &[TestComparison]) -> EvaluationMetrics {
    let total_tests = comparisons.len();
    let passed_tests = comparisons.iter().filter(|c| c.overall_match).count();

    // (matches, samples) per field; every compared field gets an entry
    let mut counts: BTreeMap<String, (usize, usize)> = FIELDS
        .iter()
        .map(|spec| (spec.name.to_string(), (0, 0)))
        .collect();

    for comparison in comparisons {
        for field in comparison.fields.iter().filter(|f| f.is_asserted()) {
            let bucket = counts.entry(field.field.to_string()).or_default();
            bucket.1 += 1;
            if field.matched {
                bucket.0 += 1;
            }
        }
    }

    let per_field_accuracy = counts
        .iter()
        .map(|(field, &(matches, samples))| {
            let accuracy = (samples > 0).then(|| matches as f64 / samples as f64);
            (field.clone(), accuracy)
        })
        .collect();
    let field_samples = counts
        .into_iter()
        .map(|(field, (_, samples))| (field, samples))
        .collect();

    let overall_accuracy = (total_tests > 0).then(|| passed_tests as f64 / total_tests as f64);
    let ai_usage_count = comparisons
        .iter()
        .filter(|c| c.execution.ai_calls() > 0)
        .count();
    let total_ai_calls = comparisons.iter().map(|c| c.execution.ai_calls()).sum();

    EvaluationMetrics {
        total_tests,
        passed_tests,
        per_field_accuracy,
        overall_accuracy,
        ai_usage_count,
        total_ai_calls,
        field_samples,
        average_total_ms: mean_stat(comparisons, "total_ms"),
        average_stage0_ms: mean_stat(comparisons, "stage0_ms"),
        average_stage1_ms: mean_stat(comparisons, "stage1_ms"),
    }
}

/// Mean of a numeric stats key over the cases that report it
fn mean_stat(comparisons: &[TestComparison], key: &str) -> Option<f64> {
    let values: Vec<f64> = comparisons
        .iter()
        .filter_map(|c| numeric_stat(&c.execution.stats, key))
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn numeric_stat(stats: &Map<String, Value>, key: &str) -> Option<f64> {
    match stats.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::compare_execution;
    use crate::models::{ExecutionResult, ExecutionStatus, PromptExchange, TestCase};
    use rust_decimal::Decimal;
    use serde_json::json;

    fn comparison(
        id: &str,
        amount: Option<Decimal>,
        parsed: Value,
        stats: Value,
        responses: &[&str],
    ) -> TestComparison {
        let mut case = TestCase::new(id, "coffee");
        case.expected_amount = amount;
        compare_execution(ExecutionResult {
            case,
            status: ExecutionStatus::Complete,
            parsed: parsed.as_object().cloned(),
            method: None,
            prompts: responses
                .iter()
                .map(|r| PromptExchange {
                    field: "merchant".to_string(),
                    prompt: "Which merchant?".to_string(),
                    response: Some(r.to_string()),
                })
                .collect(),
            stats: stats.as_object().cloned().unwrap_or_default(),
            heuristic_results: None,
            heuristic_stats: None,
            errors: vec![],
        })
    }

    #[test]
    fn test_metrics_for_empty_run() {
        let metrics = compute_metrics(&[]);
        assert_eq!(metrics.total_tests, 0);
        assert_eq!(metrics.overall_accuracy, None);
        assert_eq!(metrics.average_total_ms, None);
        assert_eq!(metrics.per_field_accuracy.len(), FIELDS.len());
        assert!(metrics.per_field_accuracy.values().all(Option::is_none));
        assert!(metrics.field_samples.values().all(|&s| s == 0));
    }

    #[test]
    fn test_metrics_accuracy_and_samples() {
        let comparisons = vec![
            comparison(
                "T1",
                Some(Decimal::new(450, 2)),
                json!({"amountUsd": "4.50"}),
                json!({"total_ms": 10, "stage0_ms": 10}),
                &[],
            ),
            comparison(
                "T2",
                Some(Decimal::new(1200, 0)),
                json!({"amountUsd": "12.00"}),
                json!({"total_ms": 30.0, "stage0_ms": 5, "stage1_ms": 25}),
                &["Starbucks", ""],
            ),
            comparison("T3", None, json!({}), json!({"total_ms": "fast"}), &[]),
        ];

        let metrics = compute_metrics(&comparisons);

        assert_eq!(metrics.total_tests, 3);
        assert_eq!(metrics.passed_tests, 2);
        assert_eq!(metrics.failed_tests(), 1);
        assert_eq!(metrics.overall_accuracy, Some(2.0 / 3.0));
        assert_eq!(metrics.per_field_accuracy["amountUsd"], Some(0.5));
        assert_eq!(metrics.field_samples["amountUsd"], 2);
        assert_eq!(metrics.per_field_accuracy["merchant"], None);
        assert_eq!(metrics.field_samples["merchant"], 0);
        assert_eq!(metrics.ai_usage_count, 1);
        assert_eq!(metrics.total_ai_calls, 1);
        assert_eq!(metrics.average_total_ms, Some(20.0));
        assert_eq!(metrics.average_stage0_ms, Some(7.5));
        assert_eq!(metrics.average_stage1_ms, Some(25.0));
    }

    #[test]
    fn test_failed_execution_counts_asserted_fields() {
        let mut case = TestCase::new("T1", "coffee");
        case.expected_merchant = Some("Starbucks".to_string());
        let failed = compare_execution(ExecutionResult {
            case,
            status: ExecutionStatus::CliError,
            parsed: None,
            method: None,
            prompts: vec![],
            stats: Map::new(),
            heuristic_results: None,
            heuristic_stats: None,
            errors: vec!["CLI error (stage1): parser exited with code 1".to_string()],
        });

        let metrics = compute_metrics(&[failed]);
        assert_eq!(metrics.passed_tests, 0);
        assert_eq!(metrics.overall_accuracy, Some(0.0));
        assert_eq!(metrics.per_field_accuracy["merchant"], Some(0.0));
        assert_eq!(metrics.field_samples["merchant"], 1);
    }
}
