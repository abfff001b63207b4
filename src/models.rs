use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Structured record produced by the parser, kept as the raw JSON object
pub type ParsedRecord = Map<String, Value>;

/// One hand-labeled expectation row
///
/// `None` on any expected field means the row makes no assertion about it.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub identifier: String,
    pub utterance: String,
    pub expected_amount: Option<Decimal>,
    pub expected_merchant: Option<String>,
    pub expected_description: Option<String>,
    pub expected_type: Option<String>,
    pub expected_category: Option<String>,
    pub expected_tags: Option<Vec<String>>,
    pub expected_date: Option<NaiveDate>,
    pub expected_account: Option<String>,
    pub expected_split_overall: Option<Decimal>,
}

impl TestCase {
    /// Case with only the required columns filled in
    pub fn new(identifier: impl Into<String>, utterance: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            utterance: utterance.into(),
            expected_amount: None,
            expected_merchant: None,
            expected_description: None,
            expected_type: None,
            expected_category: None,
            expected_tags: None,
            expected_date: None,
            expected_account: None,
            expected_split_overall: None,
        }
    }
}

/// A single field-disambiguation round with the text-generation model
#[derive(Debug, Clone, PartialEq)]
pub struct PromptExchange {
    /// Field the parser asked help with
    pub field: String,
    /// Prompt text rendered by the parser
    pub prompt: String,
    /// Model output, absent until generated or when generation failed
    pub response: Option<String>,
}

/// Terminal state of one case after the protocol exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Complete,
    CliError,
    ModelError,
    /// Parser finished on a status other than `complete`, e.g. a second `needs_ai`
    Unresolved { reported: String },
}

impl ExecutionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, ExecutionStatus::Complete)
    }

    pub fn label(&self) -> &str {
        match self {
            ExecutionStatus::Complete => "complete",
            ExecutionStatus::CliError => "cli_error",
            ExecutionStatus::ModelError => "model_error",
            ExecutionStatus::Unresolved { reported } => reported,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of running one case through the parser protocol
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub case: TestCase,
    pub status: ExecutionStatus,
    /// Final record; always `None` unless `status` is `Complete`
    pub parsed: Option<ParsedRecord>,
    /// Resolution method reported by the parser
    pub method: Option<String>,
    pub prompts: Vec<PromptExchange>,
    /// Timings and counters from the final parser response
    pub stats: Map<String, Value>,
    /// Heuristic snapshot from the first invocation, kept for diagnostics
    pub heuristic_results: Option<Map<String, Value>>,
    /// Stats from the first invocation
    pub heuristic_stats: Option<Map<String, Value>>,
    pub errors: Vec<String>,
}

impl ExecutionResult {
    /// Number of prompt exchanges that received a non-empty model response
    pub fn ai_calls(&self) -> usize {
        self.prompts
            .iter()
            .filter(|p| p.response.as_deref().is_some_and(|r| !r.is_empty()))
            .count()
    }
}

/// Display form of a compared value
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayValue {
    Text(String),
    List(Vec<String>),
}

/// Comparison of one field of one case
#[derive(Debug, Clone, PartialEq)]
pub struct FieldComparison {
    /// Parser-side field name, e.g. `amountUsd`
    pub field: &'static str,
    pub expected: Option<DisplayValue>,
    pub actual: Option<DisplayValue>,
    pub matched: bool,
}

impl FieldComparison {
    /// Whether the case made an assertion about this field
    pub fn is_asserted(&self) -> bool {
        self.expected.is_some()
    }
}

/// One execution paired with its field comparisons
#[derive(Debug, Clone)]
pub struct TestComparison {
    pub execution: ExecutionResult,
    pub fields: Vec<FieldComparison>,
    pub overall_match: bool,
}

/// Aggregate accuracy and latency figures for a run
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationMetrics {
    pub total_tests: usize,
    pub passed_tests: usize,
    /// matches / samples per field, `None` when no case asserted the field
    pub per_field_accuracy: BTreeMap<String, Option<f64>>,
    /// `None` when there were no cases
    pub overall_accuracy: Option<f64>,
    /// Cases that got at least one model response
    pub ai_usage_count: usize,
    pub total_ai_calls: usize,
    pub field_samples: BTreeMap<String, usize>,
    pub average_total_ms: Option<f64>,
    pub average_stage0_ms: Option<f64>,
    pub average_stage1_ms: Option<f64>,
}

impl EvaluationMetrics {
    pub fn failed_tests(&self) -> usize {
        self.total_tests - self.passed_tests
    }

    /// Share of cases that used the model, `None` when there were no cases
    pub fn ai_usage_rate(&self) -> Option<f64> {
        if self.total_tests == 0 {
            None
        } else {
            Some(self.ai_usage_count as f64 / self.total_tests as f64)
        }
    }
}

/// What a finished run prints on stdout
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub model: String,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub results_path: String,
    pub summary_path: String,
    pub failing_ids: Vec<String>,
}
