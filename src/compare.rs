use crate::cases::parse_iso_date;
use crate::models::{
    DisplayValue, ExecutionResult, FieldComparison, ParsedRecord, TestCase, TestComparison,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Largest currency difference still counted as a match
pub const DECIMAL_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// How a field is canonicalized, compared and displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Decimal,
    Text,
    Tags,
    Date,
}

/// Normalized value used only for equality
#[derive(Debug, Clone, PartialEq)]
enum Canonical {
    Decimal(Decimal),
    Text(String),
    Tags(Vec<String>),
    Date(NaiveDate),
}

struct KindOps {
    canonicalize: fn(&Value) -> Option<Canonical>,
    /// Match rule when the case makes no assertion
    unasserted: fn(Option<&Canonical>) -> bool,
    equals: fn(&Canonical, &Canonical) -> bool,
    display: fn(&Value) -> Option<DisplayValue>,
}

const DECIMAL_OPS: KindOps = KindOps {
    canonicalize: canonical_decimal,
    unasserted: actual_absent,
    equals: decimal_within_tolerance,
    display: display_decimal,
};

const TEXT_OPS: KindOps = KindOps {
    canonicalize: canonical_text,
    unasserted: actual_absent,
    equals: exact,
    display: display_text,
};

const TAGS_OPS: KindOps = KindOps {
    canonicalize: canonical_tags,
    unasserted: actual_absent_or_empty,
    equals: exact,
    display: display_tags,
};

const DATE_OPS: KindOps = KindOps {
    canonicalize: canonical_date,
    unasserted: actual_absent,
    equals: exact,
    display: display_date,
};

impl FieldKind {
    fn ops(self) -> &'static KindOps {
        match self {
            FieldKind::Decimal => &DECIMAL_OPS,
            FieldKind::Text => &TEXT_OPS,
            FieldKind::Tags => &TAGS_OPS,
            FieldKind::Date => &DATE_OPS,
        }
    }
}

/// A compared field: its parser key, report label, kind and value accessors
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    expected: fn(&TestCase) -> Option<Value>,
    actual: fn(&ParsedRecord) -> Option<Value>,
}

/// Compared fields in report order
pub static FIELDS: [FieldSpec; 9] = [
    FieldSpec {
        name: "amountUsd",
        label: "Amount",
        kind: FieldKind::Decimal,
        expected: |case| case.expected_amount.map(decimal_value),
        actual: |record| record_value(record, "amountUsd"),
    },
    FieldSpec {
        name: "merchant",
        label: "Merchant",
        kind: FieldKind::Text,
        expected: |case| case.expected_merchant.clone().map(Value::String),
        actual: |record| record_value(record, "merchant"),
    },
    FieldSpec {
        name: "description",
        label: "Description",
        kind: FieldKind::Text,
        expected: |case| case.expected_description.clone().map(Value::String),
        actual: |record| record_value(record, "description"),
    },
    FieldSpec {
        name: "type",
        label: "Type",
        kind: FieldKind::Text,
        expected: |case| case.expected_type.clone().map(Value::String),
        actual: |record| record_value(record, "type"),
    },
    FieldSpec {
        name: "category",
        label: "Category",
        kind: FieldKind::Text,
        expected: |case| case.expected_category.clone().map(Value::String),
        actual: actual_category,
    },
    FieldSpec {
        name: "tags",
        label: "Tags",
        kind: FieldKind::Tags,
        expected: |case| {
            case.expected_tags
                .as_ref()
                .map(|tags| Value::Array(tags.iter().cloned().map(Value::String).collect()))
        },
        actual: |record| record_value(record, "tags"),
    },
    FieldSpec {
        name: "userLocalDate",
        label: "Date",
        kind: FieldKind::Date,
        expected: |case| {
            case.expected_date
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
        },
        actual: |record| record_value(record, "userLocalDate"),
    },
    FieldSpec {
        name: "account",
        label: "Account",
        kind: FieldKind::Text,
        expected: |case| case.expected_account.clone().map(Value::String),
        actual: |record| record_value(record, "account"),
    },
    FieldSpec {
        name: "splitOverallChargedUsd",
        label: "Split Overall",
        kind: FieldKind::Decimal,
        expected: |case| case.expected_split_overall.map(decimal_value),
        actual: |record| record_value(record, "splitOverallChargedUsd"),
    },
];

/// Compare every execution against its case's expectations
pub fn compare_results(executions: Vec<ExecutionResult>) -> Vec<TestComparison> {
    executions.into_iter().map(compare_execution).collect()
}

/// Compare one execution; a non-complete execution never passes
pub fn compare_execution(execution: ExecutionResult) -> TestComparison {
    let fields: Vec<FieldComparison> = FIELDS
        .iter()
        .map(|spec| compare_field(spec, &execution.case, execution.parsed.as_ref()))
        .collect();

    let overall_match = execution.status.is_complete()
        && fields.iter().filter(|f| f.is_asserted()).all(|f| f.matched);

    TestComparison {
        execution,
        fields,
        overall_match,
    }
}

/// Compare one field of one case
pub fn compare_field(
    spec: &FieldSpec,
    case: &TestCase,
    parsed: Option<&ParsedRecord>,
) -> FieldComparison {
    let ops = spec.kind.ops();
    let expected_raw = (spec.expected)(case).filter(|v| !v.is_null());
    let actual_raw = parsed.and_then(spec.actual).filter(|v| !v.is_null());

    let expected = expected_raw.as_ref().and_then(ops.canonicalize);
    let actual = actual_raw.as_ref().and_then(ops.canonicalize);

    let matched = match (&expected, &actual) {
        (None, actual) => (ops.unasserted)(actual.as_ref()),
        (Some(_), None) => false,
        (Some(e), Some(a)) => (ops.equals)(e, a),
    };

    FieldComparison {
        field: spec.name,
        expected: expected
            .as_ref()
            .and(expected_raw.as_ref())
            .and_then(ops.display),
        actual: actual_raw.as_ref().and_then(ops.display),
        matched,
    }
}

fn record_value(record: &ParsedRecord, key: &str) -> Option<Value> {
    record.get(key).cloned()
}

/// The parser files categories by transaction type; either slot counts
fn actual_category(record: &ParsedRecord) -> Option<Value> {
    ["expenseCategory", "incomeCategory"]
        .into_iter()
        .filter_map(|key| record.get(key))
        .find(|value| value_text(value).is_some_and(|t| !t.trim().is_empty()))
        .cloned()
}

fn decimal_value(amount: Decimal) -> Value {
    Value::String(amount.to_string())
}

/// Text form of a scalar JSON value
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn trimmed_text(value: &Value) -> Option<String> {
    value_text(value)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_decimal_text(text: &str) -> Option<Decimal> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn coerce_tags(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(items.iter().filter_map(trimmed_text).collect()),
        scalar => Some(trimmed_text(scalar).into_iter().collect()),
    }
}

fn canonical_decimal(value: &Value) -> Option<Canonical> {
    let amount = match value {
        Value::Number(n) => parse_decimal_text(&n.to_string()),
        Value::String(s) => parse_decimal_text(s),
        _ => None,
    };
    amount.map(Canonical::Decimal)
}

fn canonical_text(value: &Value) -> Option<Canonical> {
    trimmed_text(value).map(|t| Canonical::Text(caseless::default_case_fold_str(&t)))
}

fn canonical_tags(value: &Value) -> Option<Canonical> {
    coerce_tags(value).map(|tags| {
        let mut folded: Vec<String> = tags
            .iter()
            .map(|t| caseless::default_case_fold_str(t))
            .collect();
        folded.sort();
        Canonical::Tags(folded)
    })
}

fn canonical_date(value: &Value) -> Option<Canonical> {
    value
        .as_str()
        .and_then(|s| parse_iso_date(s.trim()))
        .map(Canonical::Date)
}

fn actual_absent(actual: Option<&Canonical>) -> bool {
    actual.is_none()
}

fn actual_absent_or_empty(actual: Option<&Canonical>) -> bool {
    match actual {
        None => true,
        Some(Canonical::Tags(tags)) => tags.is_empty(),
        Some(_) => false,
    }
}

fn exact(expected: &Canonical, actual: &Canonical) -> bool {
    expected == actual
}

fn decimal_within_tolerance(expected: &Canonical, actual: &Canonical) -> bool {
    match (expected, actual) {
        (Canonical::Decimal(e), Canonical::Decimal(a)) => a
            .checked_sub(*e)
            .is_some_and(|diff| diff.abs() <= DECIMAL_TOLERANCE),
        _ => false,
    }
}

fn display_decimal(value: &Value) -> Option<DisplayValue> {
    match canonical_decimal(value) {
        Some(Canonical::Decimal(amount)) => Some(DisplayValue::Text(amount.to_string())),
        _ => value_text(value).map(DisplayValue::Text),
    }
}

fn display_date(value: &Value) -> Option<DisplayValue> {
    match canonical_date(value) {
        Some(Canonical::Date(date)) => {
            Some(DisplayValue::Text(date.format("%Y-%m-%d").to_string()))
        }
        _ => value_text(value).map(DisplayValue::Text),
    }
}

fn display_tags(value: &Value) -> Option<DisplayValue> {
    Some(DisplayValue::List(coerce_tags(value).unwrap_or_default()))
}

fn display_text(value: &Value) -> Option<DisplayValue> {
    value_text(value).map(DisplayValue::Text)
}
