use crate::models::TestCase;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::warn;

/// Load test cases from a pipe-delimited markdown table
///
/// The first table line is the header. Rows missing an identifier or an utterance,
/// rows with fewer cells than the header and repeated identifiers are skipped with
/// a warning; divider rows are skipped silently.
pub fn parse_test_cases(content: &str) -> Vec<TestCase> {
    let mut header: Option<Vec<String>> = None;
    let mut cases = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if !line.starts_with('|') {
            continue;
        }

        let cells = split_cells(line);
        let Some(columns) = header.as_ref() else {
            header = Some(cells.iter().map(|c| normalize_header(c)).collect());
            continue;
        };

        if is_divider_row(&cells) {
            continue;
        }
        if cells.len() < columns.len() {
            warn!(
                "Skipping malformed row {}: expected {} cells, got {}",
                line_number,
                columns.len(),
                cells.len()
            );
            continue;
        }

        let row: HashMap<&str, &str> = columns
            .iter()
            .map(String::as_str)
            .zip(cells.iter().map(String::as_str))
            .collect();

        let Some(case) = build_test_case(&row, line_number) else {
            continue;
        };
        if !seen.insert(case.identifier.clone()) {
            warn!(
                "Skipping row {}: duplicate test ID '{}'",
                line_number, case.identifier
            );
            continue;
        }
        cases.push(case);
    }

    cases
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Lower-case a header cell and collapse whitespace runs to underscores
fn normalize_header(cell: &str) -> String {
    cell.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

fn is_divider_row(cells: &[String]) -> bool {
    cells
        .iter()
        .all(|cell| cell.chars().all(|c| c == '-' || c == ':'))
}

fn build_test_case(row: &HashMap<&str, &str>, line_number: usize) -> Option<TestCase> {
    let cell = |key: &str| row.get(key).copied();

    let identifier = cell("id").map(str::trim).unwrap_or_default();
    let utterance = cell("input")
        .or_else(|| cell("utterance"))
        .map(str::trim)
        .unwrap_or_default();
    if identifier.is_empty() || utterance.is_empty() {
        warn!(
            "Skipping row {}: missing required 'ID' or 'Input' column",
            line_number
        );
        return None;
    }

    Some(TestCase {
        expected_amount: parse_decimal(cell("amount"), line_number),
        expected_merchant: normalize_text(cell("merchant")),
        expected_description: normalize_text(cell("description")),
        expected_type: normalize_text(cell("type")),
        expected_category: normalize_text(cell("category")),
        expected_tags: parse_tags(cell("tags")),
        expected_date: parse_date(cell("date"), line_number),
        expected_account: normalize_text(cell("account")),
        expected_split_overall: parse_decimal(cell("split_overall"), line_number),
        ..TestCase::new(identifier, utterance)
    })
}

fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn parse_decimal(value: Option<&str>, line_number: usize) -> Option<Decimal> {
    let text = normalize_text(value)?;
    match Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text)) {
        Ok(amount) => Some(amount),
        Err(_) => {
            warn!("Row {}: invalid decimal value '{}'", line_number, text);
            None
        }
    }
}

fn parse_date(value: Option<&str>, line_number: usize) -> Option<NaiveDate> {
    let text = normalize_text(value)?;
    match parse_iso_date(&text) {
        Some(date) => Some(date),
        None => {
            warn!("Row {}: invalid date value '{}'", line_number, text);
            None
        }
    }
}

/// Strict `YYYY-MM-DD` parsing
pub fn parse_iso_date(text: &str) -> Option<NaiveDate> {
    if text.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

fn parse_tags(value: Option<&str>) -> Option<Vec<String>> {
    let tags: Vec<String> = value?
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();
    if tags.is_empty() { None } else { Some(tags) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
# Parser test cases

| ID | Input | Amount | Merchant | Category | Tags | Date | Split Overall |
|----|-------|-------:|----------|----------|------|------|---------------|
| T1 | coffee $4.50 | 4.50 | Starbucks | Dining | coffee, Morning | 2025-01-15 | |
| T2 | paid rent | 1200 | | Housing | | | 0 |
| | no id here | 1 | | | | | |
| T3 | short row |
| T4 | bad values | abc | | | , , | 2025-13-40 | |
"#;

    #[test]
    fn test_parse_valid_rows() {
        let cases = parse_test_cases(TABLE);
        let ids: Vec<&str> = cases.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2", "T4"]);

        let first = &cases[0];
        assert_eq!(first.utterance, "coffee $4.50");
        assert_eq!(first.expected_amount, Some(Decimal::new(450, 2)));
        assert_eq!(first.expected_merchant.as_deref(), Some("Starbucks"));
        assert_eq!(first.expected_category.as_deref(), Some("Dining"));
        assert_eq!(
            first.expected_tags,
            Some(vec!["coffee".to_string(), "Morning".to_string()])
        );
        assert_eq!(first.expected_date, NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(first.expected_split_overall, None);
        assert_eq!(first.expected_description, None);
    }

    #[test]
    fn test_explicit_zero_is_an_assertion() {
        let cases = parse_test_cases(TABLE);
        assert_eq!(cases[1].expected_split_overall, Some(Decimal::ZERO));
        assert_eq!(cases[1].expected_tags, None);
    }

    #[test]
    fn test_invalid_cells_become_absent() {
        let cases = parse_test_cases(TABLE);
        let bad = &cases[2];
        assert_eq!(bad.identifier, "T4");
        assert_eq!(bad.expected_amount, None);
        assert_eq!(bad.expected_date, None);
        assert_eq!(bad.expected_tags, None);
    }

    #[test]
    fn test_header_normalization_and_utterance_alias() {
        let table = "|  id |  UTTERANCE | SPLIT   OVERALL |\n| :-: | --- | --- |\n| A | lunch | 12.5 |\n";
        let cases = parse_test_cases(table);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].utterance, "lunch");
        assert_eq!(cases[0].expected_split_overall, Some(Decimal::new(125, 1)));
    }

    #[test]
    fn test_duplicate_identifiers_keep_first() {
        let table = "| ID | Input |\n|---|---|\n| A | first |\n| A | second |\n";
        let cases = parse_test_cases(table);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].utterance, "first");
    }

    #[test]
    fn test_non_table_lines_ignored() {
        assert!(parse_test_cases("just prose\n\nmore prose").is_empty());
        assert!(parse_test_cases("| ID | Input |\n|---|---|\n").is_empty());
    }

    #[test]
    fn test_parse_iso_date_is_strict() {
        assert_eq!(parse_iso_date("2024-02-29"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(parse_iso_date("2024-2-9"), None);
        assert_eq!(parse_iso_date("2023-02-29"), None);
        assert_eq!(parse_iso_date("02/03/2024"), None);
    }
}
