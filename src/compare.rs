//! Structural output comparison.
//!
//! All structured comparisons are asymmetric containment checks: the expected
//! document must be found within the actual output, which may carry extra
//! keys, rows or elements. One generic primitive over `serde_json::Value`
//! backs the JSON and YAML adapters; CSV and tabular output get thin adapters
//! of their own. Every mismatch message ends with a unified diff, and diffing
//! never changes the comparison outcome.

use regex::Regex;
use serde_json::Value;
use similar::TextDiff;
use std::sync::OnceLock;

/// Plain-text comparison modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringAction {
    /// Exact match after trailing newlines are trimmed from the output.
    Be,
    /// Substring present.
    Contain,
    /// Substring absent.
    NotContain,
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap())
}

/// Remove ANSI escape sequences.
pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").into_owned()
}

/// Compare captured text against an expectation.
///
/// In non-strict mode ANSI escapes are stripped from both sides before
/// comparing; strict mode compares raw bytes.
pub fn check_string(
    output: &str,
    expected: &str,
    action: StringAction,
    strict: bool,
) -> Result<(), String> {
    let (output, expected) = if strict {
        (output.to_string(), expected.to_string())
    } else {
        (strip_ansi(output), strip_ansi(expected))
    };

    let ok = match action {
        // Only the output side is trimmed; a trailing newline in the
        // expectation is significant.
        StringAction::Be => output.trim_end_matches('\n') == expected,
        StringAction::Contain => output.contains(&expected),
        StringAction::NotContain => !output.contains(&expected),
    };
    if ok {
        return Ok(());
    }

    let verb = match action {
        StringAction::Be => "be",
        StringAction::Contain => "contain",
        StringAction::NotContain => "not contain",
    };
    let mut message = format!("expected output to {verb}:\n{expected}\nactual:\n{output}");
    let diff = generate_diff(&expected, &output);
    if !diff.is_empty() {
        message.push('\n');
        message.push_str(&diff);
    }
    Err(message)
}

/// Unified diff between expected and actual, `--- Expected` / `+++ Actual`.
pub fn generate_diff(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    diff.unified_diff()
        .header("Expected", "Actual")
        .to_string()
}

/// Generic containment over JSON values.
///
/// Objects: every expected key exists in the actual object and its value is
/// contained recursively. Arrays: positional; the actual array may be longer.
/// Scalars: equal value of the same type.
pub fn contains_value(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .all(|(key, value)| a.get(key).is_some_and(|av| contains_value(value, av))),
        (Value::Array(e), Value::Array(a)) => e
            .iter()
            .enumerate()
            .all(|(i, value)| a.get(i).is_some_and(|av| contains_value(value, av))),
        (e, a) => e == a,
    }
}

/// True when the expected JSON document is contained in the actual one.
/// Unparseable input on either side is a mismatch, never a panic.
pub fn contains_json(actual: &str, expected: &str) -> bool {
    let (Ok(actual), Ok(expected)) = (
        serde_json::from_str::<Value>(actual),
        serde_json::from_str::<Value>(expected),
    ) else {
        return false;
    };
    contains_value(&expected, &actual)
}

/// Array-membership variant: both sides must be JSON arrays, and every
/// expected element must be contained in some actual element, in any order.
pub fn json_array_contains(actual: &str, expected: &str) -> bool {
    let (Ok(Value::Array(actual)), Ok(Value::Array(expected))) = (
        serde_json::from_str::<Value>(actual),
        serde_json::from_str::<Value>(expected),
    ) else {
        return false;
    };
    expected
        .iter()
        .all(|e| actual.iter().any(|a| contains_value(e, a)))
}

/// YAML adapter over the same containment primitive.
pub fn contains_yaml(actual: &str, expected: &str) -> bool {
    let (Ok(actual), Ok(expected)) = (
        serde_yaml::from_str::<Value>(actual),
        serde_yaml::from_str::<Value>(expected),
    ) else {
        return false;
    };
    contains_value(&expected, &actual)
}

/// Containment check with a diff-bearing error message.
pub fn check_json_contains(actual: &str, expected: &str) -> Result<(), String> {
    if contains_json(actual, expected) {
        return Ok(());
    }
    Err(structured_mismatch("JSON", actual, expected))
}

/// Containment check with a diff-bearing error message.
pub fn check_yaml_contains(actual: &str, expected: &str) -> Result<(), String> {
    if contains_yaml(actual, expected) {
        return Ok(());
    }
    Err(structured_mismatch("YAML", actual, expected))
}

fn structured_mismatch(format: &str, actual: &str, expected: &str) -> String {
    let mut message = format!("actual {format} is not a superset of expected {format}");
    let diff = generate_diff(expected.trim_end(), actual.trim_end());
    if !diff.is_empty() {
        message.push('\n');
        message.push_str(&diff);
    }
    message
}

/// Tabular comparison: the header row must match exactly and in order; data
/// rows are an unordered containment check (actual may have extra rows).
pub fn compare_tables(expected: &[Vec<String>], actual: &[Vec<String>]) -> Result<(), String> {
    let mismatch = || {
        let render = |rows: &[Vec<String>]| {
            rows.iter()
                .map(|r| r.join("\t"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let mut message = "table mismatch".to_string();
        let diff = generate_diff(&render(expected), &render(actual));
        if !diff.is_empty() {
            message.push('\n');
            message.push_str(&diff);
        }
        message
    };

    let (Some(expected_header), Some(actual_header)) = (expected.first(), actual.first()) else {
        return if expected.is_empty() {
            Ok(())
        } else {
            Err(mismatch())
        };
    };
    if expected_header != actual_header {
        return Err(mismatch());
    }
    for row in &expected[1..] {
        if !actual[1..].contains(row) {
            return Err(mismatch());
        }
    }
    Ok(())
}

/// CSV containment: rows are keyed by header name, expected rows may name a
/// subset of the actual columns, and each expected row must match at least one
/// actual row on every named column. An expected column that the actual header
/// does not carry is a mismatch.
pub fn contains_csv(actual_csv: &str, expected: &[Vec<String>]) -> bool {
    let mut lines = actual_csv.lines().filter(|l| !l.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return expected.len() <= 1;
    };
    let actual_header = parse_csv_line(header_line);
    let actual_rows: Vec<Vec<String>> = lines.map(parse_csv_line).collect();

    let Some((expected_header, expected_rows)) = expected.split_first() else {
        return true;
    };

    let mut columns = Vec::with_capacity(expected_header.len());
    for name in expected_header {
        match actual_header.iter().position(|a| a == name) {
            Some(ai) => columns.push(ai),
            None => return false,
        }
    }

    expected_rows.iter().all(|expected_row| {
        actual_rows.iter().any(|actual_row| {
            actual_row.len() == actual_header.len()
                && columns.iter().enumerate().all(|(ei, &ai)| {
                    expected_row.get(ei).map(String::as_str)
                        == actual_row.get(ai).map(String::as_str)
                })
        })
    })
}

/// Parse one CSV line: comma-separated, double quotes delimit fields, a
/// doubled quote inside a quoted field is a literal quote.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}
