//! Regression comparison of an output file against its reference.
//!
//! Both files are read as whitespace separated tokens. Tokens that are numbers
//! in both files are compared with the tolerances of the quantity, the other
//! tokens shall be equal.

use crate::settings::Tolerances;
use std::path::Path;

/// Compare the file at `actual` with the reference file at `expected`.
///
/// Returns the list of differences, empty when the files match.
pub fn compare_files(actual: &Path, expected: &Path, tolerances: &Tolerances) -> Vec<String> {
    let expected_text = match std::fs::read_to_string(expected) {
        Ok(text) => text,
        Err(e) => return vec![format!("cannot read reference {}: {e}", expected.display())],
    };
    if !actual.exists() {
        return vec![format!("missing output file {}", actual.display())];
    }
    let actual_text = match std::fs::read_to_string(actual) {
        Ok(text) => text,
        Err(e) => return vec![format!("cannot read output {}: {e}", actual.display())],
    };
    compare_text(&actual_text, &expected_text, tolerances)
}

/// Compare two texts token by token.
pub fn compare_text(actual: &str, expected: &str, tolerances: &Tolerances) -> Vec<String> {
    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();

    if actual_tokens.len() != expected_tokens.len() {
        return vec![format!(
            "expected {} values, got {}",
            expected_tokens.len(),
            actual_tokens.len()
        )];
    }

    let mut failures = Vec::new();
    for (index, (a, e)) in actual_tokens.iter().zip(&expected_tokens).enumerate() {
        let ok = match (a.parse::<f64>(), e.parse::<f64>()) {
            (Ok(a), Ok(e)) => tolerances.accepts(a, e),
            _ => a == e,
        };
        if !ok {
            failures.push(format!("value #{index}: expected {e}, got {a}"));
        }
    }
    failures
}
