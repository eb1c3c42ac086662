//! Compile free-text user queries into FTS5 `MATCH` expressions.
//!
//! Plain input is split on whitespace, each term is quoted so punctuation
//! cannot act as an operator, and the terms are joined with `AND`. Input that
//! already uses FTS5 syntax (quotes, `*`, parentheses, `AND`/`OR`, a leading
//! `NOT`) is passed through as-is.

use std::collections::HashSet;

fn is_advanced(query: &str) -> bool {
    if query.contains(['"', '\'', '*', '(', ')']) {
        return true;
    }
    let upper = query.to_uppercase();
    upper.contains(" AND ") || upper.contains(" OR ") || upper.starts_with("NOT ")
}

/// Compile `raw` into a match expression.
///
/// An empty result means "no query" and must not be sent to a shard.
pub fn compile_query(raw: &str) -> String {
    let query = raw.trim();
    if query.is_empty() {
        return String::new();
    }
    if is_advanced(query) {
        return query.to_string();
    }

    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Trim, drop blanks and de-duplicate, keeping first-seen order.
pub fn dedupe_strings(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && seen.insert(*v))
        .map(str::to_string)
        .collect()
}
