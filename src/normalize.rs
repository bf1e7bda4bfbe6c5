use regex::Regex;
use std::sync::LazyLock;

static BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static PLACEHOLDER_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?(, ?\?)+").unwrap());
static NUMBERED_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+").unwrap());
static LIMIT_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)limit\s+\?").unwrap());
static SELECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)select").unwrap());

/// Canonical grouping text for a statement.
///
/// Block comments are removed, whitespace is squished and runs like `?, ?, ?` become a single `?`, so an
/// `IN (...)` list captured with a different arity still lands in the same group. The result is a fixed point:
/// `normalize(&normalize(q)) == normalize(q)`.
pub fn normalize(query: &str) -> String {
    let mut text = query.to_string();
    // Removing one comment can expose another, e.g. `//* a */* b */`
    while BLOCK_COMMENT.is_match(&text) {
        text = BLOCK_COMMENT.replace_all(&text, "").into_owned();
    }
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    PLACEHOLDER_RUN.replace_all(&text, "?").into_owned()
}

/// Whether the text can be run verbatim under `EXPLAIN`.
///
/// Parameterized templates (`= ?`, `?)`, `$1`, `LIMIT ?`) are rejected since they would fail to plan.
pub fn explainable(query: &str) -> bool {
    SELECT.is_match(query)
        && !query.contains("?)")
        && !query.contains("= ?")
        && !NUMBERED_PLACEHOLDER.is_match(query)
        && !LIMIT_PLACEHOLDER.is_match(query)
}
