//! Rewrites token-assignment snippets into a plain function invocation.
//!
//! Pages ship the token as `(() => { ... })();`. The normalized form is
//! `(function(){ ... })()` with block comments removed, which every script
//! evaluator accepts. Normalizing an already normalized snippet returns it
//! unchanged.

use std::sync::OnceLock;

use regex::Regex;

use crate::html::{cached_regex, CachedRegex};

/// Explicit-function form of the string-reversal arrow helper.
pub const REVERSE_FUNCTION: &str = "function(s){return s.split('').reverse().join('')}";

static COMMENT: CachedRegex = OnceLock::new();
static REVERSE_ARROW: CachedRegex = OnceLock::new();
static NORMALIZED: CachedRegex = OnceLock::new();

fn comment_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(&COMMENT, r"(?s)/\*.*?\*/")
}

fn reverse_arrow_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(
        &REVERSE_ARROW,
        r#"(?:\bs|\(s\))\s*=>\s*s\.split\(['"]{2}\)\.reverse\(\)\.join\(['"]{2}\)"#,
    )
}

fn normalized_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(&NORMALIZED, r"(?s)^\(function\(\)\{(.*)\}\)\(\);?$")
}

/// Normalizes an arrow-function snippet (or a bare statement list) into
/// `(function(){<body>})()`.
pub fn normalize(snippet: &str) -> Result<String, regex::Error> {
    let stripped = comment_regex()?.replace_all(snippet, "");
    let trimmed = stripped.trim();

    let body = match normalized_regex()?.captures(trimmed) {
        Some(captures) => captures[1].trim().to_string(),
        None => arrow_body(trimmed),
    };
    let body = reverse_arrow_regex()?.replace_all(&body, REVERSE_FUNCTION);

    Ok(format!("(function(){{{body}}})()"))
}

/// Extracts the statement list of the outermost arrow function.
///
/// Block bodies keep everything up to the last closing brace, so nested
/// braces survive. Expression bodies become a `return` statement.
fn arrow_body(text: &str) -> String {
    let Some(arrow) = text.find("=>") else {
        return text.to_string();
    };
    let rest = text[arrow + 2..].trim_start();

    if let Some(block) = rest.strip_prefix('{') {
        return match block.rfind('}') {
            Some(end) => block[..end].trim().to_string(),
            None => block.trim().to_string(),
        };
    }

    let mut expression = rest.trim_end();
    expression = expression.strip_suffix(';').unwrap_or(expression).trim_end();
    expression = expression.strip_suffix(")()").unwrap_or(expression).trim_end();
    format!("return {expression};")
}
