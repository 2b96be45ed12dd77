//! Ajax token extraction from the login page.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::html::{cached_regex, CachedRegex};
use crate::token::normalize::normalize;
use crate::token::sandbox::Sandbox;

/// Window property the token snippet assigns.
pub const TOKEN_VARIABLE: &str = "AJAX_TOKEN";

const HEAD_OPEN: &[u8] = b"<head>";
const HEAD_CLOSE: &[u8] = b"</head>";

static SNIPPET: CachedRegex = OnceLock::new();
static SCRIPT_TAG: CachedRegex = OnceLock::new();

fn snippet_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(&SNIPPET, r"\(\(\)\s*=>.*?\)\(\);")
}

fn script_tag_regex() -> Result<&'static Regex, regex::Error> {
    cached_regex(&SCRIPT_TAG, r"(?is)<script[^>]*>.*?</script>")
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no token snippet found in page head")]
    MissingSnippet,

    #[error("token snippet failed to execute: {message}")]
    Execution { message: String },

    #[error("token snippet did not assign window[\"{variable}\"]")]
    MissingToken { variable: String },

    #[error("invalid scraping pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Pulls the rotating ajax token out of an HTML document.
///
/// Every call evaluates the snippet in a fresh [`Sandbox`], so extractions
/// never observe each other's globals.
#[derive(Clone, Debug)]
pub struct TokenExtractor {
    variable: String,
}

impl Default for TokenExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenExtractor {
    pub fn new() -> Self {
        Self {
            variable: TOKEN_VARIABLE.to_string(),
        }
    }

    /// Reads a different window property than `AJAX_TOKEN`.
    pub fn with_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = variable.into();
        self
    }

    pub fn extract_token(&self, document: &[u8]) -> Result<String, TokenError> {
        let head = String::from_utf8_lossy(head_range(document));

        let snippet = match select_snippet(&head)? {
            Some(snippet) => snippet,
            None => {
                log_failure(&head, None, &TokenError::MissingSnippet);
                return Err(TokenError::MissingSnippet);
            }
        };

        self.run_snippet(snippet).map_err(|err| {
            log_failure(&head, Some(snippet), &err);
            err
        })
    }

    /// Normalizes and executes one snippet, returning the token it assigns.
    pub fn run_snippet(&self, snippet: &str) -> Result<String, TokenError> {
        let normalized = normalize(snippet)?;
        debug!(event = "token_snippet_normalized", snippet = %normalized);

        let mut sandbox = Sandbox::new()?;
        sandbox.exec(&normalized)?;
        sandbox
            .get_string(&self.variable)?
            .ok_or_else(|| TokenError::MissingToken {
                variable: self.variable.clone(),
            })
    }
}

/// Byte range between `<head>` and `</head>`, or the whole document when
/// the tags are missing.
fn head_range(document: &[u8]) -> &[u8] {
    let start = find_bytes(document, HEAD_OPEN, 0).map(|pos| pos + HEAD_OPEN.len());
    let end = start.and_then(|start| find_bytes(document, HEAD_CLOSE, start));

    match (start, end) {
        (Some(start), Some(end)) => &document[start..end],
        _ => {
            warn!(event = "token_head_missing", document_len = document.len());
            document
        }
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// The second snippet is authoritative when several are present; the
/// first one is a decoy.
fn select_snippet(head: &str) -> Result<Option<&str>, TokenError> {
    let matches: Vec<&str> = snippet_regex()?
        .find_iter(head)
        .map(|found| found.as_str())
        .collect();
    Ok(match matches.as_slice() {
        [] => None,
        [only] => Some(only),
        [_, second, ..] => Some(second),
    })
}

fn log_failure(head: &str, snippet: Option<&str>, err: &TokenError) {
    let scripts: Vec<&str> = script_tag_regex()
        .map(|regex| regex.find_iter(head).map(|found| found.as_str()).collect())
        .unwrap_or_default();
    warn!(
        event = "token_extraction_failed",
        error = %err,
        snippet = snippet.unwrap_or(""),
        scripts = ?scripts
    );
}

#[cfg(test)]
mod tests {
    use super::{head_range, select_snippet, TokenError, TokenExtractor};

    const TOKEN: &str = "2rKOA1IFdBcHhEM616cb";

    fn page(snippets: &[&str]) -> Vec<u8> {
        let mut html = String::from("<!DOCTYPE html><html><head><title>Login</title>");
        for snippet in snippets {
            html.push_str("<script type=\"text/javascript\">");
            html.push_str(snippet);
            html.push_str("</script>");
        }
        html.push_str("</head><body><div>(() => {window[\"AJAX_TOKEN\"]=\"body\";})();</div>");
        html.into_bytes()
    }

    fn extract(snippet: &str) -> String {
        TokenExtractor::new()
            .extract_token(&page(&[snippet]))
            .expect("token")
    }

    #[test]
    fn string_concatenation() {
        let snippet = r#"(() => {window["AJAX_TOKEN"]=("2r" + "KO" + "A1" + "IFdBcHhEM" + "61" + "6cb");})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn array_reverse_join() {
        let snippet = r#"(() => {window[["N","E","K","O","T","_","X","A","J","A"].reverse().join('')]=["bc6","16","MEh","HcBd","FI1","AOK","r2"].map(s => s.split('').reverse().join('')).reverse().join('');})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn direct_atob_value() {
        let snippet =
            r#"(() => {window["AJAX_TOKEN"]=atob("MnJLT0ExSUZkQmNIaEVNNjE2Y2I=");})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn atob_key_and_value() {
        let snippet = r#"(() => {window[atob('QUpBWF9UT0tFTg==')]=atob('MnJLT0ExSUZkQmNIaEVNNjE2Y2I=');})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn literal_assignment() {
        let snippet = r#"(() => {window["AJAX_TOKEN"]="2rKOA1IFdBcHhEM616cb";})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn reversed_string_helper() {
        let snippet = r#"(() => {window["AJAX_TOKEN"]=(s => s.split('').reverse().join(''))("bc616MEhHcBdFI1AOKr2");})();"#;
        assert_eq!(extract(snippet), TOKEN);
    }

    #[test]
    fn second_snippet_wins_over_decoy() {
        let decoy = r#"(() => {window["AJAX_TOKEN"]="decoy";})();"#;
        let real = r#"(() => {window["AJAX_TOKEN"]="2rKOA1IFdBcHhEM616cb";})();"#;
        let token = TokenExtractor::new()
            .extract_token(&page(&[decoy, real]))
            .expect("token");
        assert_eq!(token, TOKEN);
    }

    #[test]
    fn page_without_snippet_fails() {
        let html = b"<html><head><title>x</title><script>var a = 1;</script></head><body></body></html>";
        let error = TokenExtractor::new()
            .extract_token(html)
            .expect_err("no snippet");
        assert!(matches!(error, TokenError::MissingSnippet));
    }

    #[test]
    fn snippet_without_assignment_fails() {
        let snippet = r#"(() => {window["OTHER"]="value";})();"#;
        let error = TokenExtractor::new()
            .extract_token(&page(&[snippet]))
            .expect_err("missing token");
        assert!(matches!(error, TokenError::MissingToken { .. }));
    }

    #[test]
    fn throwing_snippet_fails_without_partial_token() {
        let snippet = r#"(() => {window["AJAX_TOKEN"]="partial"; missing();})();"#;
        let error = TokenExtractor::new()
            .extract_token(&page(&[snippet]))
            .expect_err("throws");
        assert!(matches!(error, TokenError::Execution { .. }));
    }

    #[test]
    fn head_range_ignores_body_snippets() {
        let html = page(&[]);
        let head = String::from_utf8_lossy(head_range(&html)).into_owned();
        assert!(select_snippet(&head).expect("pattern").is_none());
    }

    #[test]
    fn invalid_utf8_in_head_is_replaced() {
        let mut html = b"<head>\xff\xfe".to_vec();
        html.extend_from_slice(br#"(() => {window["AJAX_TOKEN"]="ok";})();"#);
        html.extend_from_slice(b"</head>");
        let token = TokenExtractor::new().extract_token(&html).expect("token");
        assert_eq!(token, "ok");
    }

    #[test]
    fn custom_variable_is_read() {
        let snippet = r#"(() => {window["OTHER"]="value";})();"#;
        let token = TokenExtractor::new()
            .with_variable("OTHER")
            .run_snippet(snippet)
            .expect("token");
        assert_eq!(token, "value");
    }
}
