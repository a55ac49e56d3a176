//! Scanners for the result markers printed by stage scripts.
//!
//! Scripts may print several candidate values over a run; only the last one
//! is authoritative.

use regex::Regex;
use std::sync::LazyLock;

static ARTIFACT_PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Final output saved to:[ \t]*(.+)").unwrap());

static SUBMISSION_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:Product|Printify) URL:\s*(https?://\S+)").unwrap());

/// Path from the last `Final output saved to: <path>` line.
pub fn extract_artifact_path(log: &str) -> Option<String> {
    last_capture(&ARTIFACT_PATH_REGEX, log)
}

/// URL from the last `Product URL: <url>` or `Printify URL: <url>` marker.
///
/// `Product URL` is what the submit script prints; `Printify URL` is how a
/// submission is recorded in the status store, so both are accepted.
pub fn extract_submission_url(log: &str) -> Option<String> {
    last_capture(&SUBMISSION_URL_REGEX, log)
}

fn last_capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|value| !value.is_empty())
        .last()
        .map(str::to_string)
}
