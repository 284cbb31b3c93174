//! Stderr taxonomy: classify lines emitted on the agent subprocess's stderr
//! pipe against a fixed pattern set (rate-limit, unauthorized, invalid API
//! key, quota, generic API-error marker). A match is logged at warn and
//! handed to the dispatcher's `onStderr` callback, which promotes it to a
//! `session/error` notification (see `acp:session:error`).

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Human-readable category for a matched stderr line; all map to the
/// `API_ERROR` envelope error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrCategory {
    /// Provider rate limit exceeded.
    RateLimit,
    /// HTTP 401/403, or an explicit "unauthorized" marker.
    Unauthorized,
    /// Invalid or rejected API key/credential.
    InvalidApiKey,
    /// Provider quota exhausted.
    Quota,
    /// Generic SDK API-call error marker (`AI_APICallError` and similar).
    ApiError,
}

static FATAL_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)rate.?limit",
        r"(?i)\b401\b|\b403\b|unauthorized",
        r"(?i)invalid api key",
        r"(?i)\bquota\b",
        r"AI_APICallError|(?i)api error",
    ])
    .expect("stderr fatal pattern set is valid")
});

/// Classify a raw stderr line. Returns `None` for ordinary diagnostic
/// output, which the caller still logs at debug but does not promote.
pub fn classify(line: &str) -> Option<StderrCategory> {
    let matches = FATAL_PATTERNS.matches(line);
    if matches.matched(0) {
        return Some(StderrCategory::RateLimit);
    }
    if matches.matched(1) {
        return Some(StderrCategory::Unauthorized);
    }
    if matches.matched(2) {
        return Some(StderrCategory::InvalidApiKey);
    }
    if matches.matched(3) {
        return Some(StderrCategory::Quota);
    }
    if matches.matched(4) {
        return Some(StderrCategory::ApiError);
    }
    None
}

impl StderrCategory {
    /// Short, actionable message suitable for `acp:session:error.error.message`.
    /// Never includes the raw stderr text; callers attach that separately as
    /// `details`.
    pub fn message(&self) -> &'static str {
        match self {
            StderrCategory::RateLimit => "Rate limit exceeded. Please try again later.",
            StderrCategory::Unauthorized => "Authentication with the upstream provider failed.",
            StderrCategory::InvalidApiKey => "The configured API key was rejected.",
            StderrCategory::Quota => "Upstream provider quota exhausted.",
            StderrCategory::ApiError => "The upstream provider returned an error.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_log_line_is_not_fatal() {
        assert_eq!(classify("INFO starting session"), None);
    }

    #[test]
    fn test_rate_limit_classified() {
        assert_eq!(
            classify("Rate limit exceeded at 2026-07-28T00:00:00Z"),
            Some(StderrCategory::RateLimit)
        );
    }

    #[test]
    fn test_unauthorized_401_classified() {
        assert_eq!(classify("request failed with status 401"), Some(StderrCategory::Unauthorized));
    }

    #[test]
    fn test_invalid_api_key_classified() {
        assert_eq!(
            classify("Error: Invalid API key provided"),
            Some(StderrCategory::InvalidApiKey)
        );
    }

    #[test]
    fn test_quota_classified() {
        assert_eq!(classify("You have exceeded your quota"), Some(StderrCategory::Quota));
    }

    #[test]
    fn test_generic_api_call_error_classified() {
        assert_eq!(
            classify("AI_APICallError: upstream returned 500"),
            Some(StderrCategory::ApiError)
        );
    }

    #[test]
    fn test_message_never_echoes_raw_line() {
        let msg = StderrCategory::RateLimit.message();
        assert!(!msg.contains("2026"));
    }
}
