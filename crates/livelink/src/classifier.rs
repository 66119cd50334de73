//! Upstream error classification.
//!
//! Maps heterogeneous raw failures (vendor error text, HTTP status codes,
//! transport timeouts) to a small stable taxonomy with a retry policy hint.
//! The recognised signatures live in a [`SignatureTable`] so they can be
//! extended from configuration as upstream error text drifts.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum wait suggested after an anti-bot block.
pub const DEFAULT_BLOCKED_WAIT: Duration = Duration::from_secs(5 * 60);

/// Wait suggested for rate limits that carry no retry-after hint.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);

/// Conservative wait for unrecognised failures.
pub const DEFAULT_UNKNOWN_WAIT: Duration = Duration::from_secs(10);

/// Longest raw message excerpt quoted back in a user message.
const MAX_DETAIL_CHARS: usize = 160;

/// Stable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Blocked,
    InvalidCredential,
    Timeout,
    ParseFailure,
    ResolutionFailure,
    RateLimited,
    NetworkFailure,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Blocked => "blocked",
            ErrorKind::InvalidCredential => "invalid_credential",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ParseFailure => "parse_failure",
            ErrorKind::ResolutionFailure => "resolution_failure",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds that cannot clear up without someone changing the setup.
    pub fn needs_intervention(&self) -> bool {
        matches!(self, ErrorKind::Blocked | ErrorKind::InvalidCredential)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The typed interpretation of a raw failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// How long the caller should wait before trying again, if the failure
    /// implies a specific wait. `None` means "apply normal backoff".
    pub suggested_wait_ms: Option<u64>,
    /// Short, actionable message naming a remedy.
    pub user_message: String,
}

impl ErrorClassification {
    pub fn new(
        kind: ErrorKind,
        retryable: bool,
        suggested_wait: Option<Duration>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            retryable,
            suggested_wait_ms: suggested_wait.map(duration_ms),
            user_message: user_message.into(),
        }
    }

    pub fn suggested_wait(&self) -> Option<Duration> {
        self.suggested_wait_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.user_message)
    }
}

/// A failure as reported by a strategy, HTTP client or transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    pub message: String,
    /// HTTP status (or equivalent) when one was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Upstream retry-after hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Set by the transport layer when the operation was aborted by a timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// A transport-level timeout or abort.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
            ..Default::default()
        }
    }

    /// A non-success HTTP response.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(duration_ms(retry_after));
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RawError {}

impl From<&reqwest::Error> for RawError {
    fn from(err: &reqwest::Error) -> Self {
        Self {
            message: error_chain(err),
            status: err.status().map(|s| s.as_u16()),
            retry_after_ms: None,
            timed_out: err.is_timeout(),
        }
    }
}

impl From<reqwest::Error> for RawError {
    fn from(err: reqwest::Error) -> Self {
        Self::from(&err)
    }
}

impl From<serde_json::Error> for RawError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("failed to parse response: {err}"))
    }
}

/// Render an error with its whole source chain, so that causes such as
/// "connection refused" stay visible to the signature matcher.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

/// One row of the signature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRule {
    pub kind: ErrorKind,
    /// Lowercase substrings matched against the raw message.
    #[serde(default)]
    pub substrings: Vec<String>,
    #[serde(default)]
    pub status_codes: Vec<u16>,
    /// Whether a raw error flagged as a transport timeout matches this rule.
    #[serde(default)]
    pub matches_timeout_flag: bool,
}

impl SignatureRule {
    pub fn new(kind: ErrorKind, substrings: &[&str], status_codes: &[u16]) -> Self {
        Self {
            kind,
            substrings: substrings.iter().map(|s| s.to_ascii_lowercase()).collect(),
            status_codes: status_codes.to_vec(),
            matches_timeout_flag: false,
        }
    }

    fn with_timeout_flag(mut self) -> Self {
        self.matches_timeout_flag = true;
        self
    }

    fn matches(&self, raw: &RawError, lowered: &str) -> bool {
        if self.matches_timeout_flag && raw.timed_out {
            return true;
        }
        if raw
            .status
            .is_some_and(|status| self.status_codes.contains(&status))
        {
            return true;
        }
        self.substrings
            .iter()
            .any(|needle| !needle.is_empty() && lowered.contains(needle.as_str()))
    }
}

/// Ordered list of signature rules; the first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTable {
    rules: Vec<SignatureRule>,
}

impl SignatureTable {
    pub fn new(rules: Vec<SignatureRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SignatureRule] {
        &self.rules
    }

    /// Append a rule at the lowest priority.
    pub fn push(&mut self, rule: SignatureRule) {
        self.rules.push(rule);
    }

    /// Add substrings to the highest-priority text rule of `kind`, creating a
    /// rule at the end of the table when none exists. Rows that match the
    /// transport timeout flag are skipped so vendor text keeps its rank.
    pub fn extend_kind<I, S>(&mut self, kind: ErrorKind, substrings: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lowered = substrings
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase());
        let index = self
            .rules
            .iter()
            .position(|rule| rule.kind == kind && !rule.matches_timeout_flag)
            .or_else(|| self.rules.iter().position(|rule| rule.kind == kind));
        match index.and_then(|i| self.rules.get_mut(i)) {
            Some(rule) => rule.substrings.extend(lowered),
            None => self.rules.push(SignatureRule {
                kind,
                substrings: lowered.collect(),
                status_codes: Vec::new(),
                matches_timeout_flag: false,
            }),
        }
    }

    fn first_match(&self, raw: &RawError) -> Option<ErrorKind> {
        let lowered = raw.message.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(raw, &lowered))
            .map(|rule| rule.kind)
    }
}

impl Default for SignatureTable {
    fn default() -> Self {
        Self::new(vec![
            // Transport-level aborts come first: they say nothing about the
            // upstream's intent, so vendor text must not override them.
            SignatureRule::new(
                ErrorKind::Timeout,
                &[
                    "aborterror",
                    "operation was aborted",
                    "deadline has elapsed",
                    "etimedout",
                ],
                &[],
            )
            .with_timeout_flag(),
            SignatureRule::new(
                ErrorKind::Blocked,
                &[
                    "captcha",
                    "blocked",
                    "anti-bot",
                    "antibot",
                    "bot detection",
                    "verify you are human",
                    "access denied",
                    "suspicious activity",
                ],
                &[403],
            ),
            SignatureRule::new(
                ErrorKind::InvalidCredential,
                &[
                    "unauthorized",
                    "invalid api key",
                    "invalid credential",
                    "invalid token",
                    "expired token",
                    "authentication failed",
                    "invalid session",
                ],
                &[401],
            ),
            SignatureRule::new(
                ErrorKind::RateLimited,
                &[
                    "rate limit",
                    "rate-limit",
                    "ratelimit",
                    "too many requests",
                    "quota exceeded",
                ],
                &[429, 504],
            ),
            SignatureRule::new(ErrorKind::Timeout, &["timed out", "timeout"], &[408]),
            SignatureRule::new(
                ErrorKind::ParseFailure,
                &[
                    "failed to parse",
                    "parse error",
                    "missing field",
                    "unexpected token",
                    "invalid json",
                    "expected value",
                    "eof while parsing",
                    "invalid type",
                    "not found in page",
                ],
                &[],
            ),
            SignatureRule::new(
                ErrorKind::NetworkFailure,
                &[
                    "dns",
                    "enotfound",
                    "failed to lookup",
                    "connection refused",
                    "econnrefused",
                    "connection reset",
                    "econnreset",
                    "network",
                    "unreachable",
                    "broken pipe",
                    "connection closed",
                    "error sending request",
                ],
                &[502, 503],
            ),
        ])
    }
}

/// Turns raw failures into [`ErrorClassification`]s.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: SignatureTable,
    blocked_wait: Duration,
    rate_limit_wait: Duration,
    unknown_wait: Duration,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(SignatureTable::default())
    }
}

impl ErrorClassifier {
    pub fn new(table: SignatureTable) -> Self {
        Self {
            table,
            blocked_wait: DEFAULT_BLOCKED_WAIT,
            rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
            unknown_wait: DEFAULT_UNKNOWN_WAIT,
        }
    }

    /// Override the wait suggested after an anti-bot block. Values below
    /// five minutes are raised to five minutes.
    pub fn with_blocked_wait(mut self, wait: Duration) -> Self {
        self.blocked_wait = wait.max(DEFAULT_BLOCKED_WAIT);
        self
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub fn with_unknown_wait(mut self, wait: Duration) -> Self {
        self.unknown_wait = wait;
        self
    }

    pub fn table(&self) -> &SignatureTable {
        &self.table
    }

    /// Classify a raw failure. Deterministic and side-effect free.
    pub fn classify(&self, raw: &RawError) -> ErrorClassification {
        let kind = self.table.first_match(raw).unwrap_or(ErrorKind::Unknown);
        self.build(kind, raw)
    }

    fn build(&self, kind: ErrorKind, raw: &RawError) -> ErrorClassification {
        match kind {
            ErrorKind::Timeout => ErrorClassification::new(
                kind,
                true,
                None,
                "The platform did not respond in time. Retrying with backoff; \
                 check your connection or raise the timeout if this keeps happening.",
            ),
            ErrorKind::Blocked => {
                let wait = raw
                    .retry_after()
                    .map_or(self.blocked_wait, |hint| hint.max(self.blocked_wait));
                ErrorClassification::new(
                    kind,
                    false,
                    Some(wait),
                    format!(
                        "The platform blocked the request (anti-bot protection). Wait at least \
                         {} before connecting again, or configure a session cookie or signing API key.",
                        human_duration(wait)
                    ),
                )
            }
            ErrorKind::InvalidCredential => ErrorClassification::new(
                kind,
                false,
                None,
                "The platform rejected the configured credentials. Obtain a new API key or \
                 session cookie, update the settings, then connect again.",
            ),
            ErrorKind::RateLimited => {
                let wait = raw.retry_after().unwrap_or(self.rate_limit_wait);
                ErrorClassification::new(
                    kind,
                    true,
                    Some(wait),
                    format!(
                        "The platform is rate limiting requests. Retrying in {}; reduce the \
                         number of parallel sessions if this repeats.",
                        human_duration(wait)
                    ),
                )
            }
            ErrorKind::ParseFailure => ErrorClassification::new(
                kind,
                true,
                None,
                "The platform response was missing expected fields. Retrying; if it persists \
                 the user may be offline or the page layout changed.",
            ),
            ErrorKind::NetworkFailure => ErrorClassification::new(
                kind,
                true,
                None,
                "Could not reach the platform. Retrying; check DNS, proxy and firewall \
                 settings if it persists.",
            ),
            ErrorKind::ResolutionFailure => ErrorClassification::new(
                kind,
                true,
                Some(self.unknown_wait),
                format!(
                    "Could not resolve the room: {}. Retrying in {}; check the handle and the \
                     strategy settings if it persists.",
                    excerpt(&raw.to_string()),
                    human_duration(self.unknown_wait)
                ),
            ),
            ErrorKind::Unknown => ErrorClassification::new(
                ErrorKind::Unknown,
                true,
                Some(self.unknown_wait),
                format!(
                    "Unexpected error: {}. Retrying in {}; report the error if it persists.",
                    excerpt(&raw.to_string()),
                    human_duration(self.unknown_wait)
                ),
            ),
        }
    }
}

static DEFAULT_CLASSIFIER: LazyLock<ErrorClassifier> = LazyLock::new(ErrorClassifier::default);

/// Classify with the default signature table.
pub fn classify(raw: &RawError) -> ErrorClassification {
    DEFAULT_CLASSIFIER.classify(raw)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Render a wait as "5 minutes" / "12 seconds" / "800 ms".
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 120 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else if secs >= 1 {
        format!("{} seconds", secs)
    } else {
        format!("{} ms", duration.as_millis())
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_DETAIL_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_DETAIL_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_timeout_flag_wins_over_everything() {
        let raw = RawError::timeout("captcha required").with_status(429);
        let c = classify(&raw);
        assert_eq!(c.kind, ErrorKind::Timeout);
        assert!(c.retryable);
        assert_eq!(c.suggested_wait_ms, None);
    }

    #[test]
    fn test_blocked_beats_timeout_text() {
        let raw = RawError::new("Request blocked by anti-bot protection after timeout");
        let c = classify(&raw);
        assert_eq!(c.kind, ErrorKind::Blocked);
        assert!(!c.retryable);
        assert!(c.suggested_wait().unwrap() >= Duration::from_secs(300));
    }

    #[test]
    fn test_blocked_respects_longer_retry_after() {
        let raw = RawError::new("captcha").with_retry_after(Duration::from_secs(900));
        let c = classify(&raw);
        assert_eq!(c.suggested_wait(), Some(Duration::from_secs(900)));

        let short = RawError::new("captcha").with_retry_after(Duration::from_secs(3));
        assert_eq!(
            classify(&short).suggested_wait(),
            Some(DEFAULT_BLOCKED_WAIT)
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            classify(&RawError::http_status(401, "nope")).kind,
            ErrorKind::InvalidCredential
        );
        assert_eq!(
            classify(&RawError::http_status(403, "nope")).kind,
            ErrorKind::Blocked
        );
        assert_eq!(
            classify(&RawError::http_status(429, "slow down")).kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&RawError::http_status(504, "Gateway Timeout")).kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&RawError::http_status(503, "unavailable")).kind,
            ErrorKind::NetworkFailure
        );
        assert_eq!(
            classify(&RawError::http_status(408, "request")).kind,
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_rate_limit_wait_uses_retry_after() {
        let raw = RawError::http_status(429, "Too Many Requests")
            .with_retry_after(Duration::from_secs(42));
        let c = classify(&raw);
        assert!(c.retryable);
        assert_eq!(c.suggested_wait(), Some(Duration::from_secs(42)));

        let c = classify(&RawError::new("rate limit exceeded"));
        assert_eq!(c.suggested_wait(), Some(DEFAULT_RATE_LIMIT_WAIT));
    }

    #[test]
    fn test_credential_beats_rate_limit() {
        let raw = RawError::new("unauthorized: too many requests with invalid api key");
        assert_eq!(classify(&raw).kind, ErrorKind::InvalidCredential);
    }

    #[test]
    fn test_parse_and_network_failures() {
        let c = classify(&RawError::new("room id not found in page source"));
        assert_eq!(c.kind, ErrorKind::ParseFailure);
        assert!(c.retryable);

        let c = classify(&RawError::new("getaddrinfo ENOTFOUND example.com"));
        assert_eq!(c.kind, ErrorKind::NetworkFailure);
        assert!(c.retryable);

        let c = classify(&RawError::new("tcp connect error: Connection refused (os error 111)"));
        assert_eq!(c.kind, ErrorKind::NetworkFailure);
    }

    #[test]
    fn test_unknown_is_retryable_with_conservative_wait() {
        let c = classify(&RawError::new("something odd happened"));
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert!(c.retryable);
        assert_eq!(c.suggested_wait(), Some(DEFAULT_UNKNOWN_WAIT));
        assert!(c.user_message.contains("something odd happened"));
    }

    #[test]
    fn test_every_message_names_a_remedy() {
        let samples = [
            RawError::timeout("deadline has elapsed"),
            RawError::new("captcha"),
            RawError::http_status(401, ""),
            RawError::http_status(429, ""),
            RawError::new("missing field `roomId`"),
            RawError::new("connection reset by peer"),
            RawError::new("???"),
        ];
        for raw in samples {
            let c = classify(&raw);
            assert!(
                c.user_message.contains("Retrying")
                    || c.user_message.contains("Wait")
                    || c.user_message.contains("Obtain"),
                "vague message for {:?}: {}",
                c.kind,
                c.user_message
            );
        }
    }

    #[test]
    fn test_extend_kind_adds_signatures() {
        let mut table = SignatureTable::default();
        table.extend_kind(ErrorKind::Blocked, ["Please Slide To Verify"]);
        let classifier = ErrorClassifier::new(table);

        let raw = RawError::new("please slide to verify");
        assert_eq!(classifier.classify(&raw).kind, ErrorKind::Blocked);
        // The default classifier does not know this signature.
        assert_eq!(classify(&raw).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_extra_timeout_text_ranks_below_blocked() {
        let mut table = SignatureTable::default();
        table.extend_kind(ErrorKind::Timeout, ["took too long"]);
        let classifier = ErrorClassifier::new(table);

        let c = classifier.classify(&RawError::new("request took too long"));
        assert_eq!(c.kind, ErrorKind::Timeout);
        let c = classifier.classify(&RawError::new("captcha blocked: request took too long"));
        assert_eq!(c.kind, ErrorKind::Blocked);
        // The transport-abort row is left untouched.
        assert!(
            !classifier.table().rules()[0]
                .substrings
                .contains(&"took too long".to_string())
        );
    }

    #[test]
    fn test_resolution_failure_rule_keeps_its_kind() {
        let mut table = SignatureTable::default();
        table.extend_kind(ErrorKind::ResolutionFailure, ["no room for handle"]);
        let c = ErrorClassifier::new(table).classify(&RawError::new("no room for handle bob"));
        assert_eq!(c.kind, ErrorKind::ResolutionFailure);
        assert!(c.retryable);
        assert!(c.user_message.contains("Retrying"));
    }

    #[test]
    fn test_blocked_wait_has_a_floor() {
        let classifier = ErrorClassifier::default().with_blocked_wait(Duration::from_secs(1));
        let c = classifier.classify(&RawError::new("blocked"));
        assert_eq!(c.suggested_wait(), Some(DEFAULT_BLOCKED_WAIT));
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_secs(300)), "5 minutes");
        assert_eq!(human_duration(Duration::from_secs(42)), "42 seconds");
        assert_eq!(human_duration(Duration::from_millis(250)), "250 ms");
    }
}
