//! Configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classifier::{ErrorClassifier, ErrorKind, SignatureTable};
use crate::error::{LinkError, Result};
use crate::http::DEFAULT_USER_AGENT;
use crate::resolver::StrategyTier;
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub retry: RetryPolicy,
    pub reconnect: ReconnectConfig,
    pub resolver: ResolverConfig,
    pub dedup: DedupConfig,
    pub anchor: AnchorConfig,
    pub classifier: ClassifierConfig,
    pub transport: TransportConfig,
    pub strategies: Vec<StrategyConfig>,
    pub sweeper: SweeperConfig,
    /// JSON file used to persist the anchor and the session cache.
    pub state_file: Option<PathBuf>,
}

impl LinkConfig {
    /// Reject values that would make the session layer misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(LinkError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(LinkError::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(LinkError::config("retry.jitter_ratio must be within 0.0..=1.0"));
        }
        if self.dedup.capacity == 0 {
            return Err(LinkError::config("dedup.capacity must be at least 1"));
        }
        if self.reconnect.event_buffer == 0 {
            return Err(LinkError::config("reconnect.event_buffer must be at least 1"));
        }
        if self.resolver.attempt_timeout_ms == 0 || self.reconnect.connect_timeout_ms == 0 {
            return Err(LinkError::config("timeouts must be greater than zero"));
        }
        if self.sweeper.enabled && self.sweeper.interval_ms == 0 {
            return Err(LinkError::config("sweeper.interval_ms must be greater than zero"));
        }
        for pointer in &self.anchor.candidate_fields {
            if !pointer.starts_with('/') {
                return Err(LinkError::config(format!(
                    "anchor candidate '{}' must be a JSON pointer starting with '/'",
                    pointer
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for strategy in &self.strategies {
            if strategy.name.trim().is_empty() {
                return Err(LinkError::config("strategy name must not be empty"));
            }
            if !names.insert(strategy.name.as_str()) {
                return Err(LinkError::config(format!(
                    "duplicate strategy name '{}'",
                    strategy.name
                )));
            }
            strategy.validate()?;
        }
        Ok(())
    }
}

fn default_max_auto_reconnects() -> u32 {
    5
}

fn default_stability_window_ms() -> u64 {
    5 * 60 * 1000
}

fn default_connect_timeout_ms() -> u64 {
    60_000
}

fn default_event_buffer() -> usize {
    256
}

/// Automatic reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_auto_reconnects")]
    pub max_auto_reconnects: u32,
    /// Continuous connected time after which the reconnect counter resets.
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    /// Bound on the transport handshake.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Capacity of the outbound event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_auto_reconnects: default_max_auto_reconnects(),
            stability_window_ms: default_stability_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ReconnectConfig {
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_attempt_timeout_ms() -> u64 {
    15_000
}

fn default_cache_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_true() -> bool {
    true
}

/// Room resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Persist the session cache to `state_file`.
    #[serde(default = "default_true")]
    pub persist_cache: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            user_agent: default_user_agent(),
            persist_cache: true,
        }
    }
}

impl ResolverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn default_dedup_window_ms() -> u64 {
    60_000
}

fn default_dedup_capacity() -> usize {
    1000
}

pub fn default_volatile_fields() -> Vec<String> {
    [
        "timestamp",
        "receivedAt",
        "received_at",
        "arrivalTime",
        "arrival_time",
        "serverTime",
        "server_time",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Event deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    /// Payload keys excluded from the event signature, at any depth.
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_dedup_window_ms(),
            capacity: default_dedup_capacity(),
            volatile_fields: default_volatile_fields(),
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

pub fn default_candidate_fields() -> Vec<String> {
    [
        "/start_time",
        "/create_time",
        "/room/start_time",
        "/room/create_time",
        "/data/start_time",
        "/data/create_time",
        "/stream_start_time",
        "/startTime",
        "/createTime",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_sanity_floor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Stream start anchoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// JSON pointers tried in order against session metadata.
    #[serde(default = "default_candidate_fields")]
    pub candidate_fields: Vec<String>,
    /// Timestamps before this are implausible.
    #[serde(default = "default_sanity_floor")]
    pub sanity_floor: DateTime<Utc>,
    /// Persist the anchor to `state_file`.
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            candidate_fields: default_candidate_fields(),
            sanity_floor: default_sanity_floor(),
            persist: true,
        }
    }
}

fn default_blocked_wait_ms() -> u64 {
    5 * 60 * 1000
}

fn default_rate_limit_wait_ms() -> u64 {
    10_000
}

fn default_unknown_wait_ms() -> u64 {
    10_000
}

/// Error classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Additional lowercase substrings per kind, appended to the
    /// highest-priority rule of that kind.
    #[serde(default)]
    pub extra_signatures: HashMap<ErrorKind, Vec<String>>,
    #[serde(default = "default_blocked_wait_ms")]
    pub blocked_wait_ms: u64,
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,
    #[serde(default = "default_unknown_wait_ms")]
    pub unknown_wait_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            extra_signatures: HashMap::new(),
            blocked_wait_ms: default_blocked_wait_ms(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            unknown_wait_ms: default_unknown_wait_ms(),
        }
    }
}

impl ClassifierConfig {
    pub fn build(&self) -> ErrorClassifier {
        let mut table = SignatureTable::default();
        for (kind, substrings) in &self.extra_signatures {
            table.extend_kind(*kind, substrings);
        }
        ErrorClassifier::new(table)
            .with_blocked_wait(Duration::from_millis(self.blocked_wait_ms))
            .with_rate_limit_wait(Duration::from_millis(self.rate_limit_wait_ms))
            .with_unknown_wait(Duration::from_millis(self.unknown_wait_ms))
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// WebSocket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Endpoint with a `{room_id}` placeholder.
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Text frame sent on every heartbeat tick.
    #[serde(default)]
    pub heartbeat_text: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url_template: None,
            headers: BTreeMap::new(),
            heartbeat_text: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl TransportConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

/// Background expiry sweeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One configured resolution strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    /// Defaults to `fallback` for page scrapes and `primary` for APIs.
    #[serde(default)]
    pub tier: Option<StrategyTier>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// API key; `LIVELINK_<NAME>_API_KEY` overrides it in the CLI.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(flatten)]
    pub kind: StrategyKindConfig,
}

/// Strategy implementation and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKindConfig {
    PageScrape {
        /// Page URL with a `{handle}` placeholder.
        url_template: String,
        /// Regex with an `id` named group or a first capture group.
        pattern: String,
    },
    JsonApi {
        url_template: String,
        /// JSON pointer to the room identifier.
        identifier_pointer: String,
        #[serde(default)]
        api_key_header: Option<String>,
        #[serde(default)]
        api_key_query: Option<String>,
        #[serde(default)]
        require_api_key: bool,
    },
}

impl StrategyConfig {
    fn validate(&self) -> Result<()> {
        let url_template = match &self.kind {
            StrategyKindConfig::PageScrape {
                url_template,
                pattern,
            } => {
                Regex::new(pattern).map_err(|e| {
                    LinkError::config(format!("strategy '{}': invalid pattern: {}", self.name, e))
                })?;
                url_template
            }
            StrategyKindConfig::JsonApi {
                url_template,
                identifier_pointer,
                ..
            } => {
                if !identifier_pointer.starts_with('/') {
                    return Err(LinkError::config(format!(
                        "strategy '{}': identifier_pointer must start with '/'",
                        self.name
                    )));
                }
                url_template
            }
        };
        url::Url::parse(&url_template.replace("{handle}", "x")).map_err(|e| {
            LinkError::config(format!("strategy '{}': invalid url_template: {}", self.name, e))
        })?;
        Ok(())
    }

    /// Environment variable holding this strategy's API key.
    pub fn api_key_env_var(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("LIVELINK_{}_API_KEY", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_document_is_default() {
        let config: LinkConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, LinkConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.reconnect.max_auto_reconnects, 5);
        assert_eq!(config.dedup.capacity, 1000);
        assert_eq!(config.anchor.candidate_fields[0], "/start_time");
        assert_eq!(config.sweeper.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: LinkConfig = serde_json::from_value(json!({
            "dedup": {"window_ms": 5000},
            "retry": {"max_attempts": 3}
        }))
        .unwrap();
        assert_eq!(config.dedup.window(), Duration::from_secs(5));
        assert_eq!(config.dedup.capacity, 1000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LinkConfig::default();
        config.dedup.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.strategies.push(StrategyConfig {
            name: "page".into(),
            tier: None,
            enabled: true,
            headers: BTreeMap::new(),
            api_key: None,
            kind: StrategyKindConfig::PageScrape {
                url_template: "https://example.com/{handle}".into(),
                pattern: "(unclosed".into(),
            },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_strategy_names_rejected() {
        let strategy = StrategyConfig {
            name: "api".into(),
            tier: None,
            enabled: true,
            headers: BTreeMap::new(),
            api_key: None,
            kind: StrategyKindConfig::JsonApi {
                url_template: "https://api.example.com/{handle}".into(),
                identifier_pointer: "/id".into(),
                api_key_header: None,
                api_key_query: None,
                require_api_key: false,
            },
        };
        let config = LinkConfig {
            strategies: vec![strategy.clone(), strategy],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_extra_signatures() {
        let config: ClassifierConfig = serde_json::from_value(json!({
            "extra_signatures": {"blocked": ["slide to verify"]}
        }))
        .unwrap();
        let classifier = config.build();
        let c = classifier.classify(&crate::classifier::RawError::new("Please slide to verify"));
        assert_eq!(c.kind, ErrorKind::Blocked);
    }

    #[test]
    fn test_api_key_env_var() {
        let strategy: StrategyConfig = serde_json::from_value(json!({
            "name": "signed-api",
            "type": "json_api",
            "url_template": "https://x/{handle}",
            "identifier_pointer": "/id"
        }))
        .unwrap();
        assert_eq!(strategy.api_key_env_var(), "LIVELINK_SIGNED_API_API_KEY");
    }
}
