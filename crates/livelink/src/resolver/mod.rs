//! Room resolution.
//!
//! A user handle is turned into the opaque room identifier the transport
//! needs by trying independent [`ResolutionStrategy`] implementations in
//! priority order, each with its own retry budget. Successful resolutions
//! are cached.

pub mod strategies;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SessionCache;
use crate::classifier::{ErrorClassification, ErrorClassifier, ErrorKind, RawError, human_duration};
use crate::error::{LinkError, Result};
use crate::retry::{RetryPolicy, sleep_or_cancel};

pub use strategies::{JsonApiStrategy, PageScrapeStrategy, build_strategies};

/// Default bound on a single strategy attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Priority class of a strategy. Lower sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTier {
    /// Official or signed APIs.
    Authoritative,
    #[default]
    Primary,
    /// Last-resort scraping.
    Fallback,
}

/// Per-attempt input handed to a strategy.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub handle: String,
    /// Credential configured for this strategy (API key, cookie, ...).
    pub credential: Option<String>,
    /// 0-indexed attempt number within this strategy.
    pub attempt: u32,
    pub timeout: Duration,
}

/// What a strategy returns on success.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput {
    pub identifier: String,
    /// Whatever room information the strategy saw; `Null` when none.
    pub metadata: Value,
}

impl StrategyOutput {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One independent method of obtaining a room identifier.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> StrategyTier {
        StrategyTier::Primary
    }

    /// Feature toggle; disabled strategies are skipped.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether the strategy needs a credential it does not have. Such a
    /// strategy only runs when the caller supplies one in [`ResolveOptions`].
    fn missing_credential(&self) -> bool {
        false
    }

    async fn resolve(&self, ctx: &StrategyContext) -> std::result::Result<StrategyOutput, RawError>;
}

/// A resolved room. Immutable; superseded by a newer resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSession {
    pub identifier: String,
    /// Name of the strategy that produced it.
    pub resolved_via: String,
    pub resolved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl ResolvedSession {
    pub fn new(
        identifier: impl Into<String>,
        resolved_via: impl Into<String>,
        resolved_at: DateTime<Utc>,
        ttl: Duration,
        metadata: Value,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            identifier: identifier.into(),
            resolved_via: resolved_via.into(),
            resolved_at,
            expires_at: resolved_at.checked_add_signed(ttl).unwrap_or(resolved_at),
            metadata,
        }
    }
}

/// Per-call resolution options.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub use_cache: bool,
    /// Strategy names turned off for this call.
    pub disabled_strategies: HashSet<String>,
    /// Strategy name -> credential.
    pub credentials: HashMap<String, String>,
    pub attempt_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            disabled_strategies: HashSet::new(),
            credentials: HashMap::new(),
            attempt_timeout: None,
            max_attempts: None,
        }
    }
}

impl ResolveOptions {
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn disable(mut self, strategy: impl Into<String>) -> Self {
        self.disabled_strategies.insert(strategy.into());
        self
    }

    pub fn credential(mut self, strategy: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(strategy.into(), value.into());
        self
    }
}

/// How one strategy ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub attempts: u32,
    pub last_error: ErrorClassification,
    pub raw: RawError,
}

/// Every strategy was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub handle: String,
    /// Aggregated classification, kind `ResolutionFailure`.
    pub classification: ErrorClassification,
    pub failures: Vec<StrategyFailure>,
}

impl ResolutionFailure {
    fn aggregate(handle: &str, failures: Vec<StrategyFailure>) -> Self {
        let classification = if failures.is_empty() {
            ErrorClassification::new(
                ErrorKind::ResolutionFailure,
                false,
                None,
                format!(
                    "No resolution strategy is enabled for '{handle}'. Enable at least one \
                     strategy or configure its API key, then connect again."
                ),
            )
        } else {
            let retryable = failures.iter().any(|f| f.last_error.retryable);
            let wait = failures
                .iter()
                .filter_map(|f| f.last_error.suggested_wait())
                .max();
            let details = failures
                .iter()
                .map(|f| format!("{}: {}", f.strategy, f.last_error.kind))
                .collect::<Vec<_>>()
                .join(", ");
            let remedy = match (retryable, wait) {
                (true, Some(wait)) => format!("Retrying in {}.", human_duration(wait)),
                (true, None) => "Retrying with backoff.".to_string(),
                (false, _) => failures
                    .iter()
                    .find(|f| f.last_error.kind.needs_intervention())
                    .or_else(|| failures.first())
                    .map(|f| f.last_error.user_message.clone())
                    .unwrap_or_default(),
            };
            ErrorClassification::new(
                ErrorKind::ResolutionFailure,
                retryable,
                wait,
                format!("Could not resolve the room for '{handle}' ({details}). {remedy}"),
            )
        };

        Self {
            handle: handle.to_string(),
            classification,
            failures,
        }
    }

    /// The failure that needs someone to act: a block (preferred) or a
    /// rejected credential.
    pub fn intervention(&self) -> Option<&ErrorClassification> {
        let by_kind = |kind| {
            self.failures
                .iter()
                .map(|f| &f.last_error)
                .find(|c| c.kind == kind)
        };
        by_kind(ErrorKind::Blocked).or_else(|| by_kind(ErrorKind::InvalidCredential))
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.classification.user_message)
    }
}

enum StrategyOutcome {
    Resolved(StrategyOutput),
    Failed(StrategyFailure),
}

/// Resolves handles through ordered strategies, with caching and retry.
pub struct RoomResolver {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
    cache: SessionCache,
    classifier: Arc<ErrorClassifier>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl fmt::Debug for RoomResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomResolver")
            .field("strategies", &self.strategy_names())
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl RoomResolver {
    /// Strategies are stably sorted by tier, so registration order breaks ties.
    pub fn new(
        mut strategies: Vec<Arc<dyn ResolutionStrategy>>,
        cache: SessionCache,
        classifier: Arc<ErrorClassifier>,
        retry: RetryPolicy,
    ) -> Self {
        strategies.sort_by_key(|s| s.tier());
        Self {
            strategies,
            cache,
            classifier,
            retry,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolve `handle` to a session.
    pub async fn resolve(
        &self,
        handle: &str,
        options: &ResolveOptions,
        token: &CancellationToken,
    ) -> Result<ResolvedSession> {
        if token.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        if options.use_cache
            && let Some(session) = self.cache.get(handle)
        {
            debug!(handle = %handle, identifier = %session.identifier, "Resolved from cache");
            return Ok(session);
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            if options.disabled_strategies.contains(strategy.name()) {
                debug!(strategy = strategy.name(), "Strategy disabled by options, skipping");
                continue;
            }
            if !strategy.is_enabled() {
                debug!(strategy = strategy.name(), "Strategy not enabled, skipping");
                continue;
            }
            if strategy.missing_credential() && !options.credentials.contains_key(strategy.name())
            {
                debug!(strategy = strategy.name(), "Strategy has no credential, skipping");
                continue;
            }

            match self
                .run_strategy(strategy.as_ref(), handle, options, token)
                .await?
            {
                StrategyOutcome::Resolved(output) => {
                    let session = ResolvedSession::new(
                        output.identifier,
                        strategy.name(),
                        self.cache.now(),
                        self.cache.ttl(),
                        output.metadata,
                    );
                    info!(
                        handle = %handle,
                        strategy = strategy.name(),
                        identifier = %session.identifier,
                        "Resolved room"
                    );
                    self.cache.put(handle, session.clone());
                    return Ok(session);
                }
                StrategyOutcome::Failed(failure) => failures.push(failure),
            }
        }

        let failure = ResolutionFailure::aggregate(handle, failures);
        warn!(
            handle = %handle,
            retryable = failure.classification.retryable,
            "{}",
            failure.classification.user_message
        );
        Err(failure.into())
    }

    async fn run_strategy(
        &self,
        strategy: &dyn ResolutionStrategy,
        handle: &str,
        options: &ResolveOptions,
        token: &CancellationToken,
    ) -> Result<StrategyOutcome> {
        let timeout = options.attempt_timeout.unwrap_or(self.attempt_timeout);
        let max_attempts = options.max_attempts.unwrap_or(self.retry.max_attempts).max(1);
        let policy = RetryPolicy {
            max_attempts,
            ..self.retry.clone()
        };

        let mut attempt = 0u32;
        loop {
            let ctx = StrategyContext {
                handle: handle.to_string(),
                credential: options.credentials.get(strategy.name()).cloned(),
                attempt,
                timeout,
            };

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LinkError::Cancelled),
                result = tokio::time::timeout(timeout, strategy.resolve(&ctx)) => result,
            };

            let raw = match result {
                Ok(Ok(output)) if !output.identifier.trim().is_empty() => {
                    return Ok(StrategyOutcome::Resolved(output));
                }
                Ok(Ok(_)) => RawError::new("failed to parse room identifier: empty value"),
                Ok(Err(raw)) => raw,
                Err(_) => RawError::timeout(format!(
                    "{} attempt timed out after {}ms",
                    strategy.name(),
                    timeout.as_millis()
                )),
            };

            let classification = self.classifier.classify(&raw);
            attempt += 1;
            warn!(
                handle = %handle,
                strategy = strategy.name(),
                attempt,
                max_attempts,
                kind = %classification.kind,
                error = %raw,
                "Resolution attempt failed"
            );

            if !policy.should_retry(attempt, &classification) {
                return Ok(StrategyOutcome::Failed(StrategyFailure {
                    strategy: strategy.name().to_string(),
                    attempts: attempt,
                    last_error: classification,
                    raw,
                }));
            }

            let delay = policy.delay_for(attempt - 1, &classification);
            debug!(
                strategy = strategy.name(),
                delay_ms = delay.as_millis() as u64,
                "Backing off before next resolution attempt"
            );
            sleep_or_cancel(delay, token).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        name: &'static str,
        tier: StrategyTier,
        results: parking_lot::Mutex<Vec<std::result::Result<StrategyOutput, RawError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(
            name: &'static str,
            tier: StrategyTier,
            results: Vec<std::result::Result<StrategyOutput, RawError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                tier,
                results: parking_lot::Mutex::new(results),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResolutionStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn tier(&self) -> StrategyTier {
            self.tier
        }

        async fn resolve(
            &self,
            _ctx: &StrategyContext,
        ) -> std::result::Result<StrategyOutput, RawError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Err(RawError::new("script exhausted")))
            }
        }
    }

    fn resolver(strategies: Vec<Arc<dyn ResolutionStrategy>>) -> RoomResolver {
        RoomResolver::new(
            strategies,
            SessionCache::default(),
            Arc::new(ErrorClassifier::default()),
            RetryPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_order_is_stable() {
        let a = Scripted::new("a", StrategyTier::Fallback, vec![]);
        let b = Scripted::new("b", StrategyTier::Primary, vec![]);
        let c = Scripted::new("c", StrategyTier::Authoritative, vec![]);
        let d = Scripted::new("d", StrategyTier::Primary, vec![]);
        let r = resolver(vec![a, b, c, d]);
        assert_eq!(r.strategy_names(), vec!["c", "b", "d", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_next_strategy() {
        let first = Scripted::new(
            "first",
            StrategyTier::Primary,
            vec![Err(RawError::new("connection refused"))],
        );
        let second = Scripted::new(
            "second",
            StrategyTier::Primary,
            vec![Ok(StrategyOutput::new("room-42"))],
        );
        let r = resolver(vec![first.clone(), second.clone()]);
        let token = CancellationToken::new();

        let session = r
            .resolve("alice", &ResolveOptions::default(), &token)
            .await
            .unwrap();
        assert_eq!(session.identifier, "room-42");
        assert_eq!(session.resolved_via, "second");
        assert_eq!(first.calls(), 5);
        assert_eq!(second.calls(), 1);

        // Second call hits the cache.
        let again = r
            .resolve("alice", &ResolveOptions::default(), &token)
            .await
            .unwrap();
        assert_eq!(again, session);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_aborts_strategy_immediately() {
        let blocked = Scripted::new(
            "blocked",
            StrategyTier::Primary,
            vec![Err(RawError::http_status(403, "Forbidden"))],
        );
        let r = resolver(vec![blocked.clone()]);

        let err = r
            .resolve("alice", &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(blocked.calls(), 1);
        let LinkError::Resolution(failure) = err else {
            panic!("expected resolution failure, got {err:?}");
        };
        assert!(!failure.classification.retryable);
        assert_eq!(failure.classification.kind, ErrorKind::ResolutionFailure);
        assert_eq!(failure.intervention().unwrap().kind, ErrorKind::Blocked);
        assert!(failure.classification.suggested_wait().unwrap() >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_strategies_are_skipped() {
        let a = Scripted::new("a", StrategyTier::Primary, vec![Ok(StrategyOutput::new("1"))]);
        let b = Scripted::new("b", StrategyTier::Primary, vec![Ok(StrategyOutput::new("2"))]);
        let r = resolver(vec![a.clone(), b.clone()]);

        let session = r
            .resolve(
                "alice",
                &ResolveOptions::default().disable("a"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(session.identifier, "2");
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_enabled_strategy() {
        let r = resolver(vec![]);
        let err = r
            .resolve("alice", &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        let classification = err.classification().unwrap();
        assert!(!classification.retryable);
        assert!(classification.user_message.contains("Enable at least one"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_classified() {
        struct Hangs;

        #[async_trait]
        impl ResolutionStrategy for Hangs {
            fn name(&self) -> &str {
                "hangs"
            }

            async fn resolve(
                &self,
                _ctx: &StrategyContext,
            ) -> std::result::Result<StrategyOutput, RawError> {
                std::future::pending().await
            }
        }

        let r = resolver(vec![Arc::new(Hangs)]);
        let options = ResolveOptions {
            max_attempts: Some(2),
            ..Default::default()
        };
        let err = r
            .resolve("alice", &options, &CancellationToken::new())
            .await
            .unwrap_err();
        let LinkError::Resolution(failure) = err else {
            panic!("expected resolution failure");
        };
        assert_eq!(failure.failures[0].attempts, 2);
        assert_eq!(failure.failures[0].last_error.kind, ErrorKind::Timeout);
        assert!(failure.classification.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let slow = Scripted::new(
            "slow",
            StrategyTier::Primary,
            vec![Err(RawError::http_status(429, "slow down"))],
        );
        let r = Arc::new(resolver(vec![slow]));
        let token = CancellationToken::new();

        let task = {
            let r = r.clone();
            let token = token.clone();
            tokio::spawn(async move {
                r.resolve("alice", &ResolveOptions::default(), &token).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_are_passed_through() {
        struct NeedsKey;

        #[async_trait]
        impl ResolutionStrategy for NeedsKey {
            fn name(&self) -> &str {
                "api"
            }

            async fn resolve(
                &self,
                ctx: &StrategyContext,
            ) -> std::result::Result<StrategyOutput, RawError> {
                match ctx.credential.as_deref() {
                    Some("secret") => Ok(StrategyOutput::new("room-7")),
                    _ => Err(RawError::http_status(401, "invalid api key")),
                }
            }
        }

        let r = resolver(vec![Arc::new(NeedsKey)]);
        let token = CancellationToken::new();
        let err = r
            .resolve("alice", &ResolveOptions::default(), &token)
            .await
            .unwrap_err();
        let LinkError::Resolution(failure) = err else {
            panic!("expected resolution failure");
        };
        assert_eq!(
            failure.intervention().unwrap().kind,
            ErrorKind::InvalidCredential
        );

        let session = r
            .resolve(
                "alice",
                &ResolveOptions::default().credential("api", "secret"),
                &token,
            )
            .await
            .unwrap();
        assert_eq!(session.identifier, "room-7");
    }
}
