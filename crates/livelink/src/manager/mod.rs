//! Session lifecycle.
//!
//! A [`ConnectionManager`] runs one logical session at a time:
//! - resolves the handle through the [`RoomResolver`] (cache first)
//! - performs the transport handshake with a timeout
//! - reconnects with classified backoff within a budget
//! - stops in `Blocked` on failures that need someone to act
//! - deduplicates and time-tags inbound events
//!
//! A spawned driver task is the only writer of the connection state while a
//! session runs; readers observe it through a `watch` channel.

mod state;

pub use state::ConnectionState;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::anchor::{StreamAnchor, StreamClockAnchor};
use crate::cache::{CacheStats, SessionCache};
use crate::classifier::{
    DEFAULT_BLOCKED_WAIT, ErrorClassification, ErrorKind, RawError, duration_ms, human_duration,
};
use crate::clock::{SharedClock, system_clock};
use crate::config::LinkConfig;
use crate::dedup::{DedupStats, EventDeduplicator};
use crate::error::{LinkError, Result};
use crate::event::{EventKind, EventStream, NormalizedEvent, RawMessage, SessionEvent};
use crate::resolver::{
    ResolutionFailure, ResolutionStrategy, ResolveOptions, ResolvedSession, RoomResolver,
};
use crate::retry::sleep_or_cancel;
use crate::store::StateStore;
use crate::sweeper::Sweeper;
use crate::transport::{Transport, TransportConnection, TransportSignal};

/// Collaborators injected into a [`ConnectionManager`].
pub struct ManagerDeps {
    pub strategies: Vec<Arc<dyn ResolutionStrategy>>,
    pub transport: Arc<dyn Transport>,
    pub clock: SharedClock,
    /// Backs the session cache and the stream anchor when set.
    pub store: Option<Arc<dyn StateStore>>,
}

impl ManagerDeps {
    pub fn new(strategies: Vec<Arc<dyn ResolutionStrategy>>, transport: Arc<dyn Transport>) -> Self {
        Self {
            strategies,
            transport,
            clock: system_clock(),
            store: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// Settings supplied at connect time, typically from an external settings
/// store.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Strategy name -> credential.
    pub credentials: HashMap<String, String>,
    /// Per-attempt resolution timeout.
    pub attempt_timeout: Option<Duration>,
    /// Transport handshake timeout.
    pub connect_timeout: Option<Duration>,
    pub max_reconnects: Option<u32>,
    pub disabled_strategies: HashSet<String>,
    /// Use a cached resolution for the first attempt. Reconnects always
    /// consult the cache first.
    pub use_cache: bool,
    /// Bypass the blocked gate.
    pub force: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            credentials: HashMap::new(),
            attempt_timeout: None,
            connect_timeout: None,
            max_reconnects: None,
            disabled_strategies: HashSet::new(),
            use_cache: true,
            force: false,
        }
    }
}

impl ConnectOptions {
    pub fn credential(mut self, strategy: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(strategy.into(), value.into());
        self
    }

    pub fn disable(mut self, strategy: impl Into<String>) -> Self {
        self.disabled_strategies.insert(strategy.into());
        self
    }

    pub fn with_max_reconnects(mut self, max: u32) -> Self {
        self.max_reconnects = Some(max);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    fn resolve_options(&self, use_cache: bool) -> ResolveOptions {
        ResolveOptions {
            use_cache,
            disabled_strategies: self.disabled_strategies.clone(),
            credentials: self.credentials.clone(),
            attempt_timeout: self.attempt_timeout,
            max_attempts: None,
        }
    }
}

/// Point-in-time view of a manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub target: Option<String>,
    pub session_id: Option<String>,
    /// Room identifier of the current or last session.
    pub room_id: Option<String>,
    /// Reconnects since the last stable period.
    pub reconnect_attempts: u32,
    pub total_reconnects: u64,
    pub last_classification: Option<ErrorClassification>,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub anchor: Option<StreamAnchor>,
}

/// Remembers why the last session was blocked.
#[derive(Debug, Clone)]
struct BlockedGate {
    target: String,
    classification: ErrorClassification,
    blocked_at: DateTime<Utc>,
    credentials: HashMap<String, String>,
}

impl BlockedGate {
    /// Why a connect to `target` must be refused, if it must.
    fn rejection(&self, target: &str, options: &ConnectOptions, now: DateTime<Utc>) -> Option<String> {
        if options.force || self.target != target {
            return None;
        }
        match self.classification.kind {
            ErrorKind::InvalidCredential => (options.credentials == self.credentials).then(|| {
                format!(
                    "the credentials for '{target}' were rejected and have not changed; \
                     supply new credentials or connect with force"
                )
            }),
            _ => {
                let wait = self
                    .classification
                    .suggested_wait()
                    .unwrap_or(DEFAULT_BLOCKED_WAIT);
                let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
                let elapsed = now - self.blocked_at;
                if elapsed >= wait {
                    return None;
                }
                let remaining = (wait - elapsed).to_std().unwrap_or_default();
                Some(format!(
                    "'{target}' is blocked upstream; wait {} before connecting again, or \
                     connect with force",
                    human_duration(remaining)
                ))
            }
        }
    }
}

#[derive(Debug, Default)]
struct Status {
    target: Option<String>,
    session_id: Option<String>,
    room_id: Option<String>,
    reconnect_attempts: u32,
    total_reconnects: u64,
    last_classification: Option<ErrorClassification>,
    gate: Option<BlockedGate>,
}

/// How a session ended.
enum Exit {
    Cancelled,
    Blocked(ErrorClassification),
    Disconnected {
        reason: String,
        classification: Option<ErrorClassification>,
    },
}

impl Exit {
    /// Terminal exit for a classification that must not be retried.
    fn terminal(classification: ErrorClassification) -> Self {
        if classification.kind.needs_intervention() {
            Exit::Blocked(classification)
        } else {
            Exit::Disconnected {
                reason: classification.user_message.clone(),
                classification: Some(classification),
            }
        }
    }
}

struct Driver {
    target: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Driver {
    fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await
            && e.is_panic()
        {
            error!(target = %self.target, "Session driver panicked");
        }
    }
}

/// State shared between the manager handle and its driver task.
struct Shared {
    config: LinkConfig,
    resolver: RoomResolver,
    transport: Arc<dyn Transport>,
    dedup: Arc<EventDeduplicator>,
    anchor: StreamClockAnchor,
    clock: SharedClock,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SessionEvent>,
    status: Mutex<Status>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publish a new state. Returns the previous one when it changed.
    fn swap_state(&self, to: ConnectionState) -> Result<Option<ConnectionState>> {
        let from = self.state();
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            return Err(LinkError::InvalidStateTransition { from, to });
        }
        self.state_tx.send_replace(to);
        debug!(from = %from, to = %to, "Connection state changed");
        Ok(Some(from))
    }

    async fn transition(&self, to: ConnectionState, token: &CancellationToken) -> Result<()> {
        if let Some(from) = self.swap_state(to)? {
            self.emit(SessionEvent::StateChanged { from, to }, token)
                .await;
        }
        Ok(())
    }

    /// Transition without waiting for channel capacity.
    fn transition_now(&self, to: ConnectionState) -> Result<()> {
        if let Some(from) = self.swap_state(to)? {
            self.emit_now(SessionEvent::StateChanged { from, to });
        }
        Ok(())
    }

    /// Send an event, waiting for capacity unless the session is cancelled.
    async fn emit(&self, event: SessionEvent, token: &CancellationToken) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let name = event.name();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(event = name, "Event channel full on shutdown, dropping event");
                    }
                    _ = self.events.send(event) => {}
                }
            }
        }
    }

    fn emit_now(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(event = event.name(), "Event channel full, dropping event");
        }
    }

    fn record_classification(&self, classification: &ErrorClassification) {
        self.status.lock().last_classification = Some(classification.clone());
    }

    async fn run_session(
        self: Arc<Self>,
        target: String,
        options: ConnectOptions,
        token: CancellationToken,
    ) {
        let exit = match self.drive(&target, &options, &token).await {
            Ok(exit) => exit,
            Err(LinkError::Cancelled) => Exit::Cancelled,
            Err(e) => {
                error!(target = %target, error = %e, "Session driver failed");
                Exit::Disconnected {
                    reason: e.to_string(),
                    classification: e.classification().cloned(),
                }
            }
        };
        self.finish(&target, &options, exit, &token).await;
    }

    async fn finish(
        &self,
        target: &str,
        options: &ConnectOptions,
        exit: Exit,
        token: &CancellationToken,
    ) {
        {
            let mut status = self.status.lock();
            status.session_id = None;
        }

        match exit {
            Exit::Cancelled => {
                info!(target = %target, "Session stopped");
                if let Err(e) = self.transition_now(ConnectionState::Disconnected) {
                    error!(error = %e, "Failed to record disconnect");
                }
                self.emit_now(SessionEvent::Disconnected {
                    reason: "Disconnected on request.".to_string(),
                    classification: None,
                });
            }
            Exit::Blocked(classification) => {
                warn!(
                    target = %target,
                    kind = %classification.kind,
                    "Session blocked: {}",
                    classification.user_message
                );
                {
                    let mut status = self.status.lock();
                    status.last_classification = Some(classification.clone());
                    status.gate = Some(BlockedGate {
                        target: target.to_string(),
                        classification: classification.clone(),
                        blocked_at: self.clock.now(),
                        credentials: options.credentials.clone(),
                    });
                }
                if let Err(e) = self.transition(ConnectionState::Blocked, token).await {
                    error!(error = %e, "Failed to record block");
                }
                self.emit(SessionEvent::Blocked { classification }, token)
                    .await;
            }
            Exit::Disconnected {
                reason,
                classification,
            } => {
                warn!(target = %target, "Session ended: {}", reason);
                if let Some(classification) = &classification {
                    self.record_classification(classification);
                }
                if let Err(e) = self.transition(ConnectionState::Disconnected, token).await {
                    error!(error = %e, "Failed to record disconnect");
                }
                self.emit(
                    SessionEvent::Disconnected {
                        reason,
                        classification,
                    },
                    token,
                )
                .await;
            }
        }
    }

    /// Resolve, connect and reconnect until the session ends.
    async fn drive(
        &self,
        target: &str,
        options: &ConnectOptions,
        token: &CancellationToken,
    ) -> Result<Exit> {
        let max_reconnects = options
            .max_reconnects
            .unwrap_or(self.config.reconnect.max_auto_reconnects);
        let connect_timeout = options
            .connect_timeout
            .unwrap_or_else(|| self.config.reconnect.connect_timeout());
        let mut resolve_options = options.resolve_options(options.use_cache);
        let mut reconnecting = false;

        loop {
            let session = match self.resolver.resolve(target, &resolve_options, token).await {
                Ok(session) => session,
                Err(LinkError::Resolution(failure)) => {
                    let classification = failure.classification.clone();
                    self.record_classification(&classification);
                    if !classification.retryable {
                        return Ok(match failure.intervention() {
                            Some(intervention) => Exit::Blocked(intervention.clone()),
                            None => Exit::Disconnected {
                                reason: classification.user_message.clone(),
                                classification: Some(classification),
                            },
                        });
                    }
                    if !reconnecting {
                        return Ok(Exit::Disconnected {
                            reason: exhausted_reason(&failure),
                            classification: Some(classification),
                        });
                    }
                    if let Some(exit) = self
                        .schedule_reconnect(&classification, max_reconnects, token)
                        .await?
                    {
                        return Ok(exit);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.config.resolver.persist_cache
                && let Err(e) = self.resolver.cache().persist().await
            {
                warn!(error = %e, "Failed to persist session cache");
            }

            self.transition(ConnectionState::Connecting, token).await?;
            debug!(
                target = %target,
                room_id = %session.identifier,
                transport = self.transport.name(),
                "Connecting transport"
            );

            let handshake = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LinkError::Cancelled),
                result = tokio::time::timeout(connect_timeout, self.transport.connect(&session)) => result,
            };

            let classification = match handshake {
                Ok(Ok(connection)) => {
                    self.run_connected(target, &session, connection, token)
                        .await?
                }
                Ok(Err(raw)) => {
                    let classification = self.resolver.classifier().classify(&raw);
                    warn!(
                        target = %target,
                        kind = %classification.kind,
                        error = %raw,
                        "Transport handshake failed"
                    );
                    classification
                }
                Err(_) => self.resolver.classifier().classify(&RawError::timeout(format!(
                    "transport handshake timed out after {}ms",
                    duration_ms(connect_timeout)
                ))),
            };

            self.record_classification(&classification);
            if !classification.retryable {
                return Ok(Exit::terminal(classification));
            }
            if let Some(exit) = self
                .schedule_reconnect(&classification, max_reconnects, token)
                .await?
            {
                return Ok(exit);
            }
            reconnecting = true;
            resolve_options.use_cache = true;
        }
    }

    /// Announce and wait out the next reconnect. Returns an exit when the
    /// budget is spent.
    async fn schedule_reconnect(
        &self,
        classification: &ErrorClassification,
        max_reconnects: u32,
        token: &CancellationToken,
    ) -> Result<Option<Exit>> {
        let attempt = {
            let mut status = self.status.lock();
            if status.reconnect_attempts >= max_reconnects {
                let attempts = status.reconnect_attempts;
                drop(status);
                return Ok(Some(Exit::Disconnected {
                    reason: format!(
                        "Gave up after {attempts} reconnect attempts: {} Check the network and \
                         connect again.",
                        classification.user_message
                    ),
                    classification: Some(classification.clone()),
                }));
            }
            status.reconnect_attempts += 1;
            status.total_reconnects += 1;
            status.reconnect_attempts
        };

        let delay = self.config.retry.delay_for(attempt - 1, classification);
        self.transition(ConnectionState::Reconnecting, token).await?;
        info!(
            attempt,
            max_reconnects,
            kind = %classification.kind,
            delay_ms = duration_ms(delay),
            "Reconnecting"
        );
        self.emit(
            SessionEvent::Reconnecting {
                attempt,
                delay_ms: duration_ms(delay),
            },
            token,
        )
        .await;
        sleep_or_cancel(delay, token).await?;
        Ok(None)
    }

    /// Pump a live connection until it closes. Returns the classified
    /// reason.
    async fn run_connected(
        &self,
        target: &str,
        session: &ResolvedSession,
        mut connection: TransportConnection,
        token: &CancellationToken,
    ) -> Result<ErrorClassification> {
        self.anchor.mark_connected(self.clock.now());
        self.anchor.observe(&session.metadata);
        let start_anchor = self.anchor.observe(&connection.metadata);

        let session_id = Uuid::new_v4().to_string();
        {
            let mut status = self.status.lock();
            status.session_id = Some(session_id.clone());
            status.room_id = Some(session.identifier.clone());
        }

        self.transition(ConnectionState::Connected, token).await?;
        info!(
            target = %target,
            room_id = %session.identifier,
            session_id = %session_id,
            resolved_via = %session.resolved_via,
            "Connected"
        );
        self.emit(
            SessionEvent::Connected {
                session_id,
                start_anchor,
            },
            token,
        )
        .await;

        let mut persisted = self.anchor.anchor().filter(|a| a.persisted);
        self.sync_anchor(&mut persisted).await;

        let stability = tokio::time::sleep(self.config.reconnect.stability_window());
        tokio::pin!(stability);
        let mut stable = false;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    connection.close();
                    return Err(LinkError::Cancelled);
                }

                _ = &mut stability, if !stable => {
                    stable = true;
                    let previous = std::mem::take(&mut self.status.lock().reconnect_attempts);
                    if previous > 0 {
                        info!(target = %target, previous, "Connection stable, reconnect counter reset");
                    }
                }

                signal = connection.signals.recv() => match signal {
                    Some(TransportSignal::Message(message)) => {
                        self.forward(message, &mut persisted, token).await;
                    }
                    Some(TransportSignal::Metadata(metadata)) => {
                        self.anchor.observe(&metadata);
                        self.sync_anchor(&mut persisted).await;
                    }
                    Some(TransportSignal::Closed(reason)) => {
                        return Ok(self.closed_classification(target, reason));
                    }
                    None => return Ok(self.closed_classification(target, None)),
                },
            }
        }
    }

    fn closed_classification(&self, target: &str, reason: Option<RawError>) -> ErrorClassification {
        match reason {
            Some(raw) => {
                let classification = self.resolver.classifier().classify(&raw);
                warn!(
                    target = %target,
                    kind = %classification.kind,
                    error = %raw,
                    "Transport disconnected"
                );
                classification
            }
            None => {
                info!(target = %target, "Transport closed by upstream");
                ErrorClassification::new(
                    ErrorKind::NetworkFailure,
                    true,
                    None,
                    "The upstream closed the connection. Retrying with backoff.",
                )
            }
        }
    }

    /// Dedup, anchor and emit one inbound message.
    async fn forward(
        &self,
        message: RawMessage,
        persisted: &mut Option<StreamAnchor>,
        token: &CancellationToken,
    ) {
        let Some(kind) = EventKind::from_wire(&message.kind) else {
            trace!(kind = %message.kind, "Ignoring unsupported message type");
            return;
        };
        if self.dedup.is_duplicate(kind.as_str(), &message.payload) {
            return;
        }

        self.anchor.observe_event(message.timestamp);
        self.sync_anchor(persisted).await;

        let received_at = self.clock.now();
        let reference = message
            .timestamp
            .filter(|ts| self.anchor.is_plausible(*ts))
            .unwrap_or(received_at);
        let event = NormalizedEvent {
            kind,
            payload: message.payload,
            elapsed_ms: self.anchor.elapsed_ms(reference),
            received_at,
            event_time: message.timestamp,
        };
        self.emit(SessionEvent::Domain(event), token).await;
    }

    /// Persist the anchor when it differs from the last persisted one.
    async fn sync_anchor(&self, persisted: &mut Option<StreamAnchor>) {
        if !self.config.anchor.persist {
            return;
        }
        let Some(current) = self.anchor.anchor() else {
            return;
        };
        let unchanged = persisted.as_ref().is_some_and(|p| {
            p.start_time == current.start_time && p.source == current.source
        });
        if unchanged {
            return;
        }
        match self.anchor.persist().await {
            Ok(()) => *persisted = Some(current),
            Err(e) => warn!(error = %e, "Failed to persist stream anchor"),
        }
    }
}

fn exhausted_reason(failure: &ResolutionFailure) -> String {
    let kinds = failure
        .failures
        .iter()
        .map(|f| format!("{} x{}: {}", f.strategy, f.attempts, f.last_error.kind))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Could not resolve the room for '{}': every strategy exhausted its retries ({}). \
         Check the handle and the network, then connect again.",
        failure.handle, kinds
    )
}

/// Owns one logical session to a live room.
///
/// Events are delivered through the [`EventStream`] returned by
/// [`ConnectionManager::new`]. Dropping the manager stops the session.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: tokio::sync::Mutex<Option<Driver>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cache_restored: std::sync::atomic::AtomicBool,
    root: CancellationToken,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.shared.state())
            .field("resolver", &self.shared.resolver)
            .field("transport", &self.shared.transport.name())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(deps: ManagerDeps, config: LinkConfig) -> Result<(Self, EventStream)> {
        config.validate()?;

        let ManagerDeps {
            strategies,
            transport,
            clock,
            store,
        } = deps;

        let mut cache = SessionCache::with_ttl(clock.clone(), config.resolver.cache_ttl());
        let mut anchor = StreamClockAnchor::new(&config.anchor, clock.clone());
        if let Some(store) = &store {
            if config.resolver.persist_cache {
                cache = cache.with_store(store.clone());
            }
            if config.anchor.persist {
                anchor = anchor.with_store(store.clone());
            }
        }

        let resolver = RoomResolver::new(
            strategies,
            cache,
            Arc::new(config.classifier.build()),
            config.retry.clone(),
        )
        .with_attempt_timeout(config.resolver.attempt_timeout());

        let dedup = Arc::new(EventDeduplicator::new(&config.dedup, clock.clone()));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (event_tx, event_rx) = mpsc::channel(config.reconnect.event_buffer.max(1));

        let shared = Arc::new(Shared {
            config,
            resolver,
            transport,
            dedup,
            anchor,
            clock,
            state_tx,
            events: event_tx,
            status: Mutex::new(Status::default()),
        });

        Ok((
            Self {
                shared,
                driver: tokio::sync::Mutex::new(None),
                sweeper: Mutex::new(None),
                cache_restored: std::sync::atomic::AtomicBool::new(false),
                root: CancellationToken::new(),
            },
            EventStream::new(event_rx),
        ))
    }

    /// Start a session for `handle`.
    ///
    /// Returns once the session is started; progress is reported through
    /// events and [`ConnectionManager::watch_state`]. A connect for the
    /// handle that is already active is a no-op unless `force` is set.
    pub async fn connect(&self, handle: &str, options: ConnectOptions) -> Result<()> {
        let target = handle.trim();
        if target.is_empty() {
            return Err(LinkError::config("handle must not be empty"));
        }

        let mut driver = self.driver.lock().await;
        if let Some(current) = driver.as_ref()
            && current.is_running()
            && current.target == target
            && !options.force
        {
            debug!(target = %target, "Session already active");
            return Ok(());
        }

        let now = self.shared.clock.now();
        let rejected = {
            let status = self.shared.status.lock();
            status.gate.as_ref().and_then(|gate| {
                gate.rejection(target, &options, now)
                    .map(|reason| (reason, gate.classification.clone()))
            })
        };
        if let Some((reason, classification)) = rejected {
            warn!(target = %target, "Connect rejected: {}", reason);
            return Err(LinkError::ConnectRejected {
                reason,
                classification,
            });
        }

        if let Some(previous) = driver.take() {
            previous.stop().await;
        }

        self.ensure_sweeper();
        self.restore_cache().await;
        self.prepare_target(target).await;

        {
            let mut status = self.shared.status.lock();
            status.target = Some(target.to_string());
            status.session_id = None;
            status.room_id = None;
            status.reconnect_attempts = 0;
            status.last_classification = None;
            status.gate = None;
        }

        let token = self.root.child_token();
        self.shared
            .transition(ConnectionState::Resolving, &token)
            .await?;
        info!(target = %target, "Starting session");

        let join = tokio::spawn(self.shared.clone().run_session(
            target.to_string(),
            options,
            token.clone(),
        ));
        *driver = Some(Driver {
            target: target.to_string(),
            token,
            join,
        });
        Ok(())
    }

    /// Stop the session, skipping any pending reconnect, and reset the
    /// stream anchor.
    pub async fn disconnect(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if let Some(current) = driver.take() {
            current.stop().await;
        }

        // A running driver lands in Disconnected itself.
        if self.shared.state() != ConnectionState::Disconnected {
            self.shared.transition_now(ConnectionState::Disconnected)?;
            self.shared.emit_now(SessionEvent::Disconnected {
                reason: "Disconnected on request.".to_string(),
                classification: None,
            });
        }

        {
            let mut status = self.shared.status.lock();
            status.session_id = None;
            status.reconnect_attempts = 0;
        }
        self.shared.anchor.reset().await
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let status = self.shared.status.lock();
        Diagnostics {
            state: self.shared.state(),
            target: status.target.clone(),
            session_id: status.session_id.clone(),
            room_id: status.room_id.clone(),
            reconnect_attempts: status.reconnect_attempts,
            total_reconnects: status.total_reconnects,
            last_classification: status.last_classification.clone(),
            cache: self.shared.resolver.cache().stats(),
            dedup: self.shared.dedup.stats(),
            anchor: self.shared.anchor.anchor(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn resolver(&self) -> &RoomResolver {
        &self.shared.resolver
    }

    fn ensure_sweeper(&self) {
        if !self.shared.config.sweeper.enabled {
            return;
        }
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let task = Sweeper::new(
            self.shared.resolver.cache().clone(),
            self.shared.dedup.clone(),
            self.shared.config.sweeper.interval(),
        );
        *sweeper = Some(task.spawn(self.root.child_token()));
    }

    async fn restore_cache(&self) {
        use std::sync::atomic::Ordering;

        if self.cache_restored.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.shared.resolver.cache().restore().await {
            Ok(0) => {}
            Ok(restored) => info!(restored, "Restored cached sessions"),
            Err(e) => warn!(error = %e, "Failed to restore session cache"),
        }
    }

    /// Bind the anchor and dedup window to `target`, resetting both when the
    /// target changed, and load a persisted anchor for it.
    async fn prepare_target(&self, target: &str) {
        let previous = self.shared.status.lock().target.clone();
        if let Some(previous) = previous
            && previous != target
        {
            info!(from = %previous, to = %target, "Target changed, resetting anchor");
            self.shared.anchor.bind(target);
            if let Err(e) = self.shared.anchor.reset().await {
                warn!(error = %e, "Failed to clear persisted anchor");
            }
            self.shared.dedup.clear();
        }

        self.shared.anchor.bind(target);
        if self.shared.config.anchor.persist && self.shared.anchor.anchor().is_none() {
            match self.shared.anchor.restore(target).await {
                Ok(Some(anchor)) => {
                    debug!(target = %target, start_time = %anchor.start_time, "Using persisted anchor")
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to restore stream anchor"),
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
