//! Scripted strategies and transports shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use livelink::{
    ConnectionManager, EventStream, LinkConfig, ManagerDeps, ManualClock, RawError,
    ResolutionStrategy, ResolvedSession, SessionEvent, StateStore, StrategyContext,
    StrategyOutput, StrategyTier, Transport, TransportConnection, TransportSignal,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Config with short, deterministic delays.
pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.retry = config.retry.without_jitter();
    config.retry.max_attempts = 2;
    // Keep the counter reset out of the way unless a test wants it.
    config.reconnect.stability_window_ms = 24 * 60 * 60 * 1000;
    config.sweeper.enabled = false;
    config
}

/// A strategy that replays a script; the last entry repeats.
pub struct ScriptedStrategy {
    name: String,
    tier: StrategyTier,
    script: Mutex<VecDeque<Result<StrategyOutput, RawError>>>,
    calls: AtomicU32,
}

impl ScriptedStrategy {
    pub fn new(
        name: &str,
        tier: StrategyTier,
        script: Vec<Result<StrategyOutput, RawError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tier,
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn succeeding(name: &str, identifier: &str) -> Arc<Self> {
        Self::new(
            name,
            StrategyTier::Primary,
            vec![Ok(StrategyOutput::new(identifier))],
        )
    }

    pub fn failing(name: &str, raw: RawError) -> Arc<Self> {
        Self::new(name, StrategyTier::Primary, vec![Err(raw)])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResolutionStrategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> StrategyTier {
        self.tier
    }

    async fn resolve(&self, _ctx: &StrategyContext) -> Result<StrategyOutput, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.len() > 1 {
            script
                .pop_front()
                .unwrap_or_else(|| Err(RawError::new("script exhausted")))
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(RawError::new("script exhausted")))
        }
    }
}

/// A strategy whose lookups never complete.
#[derive(Default)]
pub struct HangingStrategy {
    calls: AtomicU32,
}

impl HangingStrategy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResolutionStrategy for HangingStrategy {
    fn name(&self) -> &str {
        "hanging"
    }

    fn tier(&self) -> StrategyTier {
        StrategyTier::Primary
    }

    async fn resolve(&self, _ctx: &StrategyContext) -> Result<StrategyOutput, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// One planned handshake.
pub enum Plan {
    Fail(RawError),
    /// The handshake never completes.
    Hang,
    /// Deliver `signals`, then keep the connection open or close it cleanly.
    Open {
        metadata: Value,
        signals: Vec<TransportSignal>,
        keep_open: bool,
    },
}

impl Plan {
    pub fn open(metadata: Value, signals: Vec<TransportSignal>) -> Self {
        Plan::Open {
            metadata,
            signals,
            keep_open: true,
        }
    }

    pub fn idle() -> Self {
        Self::open(Value::Null, Vec::new())
    }
}

/// A transport that follows a list of plans. Once the plans run out every
/// handshake yields an idle open connection.
#[derive(Default)]
pub struct ScriptedTransport {
    plans: Mutex<VecDeque<Plan>>,
    connected_to: Mutex<Vec<String>>,
    // Keeps open connections alive.
    live: Mutex<Vec<mpsc::Sender<TransportSignal>>>,
}

impl ScriptedTransport {
    pub fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            ..Default::default()
        })
    }

    /// Room identifiers of every handshake attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.connected_to.lock().clone()
    }

    /// Push a signal into the most recent open connection.
    pub async fn push(&self, signal: TransportSignal) {
        let sender = self.live.lock().last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(signal).await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self, session: &ResolvedSession) -> Result<TransportConnection, RawError> {
        self.connected_to.lock().push(session.identifier.clone());
        let plan = self.plans.lock().pop_front().unwrap_or_else(Plan::idle);
        match plan {
            Plan::Fail(raw) => Err(raw),
            Plan::Hang => std::future::pending().await,
            Plan::Open {
                metadata,
                signals,
                keep_open,
            } => {
                let (tx, rx) = mpsc::channel(signals.len() + 16);
                for signal in signals {
                    let _ = tx.try_send(signal);
                }
                if keep_open {
                    self.live.lock().push(tx);
                }
                Ok(TransportConnection::new(
                    metadata,
                    rx,
                    CancellationToken::new(),
                ))
            }
        }
    }
}

pub fn manager(
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
    transport: Arc<ScriptedTransport>,
    clock: Arc<ManualClock>,
    store: Option<Arc<dyn StateStore>>,
    config: LinkConfig,
) -> (ConnectionManager, EventStream) {
    let mut deps = ManagerDeps::new(strategies, transport).with_clock(clock);
    if let Some(store) = store {
        deps = deps.with_store(store);
    }
    ConnectionManager::new(deps, config).expect("valid config")
}

/// Receive events until one matches, returning everything seen.
pub async fn events_until(
    events: &mut EventStream,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(6 * 60 * 60), async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for event; saw {seen:?}");
    seen
}

pub fn is_connected(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Connected { .. })
}

pub fn is_disconnected(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Disconnected { .. })
}

/// Target states of every `StateChanged` event in `seen`.
pub fn states(seen: &[SessionEvent]) -> Vec<livelink::ConnectionState> {
    seen.iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}
