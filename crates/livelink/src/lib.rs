//! livelink: a resilient session layer for third-party live event streams.
//!
//! Turns a user handle into a live room connection and keeps it alive:
//! room resolution through ordered strategies, error classification,
//! backoff, reconnection, event deduplication and a stream clock anchor.
//!
//! ## Core Types
//!
//! - [`ConnectionManager`] - Owns one logical session and its state machine
//! - [`ConnectionState`] - Lifecycle states published through a watch channel
//! - [`SessionEvent`] - Everything the manager reports, delivered via [`EventStream`]
//! - [`LinkConfig`] - Configuration; every field has a default
//!
//! ## Resolution
//!
//! - [`RoomResolver`] - Tries [`ResolutionStrategy`] implementations in tier order
//! - [`PageScrapeStrategy`] / [`JsonApiStrategy`] - HTTP-backed strategies
//! - [`SessionCache`] - TTL cache of resolved sessions
//!
//! ## Failure handling
//!
//! - [`ErrorClassifier`] - Maps raw failures to an [`ErrorKind`] through a signature table
//! - [`RetryPolicy`] - Exponential backoff with jitter
//!
//! ## Event pipeline
//!
//! - [`EventDeduplicator`] - Suppresses replays within a window
//! - [`StreamClockAnchor`] - Derives the broadcast start time
//!
//! ## Ports
//!
//! - [`Transport`] - Wire protocol; [`WebSocketTransport`] is the bundled one
//! - [`StateStore`] - Persistence; [`MemoryStore`] and [`JsonFileStore`]
//! - [`Clock`] - Time source; [`ManualClock`] for tests

pub mod anchor;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod http;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod transport;

pub use anchor::{AnchorSource, StreamAnchor, StreamClockAnchor, parse_timestamp};
pub use cache::{CacheStats, SessionCache};
pub use classifier::{
    ErrorClassification, ErrorClassifier, ErrorKind, RawError, SignatureRule, SignatureTable,
    classify,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{LinkConfig, StrategyConfig, StrategyKindConfig};
pub use dedup::{DedupStats, EventDeduplicator};
pub use error::{LinkError, Result};
pub use event::{EventKind, EventStream, NormalizedEvent, RawMessage, SessionEvent};
pub use manager::{ConnectOptions, ConnectionManager, ConnectionState, Diagnostics, ManagerDeps};
pub use resolver::{
    JsonApiStrategy, PageScrapeStrategy, ResolutionFailure, ResolutionStrategy, ResolveOptions,
    ResolvedSession, RoomResolver, StrategyContext, StrategyOutput, StrategyTier,
    build_strategies,
};
pub use retry::RetryPolicy;
pub use store::{JsonFileStore, MemoryStore, StateStore};
pub use sweeper::{SweepReport, Sweeper};
pub use transport::{Transport, TransportConnection, TransportSignal, WebSocketTransport};
