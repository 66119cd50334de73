use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use livelink::http::build_client;
use livelink::{
    ConnectOptions, ConnectionManager, JsonFileStore, LinkConfig, LinkError, ManagerDeps,
    RawError, ResolutionStrategy, ResolveOptions, RoomResolver, SessionCache, SessionEvent,
    StateStore, WebSocketTransport, build_strategies, system_clock,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Print one JSON value per line on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

fn state_store(config: &LinkConfig) -> Option<Arc<dyn StateStore>> {
    config
        .state_file
        .as_ref()
        .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn StateStore>)
}

fn strategies(config: &LinkConfig) -> Result<Vec<Arc<dyn ResolutionStrategy>>> {
    if config.strategies.is_empty() {
        bail!("No resolution strategies configured; add [[strategies]] entries to the config file");
    }
    let client = build_client(&config.resolver.user_agent, config.resolver.attempt_timeout())?;
    Ok(build_strategies(&config.strategies, &client)?)
}

pub struct WatchArgs {
    pub handle: String,
    pub options: ConnectOptions,
    pub transport_url: Option<String>,
}

/// Run a session until Ctrl-C or until it ends on its own.
pub async fn watch(mut config: LinkConfig, args: WatchArgs) -> Result<()> {
    if let Some(url) = args.transport_url {
        config.transport.url_template = Some(url);
    }
    let transport = WebSocketTransport::from_config(&config.transport)?;

    let mut deps = ManagerDeps::new(strategies(&config)?, Arc::new(transport));
    if let Some(store) = state_store(&config) {
        deps = deps.with_store(store);
    }
    let (manager, mut events) = ConnectionManager::new(deps, config)?;

    manager.connect(&args.handle, args.options).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                manager.disconnect().await?;
                while let Some(event) = events.try_recv() {
                    print_json(&event)?;
                }
                print_json(&manager.diagnostics())?;
                return Ok(());
            }

            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                print_json(&event)?;
                match event {
                    SessionEvent::Blocked { classification } => {
                        print_json(&manager.diagnostics())?;
                        bail!("{}", classification.user_message);
                    }
                    SessionEvent::Disconnected { reason, classification: Some(_) } => {
                        print_json(&manager.diagnostics())?;
                        bail!("{}", reason);
                    }
                    _ => {}
                }
            }
        }
    }
}

pub struct ResolveArgs {
    pub handle: String,
    pub options: ResolveOptions,
}

/// Resolve once and print the session.
pub async fn resolve(config: LinkConfig, args: ResolveArgs) -> Result<()> {
    let mut cache = SessionCache::with_ttl(system_clock(), config.resolver.cache_ttl());
    if config.resolver.persist_cache
        && let Some(store) = state_store(&config)
    {
        cache = cache.with_store(store);
    }
    if let Err(e) = cache.restore().await {
        warn!(error = %e, "Failed to restore session cache");
    }

    let resolver = RoomResolver::new(
        strategies(&config)?,
        cache,
        Arc::new(config.classifier.build()),
        config.retry.clone(),
    )
    .with_attempt_timeout(config.resolver.attempt_timeout());

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match resolver.resolve(&args.handle, &args.options, &token).await {
        Ok(session) => {
            if let Err(e) = resolver.cache().persist().await {
                warn!(error = %e, "Failed to persist session cache");
            }
            print_json(&session)
        }
        Err(LinkError::Resolution(failure)) => {
            print_json(&failure)?;
            bail!("{}", failure.classification.user_message);
        }
        Err(e) => Err(e).context("Resolution failed"),
    }
}

/// Classify a message and print the result.
pub fn classify(
    config: &LinkConfig,
    message: String,
    status: Option<u16>,
    retry_after_ms: Option<u64>,
    timed_out: bool,
) -> Result<()> {
    let mut raw = if timed_out {
        RawError::timeout(message)
    } else {
        RawError::new(message)
    };
    if let Some(status) = status {
        raw = raw.with_status(status);
    }
    if let Some(ms) = retry_after_ms {
        raw = raw.with_retry_after(std::time::Duration::from_millis(ms));
    }
    print_json(&config.classifier.build().classify(&raw))
}

pub fn show_config(config: &LinkConfig) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    println!("{rendered}");
    Ok(())
}
