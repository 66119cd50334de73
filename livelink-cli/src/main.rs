mod cli;
mod commands;
mod config;

use std::process;

use anyhow::Result;
use clap::Parser;
use livelink::{ConnectOptions, ResolveOptions};
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::{ResolveArgs, WatchArgs};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(args.verbose, args.quiet, args.log_json) {
        eprintln!("Error: failed to initialize logging: {e}");
        process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = config::load(args.config.as_deref())?;

    match args.command {
        Commands::Watch {
            handle,
            credentials,
            disabled,
            max_reconnects,
            no_cache,
            force,
            transport_url,
        } => {
            let options = ConnectOptions {
                credentials: credentials.into_iter().collect(),
                disabled_strategies: disabled.into_iter().collect(),
                max_reconnects,
                use_cache: !no_cache,
                force,
                ..Default::default()
            };
            commands::watch(
                config,
                WatchArgs {
                    handle,
                    options,
                    transport_url,
                },
            )
            .await
        }

        Commands::Resolve {
            handle,
            credentials,
            disabled,
            no_cache,
        } => {
            let options = ResolveOptions {
                use_cache: !no_cache,
                credentials: credentials.into_iter().collect(),
                disabled_strategies: disabled.into_iter().collect(),
                ..Default::default()
            };
            commands::resolve(config, ResolveArgs { handle, options }).await
        }

        Commands::Classify {
            message,
            status,
            retry_after_ms,
            timed_out,
        } => commands::classify(&config, message, status, retry_after_ms, timed_out),

        Commands::Config => commands::show_config(&config),
    }
}

fn init_logging(verbose: bool, quiet: bool, json: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,livelink=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);

    // Events go to stdout, so logs stay on stderr.
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}
