use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "livelink",
    author,
    version,
    about = "Connect to live rooms and keep the session alive",
    arg_required_else_help = true
)]
pub struct Args {
    /// Configuration file (TOML). Defaults to <config dir>/livelink/config.toml
    #[arg(short, long, global = true, env = "LIVELINK_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a room and print session events as JSON lines
    Watch {
        /// User handle to resolve
        handle: String,

        /// Strategy credential as NAME=VALUE (repeatable)
        #[arg(long = "credential", value_name = "NAME=VALUE", value_parser = parse_key_value)]
        credentials: Vec<(String, String)>,

        /// Strategy to skip (repeatable)
        #[arg(long = "disable", value_name = "NAME")]
        disabled: Vec<String>,

        /// Override the reconnect budget
        #[arg(long)]
        max_reconnects: Option<u32>,

        /// Ignore cached resolutions for the first attempt
        #[arg(long)]
        no_cache: bool,

        /// Connect even if the handle was recently blocked
        #[arg(long)]
        force: bool,

        /// Override transport.url_template
        #[arg(long, value_name = "URL")]
        transport_url: Option<String>,
    },

    /// Resolve a handle to a room identifier once
    Resolve {
        handle: String,

        /// Strategy credential as NAME=VALUE (repeatable)
        #[arg(long = "credential", value_name = "NAME=VALUE", value_parser = parse_key_value)]
        credentials: Vec<(String, String)>,

        /// Strategy to skip (repeatable)
        #[arg(long = "disable", value_name = "NAME")]
        disabled: Vec<String>,

        /// Bypass the session cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Classify an error message the way the session layer would
    Classify {
        message: String,

        /// HTTP status that came with the error
        #[arg(long)]
        status: Option<u16>,

        /// Retry-After hint in milliseconds
        #[arg(long, value_name = "MS")]
        retry_after_ms: Option<u64>,

        /// Mark the error as a transport timeout
        #[arg(long)]
        timed_out: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_args() {
        let args = Args::try_parse_from([
            "livelink",
            "-v",
            "watch",
            "alice",
            "--credential",
            "api=secret=1",
            "--disable",
            "page",
            "--max-reconnects",
            "3",
        ])
        .unwrap();
        assert!(args.verbose);
        let Commands::Watch {
            handle,
            credentials,
            disabled,
            max_reconnects,
            ..
        } = args.command
        else {
            panic!("expected watch");
        };
        assert_eq!(handle, "alice");
        assert_eq!(credentials, vec![("api".to_string(), "secret=1".to_string())]);
        assert_eq!(disabled, vec!["page".to_string()]);
        assert_eq!(max_reconnects, Some(3));
    }

    #[test]
    fn test_rejects_malformed_credential() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert!(
            Args::try_parse_from(["livelink", "watch", "alice", "--credential", "oops"]).is_err()
        );
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["livelink", "-v", "-q", "config"]).is_err());
    }
}
