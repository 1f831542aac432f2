use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::settings::DEFAULT_CONFIG_FILE;

/// Zero-downtime credential rotation
#[derive(Parser, Debug)]
#[command(name = "keyshift", version, about, long_about = None)]
#[command(after_help = "\
Examples:
  keyshift generate --length 32 --symbols 2
  keyshift register --id orders-db --connection orders --username1 svc_a --username2 svc_b \\
      --project shop --environment prod --interval 30d
  keyshift issue orders-db
  keyshift rotate orders-db --retry
  keyshift status
  keyshift run
")]
pub struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "KEYSHIFT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Override the configuration state file
    #[arg(long, global = true, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    /// Override the published secrets file
    #[arg(long, global = true, value_name = "PATH")]
    pub secrets_file: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `keyshift_rotation=trace`
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print passwords generated from a complexity policy
    Generate(GenerateArgs),

    /// Register a sql-credentials configuration in `pending`
    Register(RegisterArgs),

    /// Issue initial credentials for both logins
    Issue {
        /// Configuration id
        id: String,
        /// Retry retryable failures with backoff
        #[arg(long)]
        retry: bool,
    },

    /// Rotate the standby login and make it active
    Rotate {
        /// Configuration id
        id: String,
        /// Retry retryable failures with backoff
        #[arg(long)]
        retry: bool,
    },

    /// Invalidate both logins and delete the configuration
    Revoke {
        /// Configuration id
        id: String,
        /// Retry retryable failures with backoff
        #[arg(long)]
        retry: bool,
    },

    /// Resolve configurations left mid-operation (all when no id is given)
    Reconcile {
        /// Configuration id
        id: Option<String>,
    },

    /// Show configurations as JSON (all when no id is given)
    Status {
        /// Configuration id
        id: Option<String>,
    },

    /// Run the rotation scheduler until interrupted
    Run,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Total length
    #[arg(short, long, default_value_t = 48)]
    pub length: u32,

    /// Minimum lowercase letters
    #[arg(long, default_value_t = 1)]
    pub lowercase: u32,

    /// Minimum uppercase letters
    #[arg(long, default_value_t = 1)]
    pub uppercase: u32,

    /// Minimum digits
    #[arg(long, default_value_t = 1)]
    pub digits: u32,

    /// Minimum symbols
    #[arg(long, default_value_t = 0)]
    pub symbols: u32,

    /// Symbols to draw from
    #[arg(long, default_value = "-_.~!*")]
    pub allowed_symbols: String,

    /// Number of passwords
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Configuration id; a random one is generated when omitted
    #[arg(long)]
    pub id: Option<String>,

    /// Connection reference, a key of `[connections]` in the settings file
    #[arg(long)]
    pub connection: String,

    #[arg(long)]
    pub username1: String,

    #[arg(long)]
    pub username2: String,

    /// Custom statement with {{username}} and {{password}} placeholders
    #[arg(long)]
    pub statement: Option<String>,

    /// Generated password length
    #[arg(long)]
    pub password_length: Option<u32>,

    /// Secret key receiving the username
    #[arg(long, default_value = "DB_USERNAME")]
    pub user_key: String,

    /// Secret key receiving the password
    #[arg(long, default_value = "DB_PASSWORD")]
    pub password_key: String,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub environment: String,

    #[arg(long, default_value = "/")]
    pub path: String,

    /// Rotation interval for `keyshift run`, e.g. `30d` or `12h`
    #[arg(long, value_parser = parse_duration)]
    pub interval: Option<Duration>,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}
