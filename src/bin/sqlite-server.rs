//! `sqlite-server`: serve one SQLite database over TCP.
//!
//! ```bash
//! # In-memory database on the default address
//! sqlite-server
//!
//! # File database with encryption, authentication and hourly backups
//! sqlite-server -d data.db --curvezmq --zap -k id_server_myhost_curve \
//!     -b backup.db -i 3600
//!
//! # Configuration file
//! sqlite-server --config /etc/sqlite_rx/server.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlite_rx::{SQLiteServer, ServerConfig};

/// A simple, fast and secure server for the SQLite database.
#[derive(Parser, Debug)]
#[command(name = "sqlite-server", version)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, default_value = "info", env = "SQLITE_RX_LOG_LEVEL")]
    log_level: String,

    /// The host and port on which to listen for TCP connections [default: tcp://0.0.0.0:5000]
    #[arg(short = 'a', long)]
    tcp_address: Option<String>,

    /// Path to the database, or :memory: for an in-memory database [default: :memory:]
    #[arg(short = 'd', long)]
    database: Option<String>,

    /// Enable client authentication against authorized_clients/
    #[arg(long)]
    zap: bool,

    /// Enable transport encryption
    #[arg(long)]
    curvezmq: bool,

    /// Key directory, defaults to ~/.curve
    #[arg(short = 'c', long, value_name = "DIR")]
    curve_dir: Option<PathBuf>,

    /// Server key id
    #[arg(short = 'k', long)]
    key_id: Option<String>,

    /// Path to the backup database
    #[arg(short = 'b', long, value_name = "PATH")]
    backup_database: Option<PathBuf>,

    /// Backup interval in seconds [default: 600]
    #[arg(short = 'i', long)]
    backup_interval: Option<f64>,

    /// Pages copied per backup step; negative copies everything at once
    #[arg(long, allow_hyphen_values = true)]
    backup_pages_per_step: Option<i32>,

    /// Configuration file; command-line options override its values
    #[arg(long, value_name = "FILE", conflicts_with = "config_toml")]
    config: Option<PathBuf>,

    /// Inline TOML configuration, used for settings without a flag
    #[arg(long, hide = true)]
    config_toml: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("sqlite-server {} (SQLite {})", env!("CARGO_PKG_VERSION"), rusqlite::version());
    info!("Configuration: {config:?}");

    let server = SQLiteServer::new(config).context("Invalid server configuration")?;
    match server.start().context("Server failed")? {}
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(format!("sqlite_rx={level},sqlite_server={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

/// File or inline TOML first, then every flag given on the command line.
fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match (&args.config, &args.config_toml) {
        (Some(path), _) => ServerConfig::from_file(path).context("Failed to load config file")?,
        (None, Some(text)) => {
            ServerConfig::from_toml(text).context("Failed to parse inline config")?
        }
        (None, None) => ServerConfig::default(),
    };

    if let Some(address) = &args.tcp_address {
        config.bind_address = address.clone();
    }
    if let Some(database) = &args.database {
        config.database = database.clone();
    }
    if args.curvezmq {
        config.use_encryption = true;
    }
    if args.zap {
        config.use_auth = true;
    }
    if let Some(dir) = &args.curve_dir {
        config.curve_dir = Some(dir.clone());
    }
    if let Some(key_id) = &args.key_id {
        config.server_key_id = Some(key_id.clone());
    }
    if let Some(target) = &args.backup_database {
        config.backup_database = Some(target.clone());
    }
    if let Some(interval) = args.backup_interval {
        config.backup_interval_secs = interval;
    }
    if let Some(pages) = args.backup_pages_per_step {
        config.backup_pages_per_step = pages;
    }
    Ok(config)
}
