//! `sqlite-keygen`: create a keypair for encrypted sqlite_rx connections.
//!
//! ```bash
//! # Server key for this host in ~/.curve
//! sqlite-keygen
//!
//! # Client key in a custom directory
//! sqlite-keygen --client -c /etc/sqlite_rx/keys
//! ```
//!
//! To authorize a client, copy its `<id>.key` into the server's
//! `authorized_clients/` directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sqlite_rx::security::{default_client_key_id, default_curve_dir, default_server_key_id};
use sqlite_rx::KeyGenerator;

/// Generate an X25519 keypair for sqlite_rx.
#[derive(Parser, Debug)]
#[command(name = "sqlite-keygen", version)]
struct Args {
    /// Key id, defaults to id_server_<host>_curve (or id_client_<host>_curve)
    #[arg(short = 'k', long)]
    key_id: Option<String>,

    /// Generate a client key rather than a server key
    #[arg(long)]
    client: bool,

    /// Key directory, defaults to ~/.curve
    #[arg(short = 'c', long, value_name = "DIR")]
    curve_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(format!("sqlite_rx={0},sqlite_keygen={0}", args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let key_id = args.key_id.unwrap_or_else(|| {
        if args.client {
            default_client_key_id()
        } else {
            default_server_key_id()
        }
    });
    let curve_dir = args.curve_dir.unwrap_or_else(default_curve_dir);

    let generator = KeyGenerator::new(&key_id, &curve_dir);
    generator
        .generate()
        .with_context(|| format!("Failed to generate key {key_id}"))?;

    println!("{}", generator.public_key_path().display());
    println!("{}", generator.secret_key_path().display());
    Ok(())
}
