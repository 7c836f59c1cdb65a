//! SQLite over TCP, with encryption, authorization and online backups.
//!
//! # Intention
//!
//! - Execute SQL remotely against one shared database file per server.
//! - Keep the RPC layer reliable: strict request/reply, client-driven
//!   timeouts and retries.
//! - Gate every statement sub-action through an authorization policy.
//!
//! # Architectural Boundaries
//!
//! - [`server`] owns the only connection that executes requests. Backups
//!   use their own connections on their own thread.
//! - Query failures are data ([`protocol::Response::error`]); only
//!   configuration, codec and transport failures are Rust errors.
//! - Argument parsing and logging setup live in the binaries.

pub mod auth;
pub mod backup;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod process;
pub mod protocol;
pub mod security;
pub mod server;
pub mod sqlite;
pub mod transport;

pub use auth::{ActionCode, AuthorizationPolicy, Disposition, PolicyConfig};
pub use backup::{BackupJob, BackupScheduler};
pub use client::{ClientFactory, ExecuteOptions, SQLiteClient};
pub use config::{ClientConfig, Endpoint, ServerConfig};
pub use error::{
    BackupError, ClientError, CodecError, ConfigError, KeyError, ServerError, TransportError,
};
pub use process::ServerProcess;
pub use protocol::{ErrorInfo, Request, Response};
pub use security::{KeyGenerator, KeyManager, KeyPair};
pub use server::{BoundServer, QueryHandler, SQLiteServer};
pub use sqlite::{Database, Params, Row, Value};
