//! Error types for every layer of the crate.
//!
//! Two shapes are kept strictly apart: the errors below describe a failure
//! to configure, encode, or communicate, while query failures travel back
//! inside a normal [`crate::protocol::Response`] and are never raised.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Local wire codec failures. Never retried.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value could not be represented in (or read back from) the
    /// structured binary form.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The byte stream could not be compressed or is not a valid
    /// compressed stream.
    #[error("compression error: {0}")]
    Compression(String),
}

/// Invalid configuration, raised before a server accepts connections or
/// before a client performs any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The authorization policy uses an unknown disposition or action.
    #[error("invalid authorization policy: {0}")]
    InvalidPolicy(String),

    /// Authentication was enabled while encryption was disabled.
    #[error("authentication requires encryption to be enabled")]
    AuthWithoutEncryption,

    /// Encryption was enabled on a client that does not name the server key.
    #[error("encryption requires the server key id to be set")]
    MissingServerKeyId,

    /// The runtime or database cannot support online backups.
    #[error("backup not supported: {0}")]
    BackupUnsupported(String),

    /// The endpoint string is not a valid `tcp://host:port` address.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A configuration file could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Key material errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key generation refuses to overwrite an existing key file.
    #[error("{0} already exists, refusing to overwrite")]
    AlreadyExists(PathBuf),

    /// A key file or key directory could not be read or written.
    #[error("key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A key file exists but does not contain a usable key.
    #[error("malformed key file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Socket, framing and secure-channel failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame exceeded the maximum permitted size.
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The secure handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer's public key is not in the allow-list.
    #[error("peer key rejected by the authenticator")]
    Rejected,

    /// A sealed frame could not be opened or sealed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A bounded wait ran out.
    #[error("timed out")]
    Timeout,
}

/// Errors surfaced by [`crate::client::SQLiteClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// A precondition on the request was violated; nothing was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request could not be encoded or the reply decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Sending on an established socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every attempt expired without a reply.
    #[error("no response from {address} after {attempts} attempt(s)")]
    Connection { address: String, attempts: u32 },

    /// The client configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client's key material could not be loaded.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Online backup failures. Logged by the scheduler, never fatal to the
/// server.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The engine failed to open a database or copy pages.
    #[error("backup failed: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Errors that stop a server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
