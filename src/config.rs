//! Server and client configuration.
//!
//! Both are plain serde structs with defaults, loadable from TOML and
//! adjustable with builder-style setters. Argument parsing lives in the
//! binaries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::PolicyConfig;
use crate::error::ConfigError;

/// A `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let rest = address
            .strip_prefix("tcp://")
            .ok_or_else(|| invalid("only tcp:// endpoints are supported"))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        let host = match host {
            "*" => "0.0.0.0",
            h => h.trim_start_matches('[').trim_end_matches(']'),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for binding or connecting.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.authority())
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on, `tcp://host:port`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Database path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Encrypt the transport with the server keypair.
    #[serde(default)]
    pub use_encryption: bool,

    /// Only accept clients whose public key is in `authorized_clients/`.
    /// Requires `use_encryption`.
    #[serde(default)]
    pub use_auth: bool,

    /// Key directory, defaults to `~/.curve`.
    #[serde(default)]
    pub curve_dir: Option<PathBuf>,

    /// Server key id, defaults to `id_server_<host>_curve`.
    #[serde(default)]
    pub server_key_id: Option<String>,

    /// Enables the backup scheduler when set.
    #[serde(default)]
    pub backup_database: Option<PathBuf>,

    #[serde(default = "default_backup_interval")]
    pub backup_interval_secs: f64,

    /// Pages copied per backup step; negative copies everything at once.
    #[serde(default = "default_backup_pages")]
    pub backup_pages_per_step: i32,

    /// Authorization policy; the built-in policy when absent.
    #[serde(default)]
    pub authorization: Option<PolicyConfig>,
}

fn default_bind_address() -> String {
    "tcp://0.0.0.0:5000".to_string()
}

fn default_database() -> String {
    ":memory:".to_string()
}

fn default_backup_interval() -> f64 {
    600.0
}

fn default_backup_pages() -> i32 {
    -1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database: default_database(),
            use_encryption: false,
            use_auth: false,
            curve_dir: None,
            server_key_id: None,
            backup_database: None,
            backup_interval_secs: default_backup_interval(),
            backup_pages_per_step: default_backup_pages(),
            authorization: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.bind_address)
    }

    pub fn encryption(mut self, enabled: bool) -> Self {
        self.use_encryption = enabled;
        self
    }

    pub fn authentication(mut self, enabled: bool) -> Self {
        self.use_auth = enabled;
        self
    }

    pub fn curve_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.curve_dir = Some(dir.into());
        self
    }

    pub fn server_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.server_key_id = Some(key_id.into());
        self
    }

    pub fn backup(mut self, target: impl Into<PathBuf>, interval: Duration) -> Self {
        self.backup_database = Some(target.into());
        self.backup_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn authorization(mut self, policy: PolicyConfig) -> Self {
        self.authorization = Some(policy);
        self
    }

    pub fn backup_interval(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.backup_interval_secs).map_err(|_| {
            ConfigError::BackupUnsupported(format!(
                "invalid backup interval {}",
                self.backup_interval_secs
            ))
        })
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, `tcp://host:port`.
    #[serde(default = "default_connect_address")]
    pub connect_address: String,

    #[serde(default)]
    pub use_encryption: bool,

    /// Key directory, defaults to `~/.curve`.
    #[serde(default)]
    pub curve_dir: Option<PathBuf>,

    /// Client key id, defaults to `id_client_<host>_curve`.
    #[serde(default)]
    pub client_key_id: Option<String>,

    /// Key id of the server's public key. Required with encryption.
    #[serde(default)]
    pub server_key_id: Option<String>,

    /// How long to wait for each reply, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Attempts before giving up on a request.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_connect_address() -> String {
    "tcp://127.0.0.1:5000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2500
}

fn default_retries() -> u32 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_address: default_connect_address(),
            use_encryption: false,
            curve_dir: None,
            client_key_id: None,
            server_key_id: None,
            request_timeout_ms: default_request_timeout_ms(),
            retries: default_retries(),
        }
    }
}

impl ClientConfig {
    pub fn new(connect_address: impl Into<String>) -> Self {
        Self {
            connect_address: connect_address.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn encryption(
        mut self,
        curve_dir: impl Into<PathBuf>,
        client_key_id: impl Into<String>,
        server_key_id: impl Into<String>,
    ) -> Self {
        self.use_encryption = true;
        self.curve_dir = Some(curve_dir.into());
        self.client_key_id = Some(client_key_id.into());
        self.server_key_id = Some(server_key_id.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_tcp_addresses() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5003").unwrap();
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(endpoint.port(), 5003);
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5003");

        assert_eq!(Endpoint::parse("tcp://*:5000").unwrap().authority(), "0.0.0.0:5000");
        assert_eq!(Endpoint::parse("tcp://[::1]:7000").unwrap().authority(), "[::1]:7000");
    }

    #[test]
    fn endpoints_reject_other_schemes_and_bad_ports() {
        assert!(Endpoint::parse("ipc:///tmp/sock").is_err());
        assert!(Endpoint::parse("tcp://localhost").is_err());
        assert!(Endpoint::parse("tcp://localhost:99999").is_err());
        assert!(Endpoint::parse("tcp://:5000").is_err());
    }

    #[test]
    fn server_config_round_trips_through_toml() {
        let config = ServerConfig::new("tcp://127.0.0.1:6000", "/tmp/main.db")
            .encryption(true)
            .authentication(true)
            .curve_dir("/tmp/keys")
            .server_key_id("id_server")
            .backup("/tmp/backup.db", Duration::from_secs(2));

        let text = config.to_toml().unwrap();
        assert_eq!(ServerConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = ServerConfig::from_toml("database = \"x.db\"").unwrap();
        assert_eq!(config.bind_address, "tcp://0.0.0.0:5000");
        assert_eq!(config.backup_interval_secs, 600.0);
        assert!(!config.use_auth);

        let client: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(client.request_timeout_ms, 2500);
        assert_eq!(client.retries, 5);
    }

    #[test]
    fn client_config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            "connect_address = \"tcp://10.0.0.7:5001\"\n\
             use_encryption = true\n\
             server_key_id = \"id_server\"\n\
             retries = 2\n",
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.connect_address, "tcp://10.0.0.7:5001");
        assert!(config.use_encryption);
        assert_eq!(config.server_key_id.as_deref(), Some("id_server"));
        assert_eq!(config.retries, 2);
        assert_eq!(config.request_timeout_ms, 2500);

        let missing = ClientConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Load(_)));
    }
}
