//! Key management, transport encryption and client authentication.
//!
//! A key directory (default `~/.curve`) holds `<id>.key` and
//! `<id>.key_secret` files plus an `authorized_clients/` directory of
//! public keys the server accepts when authentication is on.

mod gatekeeper;
mod handshake;
mod keys;

use std::path::{Path, PathBuf};

use tracing::info;
use x25519_dalek::PublicKey;

pub use gatekeeper::Authenticator;
pub use handshake::{initiate, ServerHandshake, SessionCipher, SEAL_OVERHEAD};
pub use keys::{load_public_key, load_public_keys, KeyGenerator, KeyPair};

use crate::error::KeyError;
use keys::{key_path, PUBLIC_KEY_SUFFIX, SECRET_KEY_SUFFIX};

pub const AUTHORIZED_CLIENTS_DIR: &str = "authorized_clients";

/// `$HOME/.curve`.
pub fn default_curve_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".curve")
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn default_server_key_id() -> String {
    format!("id_server_{}_curve", host_name())
}

pub fn default_client_key_id() -> String {
    format!("id_client_{}_curve", host_name())
}

/// Server key material, plus the gatekeeper when authentication is on.
#[derive(Debug)]
pub struct ServerSecurity {
    pub keys: KeyPair,
    pub authenticator: Option<Authenticator>,
}

/// Client key material.
#[derive(Debug, Clone)]
pub struct ClientKeys {
    pub keys: KeyPair,
    pub server: PublicKey,
}

/// Loads key material out of a key directory.
#[derive(Debug, Clone)]
pub struct KeyManager {
    curve_dir: PathBuf,
}

impl KeyManager {
    pub fn new(curve_dir: Option<PathBuf>) -> Self {
        Self {
            curve_dir: curve_dir.unwrap_or_else(default_curve_dir),
        }
    }

    pub fn curve_dir(&self) -> &Path {
        &self.curve_dir
    }

    pub fn authorized_clients_dir(&self) -> PathBuf {
        self.curve_dir.join(AUTHORIZED_CLIENTS_DIR)
    }

    pub fn public_key_path(&self, key_id: &str) -> PathBuf {
        key_path(&self.curve_dir, key_id, PUBLIC_KEY_SUFFIX)
    }

    pub fn secret_key_path(&self, key_id: &str) -> PathBuf {
        key_path(&self.curve_dir, key_id, SECRET_KEY_SUFFIX)
    }

    pub fn setup_secure_server(
        &self,
        server_key_id: Option<&str>,
        use_auth: bool,
    ) -> Result<ServerSecurity, KeyError> {
        let key_id = server_key_id
            .map(str::to_string)
            .unwrap_or_else(default_server_key_id);
        let keys = KeyPair::load(&self.secret_key_path(&key_id))?;
        info!("Secure setup completed using server key {key_id}");

        let authenticator = if use_auth {
            Some(Authenticator::from_dir(&self.authorized_clients_dir())?)
        } else {
            None
        };
        Ok(ServerSecurity {
            keys,
            authenticator,
        })
    }

    pub fn setup_secure_client(
        &self,
        client_key_id: Option<&str>,
        server_key_id: &str,
    ) -> Result<ClientKeys, KeyError> {
        let key_id = client_key_id
            .map(str::to_string)
            .unwrap_or_else(default_client_key_id);
        let keys = KeyPair::load(&self.secret_key_path(&key_id))?;
        let server = load_public_key(&self.public_key_path(server_key_id))?;
        info!("Client using key {key_id} for server key {server_key_id}");
        Ok(ClientKeys { keys, server })
    }
}
