//! Allow-list checks on a dedicated thread.
//!
//! The thread owns the loaded public keys and answers one query at a time.
//! It exits once every [`Authenticator`] handle has been dropped.

use std::path::Path;
use std::thread;

use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use super::keys::load_public_keys;
use crate::error::KeyError;

type Query = ([u8; 32], oneshot::Sender<bool>);

/// Handle to the gatekeeper thread.
#[derive(Debug, Clone)]
pub struct Authenticator {
    queries: mpsc::UnboundedSender<Query>,
}

impl Authenticator {
    /// Loads every key in `dir` and starts the gatekeeper.
    pub fn from_dir(dir: &Path) -> Result<Self, KeyError> {
        let keys = load_public_keys(dir)?;
        info!(
            "Loaded {} authorized client key(s) from {}",
            keys.len(),
            dir.display()
        );
        Self::start(keys).map_err(|source| KeyError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    pub fn start(allowed: Vec<PublicKey>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Query>();
        let allowed: Vec<[u8; 32]> = allowed.iter().map(|k| k.to_bytes()).collect();

        thread::Builder::new()
            .name("sqlite-auth".to_string())
            .spawn(move || {
                while let Some((candidate, reply)) = rx.blocking_recv() {
                    let accepted = allowed
                        .iter()
                        .any(|key| bool::from(key[..].ct_eq(&candidate[..])));
                    let _ = reply.send(accepted);
                }
                debug!("Authenticator stopped");
            })?;

        Ok(Self { queries: tx })
    }

    /// Whether `key` is in the allow-list. A stopped gatekeeper denies
    /// everything.
    pub async fn verify(&self, key: &PublicKey) -> bool {
        let (reply, answer) = oneshot::channel();
        if self.queries.send((key.to_bytes(), reply)).is_err() {
            warn!("Authenticator is not running, denying client");
            return false;
        }
        answer.await.unwrap_or(false)
    }
}
