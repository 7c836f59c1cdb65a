//! X25519 key files.
//!
//! `<id>.key` holds the public half, `<id>.key_secret` holds both halves.
//! Each file is text, one `name = "base64"` pair per line, `#` comments.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{info, warn};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::error::KeyError;

pub const PUBLIC_KEY_SUFFIX: &str = "key";
pub const SECRET_KEY_SUFFIX: &str = "key_secret";

const PUBLIC_FIELD: &str = "public-key";
const SECRET_FIELD: &str = "secret-key";

/// A static keypair.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        Self {
            public: PublicKey::from(&secret),
            secret,
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }

    /// Loads a `.key_secret` file. The stored public key must match the
    /// secret.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let fields = read_fields(path)?;
        let secret = decode_field(path, &fields, SECRET_FIELD)?;
        let pair = Self::from_secret(StaticSecret::from(secret));

        if let Some(stored) = fields.get(PUBLIC_FIELD) {
            let stored = decode_key(path, stored)?;
            if stored != *pair.public.as_bytes() {
                return Err(KeyError::Malformed {
                    path: path.to_path_buf(),
                    reason: "public key does not match the secret key".to_string(),
                });
            }
        }
        Ok(pair)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &encode_key(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Loads the public key from a `.key` or `.key_secret` file.
pub fn load_public_key(path: &Path) -> Result<PublicKey, KeyError> {
    let fields = read_fields(path)?;
    decode_field(path, &fields, PUBLIC_FIELD).map(PublicKey::from)
}

/// Loads every parseable `.key` file in `dir`. Unreadable or malformed
/// files are skipped with a warning; a missing directory yields no keys.
pub fn load_public_keys(dir: &Path) -> Result<Vec<PublicKey>, KeyError> {
    if !dir.exists() {
        warn!("Authorized clients directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|source| KeyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut keys = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PUBLIC_KEY_SUFFIX) {
            continue;
        }
        match load_public_key(&path) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(keys)
}

/// Writes new keypairs into a key directory.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    key_id: String,
    curve_dir: PathBuf,
}

impl KeyGenerator {
    pub fn new(key_id: impl Into<String>, curve_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_id: key_id.into(),
            curve_dir: curve_dir.into(),
        }
    }

    pub fn public_key_path(&self) -> PathBuf {
        key_path(&self.curve_dir, &self.key_id, PUBLIC_KEY_SUFFIX)
    }

    pub fn secret_key_path(&self) -> PathBuf {
        key_path(&self.curve_dir, &self.key_id, SECRET_KEY_SUFFIX)
    }

    /// Generates a keypair and writes both files. Refuses to touch an
    /// existing key.
    pub fn generate(&self) -> Result<KeyPair, KeyError> {
        let public_path = self.public_key_path();
        let secret_path = self.secret_key_path();
        for path in [&public_path, &secret_path] {
            if path.exists() {
                return Err(KeyError::AlreadyExists(path.clone()));
            }
        }

        let authorized = self.curve_dir.join(super::AUTHORIZED_CLIENTS_DIR);
        create_private_dir(&self.curve_dir)?;
        create_private_dir(&authorized)?;

        let pair = KeyPair::generate();
        let public = encode_key(pair.public.as_bytes());
        let secret = encode_key(pair.secret.as_bytes());

        write_private_file(
            &public_path,
            &format!("{}\n{PUBLIC_FIELD} = \"{public}\"\n", header(&self.key_id)),
        )?;
        write_private_file(
            &secret_path,
            &format!(
                "{}\n{PUBLIC_FIELD} = \"{public}\"\n{SECRET_FIELD} = \"{secret}\"\n",
                header(&self.key_id)
            ),
        )?;

        info!("Created {}", public_path.display());
        info!("Created {}", secret_path.display());
        Ok(pair)
    }
}

pub(crate) fn key_path(dir: &Path, key_id: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{key_id}.{suffix}"))
}

fn header(key_id: &str) -> String {
    format!("#   ****  sqlite_rx key {key_id}  ****\n#   Do not edit by hand.")
}

fn encode_key(bytes: &[u8; 32]) -> String {
    STANDARD.encode(bytes)
}

fn decode_key(path: &Path, text: &str) -> Result<[u8; 32], KeyError> {
    let malformed = |reason: String| KeyError::Malformed {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| malformed(format!("invalid base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| malformed(format!("expected 32 key bytes, found {}", b.len())))
}

fn decode_field(
    path: &Path,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<[u8; 32], KeyError> {
    let text = fields.get(name).ok_or_else(|| KeyError::Malformed {
        path: path.to_path_buf(),
        reason: format!("missing {name}"),
    })?;
    decode_key(path, text)
}

fn read_fields(path: &Path) -> Result<HashMap<String, String>, KeyError> {
    let content = fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| {
            (
                name.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect())
}

fn create_private_dir(dir: &Path) -> Result<(), KeyError> {
    let io_err = |source| KeyError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
    }
    Ok(())
}

fn write_private_file(path: &Path, content: &str) -> Result<(), KeyError> {
    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            KeyError::AlreadyExists(path.to_path_buf())
        } else {
            io_err(source)
        }
    })?;
    file.write_all(content.as_bytes()).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_keys_load_back() {
        let dir = tempdir().unwrap();
        let generator = KeyGenerator::new("id_server_test_curve", dir.path());
        let pair = generator.generate().unwrap();

        let loaded = KeyPair::load(&generator.secret_key_path()).unwrap();
        assert_eq!(loaded.public(), pair.public());
        assert_eq!(
            load_public_key(&generator.public_key_path()).unwrap(),
            *pair.public()
        );
        assert!(dir.path().join("authorized_clients").is_dir());
    }

    #[test]
    fn generation_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let generator = KeyGenerator::new("id_client", dir.path());
        generator.generate().unwrap();

        let err = generator.generate().unwrap_err();
        assert!(matches!(err, KeyError::AlreadyExists(_)));
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let curve_dir = dir.path().join("curve");
        let generator = KeyGenerator::new("id_client", &curve_dir);
        generator.generate().unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&generator.secret_key_path()), 0o600);
        assert_eq!(mode(&generator.public_key_path()), 0o600);
        assert_eq!(mode(&curve_dir), 0o700);
    }

    #[test]
    fn authorized_keys_skip_garbage() {
        let dir = tempdir().unwrap();
        let first = KeyGenerator::new("a", dir.path()).generate().unwrap();
        let second = KeyGenerator::new("b", dir.path()).generate().unwrap();
        fs::write(dir.path().join("broken.key"), "public-key = \"not base64!\"").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let keys = load_public_keys(dir.path()).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(first.public()));
        assert!(keys.contains(second.public()));

        assert!(load_public_keys(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn mismatched_secret_file_is_malformed() {
        let dir = tempdir().unwrap();
        let generator = KeyGenerator::new("x", dir.path());
        generator.generate().unwrap();
        let other = KeyPair::generate();

        let content = fs::read_to_string(generator.secret_key_path()).unwrap();
        let tampered = content
            .lines()
            .map(|line| {
                if line.starts_with(PUBLIC_FIELD) {
                    format!("{PUBLIC_FIELD} = \"{}\"", encode_key(other.public().as_bytes()))
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let path = dir.path().join("tampered.key_secret");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(KeyPair::load(&path), Err(KeyError::Malformed { .. })));
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let pair = KeyPair::generate();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains(&encode_key(pair.public().as_bytes())));
        assert!(!rendered.contains(&encode_key(pair.secret.as_bytes())));
    }
}
