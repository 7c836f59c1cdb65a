//! Two-message key agreement over a framed stream.
//!
//! ```text
//! client -> server   E_c || seal(k_hello, C)
//! server -> client   E_s || seal(k_session, "welcome")
//! ```
//!
//! `k_hello` comes from DH(e_c, S). The session secret mixes DH(e_c, E_s),
//! DH(e_c, S) and DH(C, E_s), salted with the transcript, so only the
//! holder of the client's static secret can read the welcome or produce a
//! frame the server will open.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};

use super::keys::KeyPair;
use crate::error::TransportError;
use crate::transport::{read_frame, write_frame};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

/// Bytes a sealed frame adds to its plaintext (the GCM tag).
pub const SEAL_OVERHEAD: usize = 16;
const WELCOME: &[u8] = b"welcome";

/// Per-connection AEAD state, one key and counter per direction.
pub struct SessionCipher {
    sealer: Aes256Gcm,
    opener: Aes256Gcm,
    sent: u64,
    received: u64,
}

impl SessionCipher {
    fn new(seal_key: &[u8; KEY_LEN], open_key: &[u8; KEY_LEN]) -> Self {
        Self {
            sealer: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(seal_key)),
            opener: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(open_key)),
            sent: 0,
            received: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let nonce = nonce(self.sent);
        self.sent += 1;
        self.sealer
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::Crypto("failed to seal frame".to_string()))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let nonce = nonce(self.received);
        self.received += 1;
        self.opener
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| TransportError::Crypto("failed to open frame".to_string()))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("sent", &self.sent)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// HKDF-style extract and expand with HMAC-SHA256.
fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], TransportError> {
    let mut extract = <HmacSha256 as Mac>::new_from_slice(salt)
        .map_err(|e| TransportError::Crypto(e.to_string()))?;
    extract.update(ikm);
    let prk = extract.finalize().into_bytes();

    let mut expand = <HmacSha256 as Mac>::new_from_slice(&prk)
        .map_err(|e| TransportError::Crypto(e.to_string()))?;
    expand.update(info);
    expand.update(&[1]);

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&expand.finalize().into_bytes());
    Ok(key)
}

fn seal_once(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .encrypt(Nonce::from_slice(&nonce(0)), plaintext)
        .map_err(|_| TransportError::Crypto("failed to seal handshake".to_string()))
}

fn open_once(key: &[u8; KEY_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .decrypt(Nonce::from_slice(&nonce(0)), ciphertext)
        .map_err(|_| TransportError::Handshake("handshake message failed to decrypt".to_string()))
}

fn split_key(message: &[u8]) -> Result<(PublicKey, &[u8]), TransportError> {
    if message.len() <= KEY_LEN {
        return Err(TransportError::Handshake("handshake message too short".to_string()));
    }
    let (key, rest) = message.split_at(KEY_LEN);
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(key);
    Ok((PublicKey::from(bytes), rest))
}

fn hello_key(
    dh: &[u8],
    client_ephemeral: &PublicKey,
    server: &PublicKey,
) -> Result<[u8; KEY_LEN], TransportError> {
    let mut salt = Vec::with_capacity(2 * KEY_LEN);
    salt.extend_from_slice(client_ephemeral.as_bytes());
    salt.extend_from_slice(server.as_bytes());
    derive(dh, &salt, b"sqlite_rx hello")
}

struct Transcript {
    client_ephemeral: PublicKey,
    server: PublicKey,
    client: PublicKey,
    server_ephemeral: PublicKey,
}

impl Transcript {
    fn bytes(&self) -> Vec<u8> {
        [
            self.client_ephemeral.as_bytes().as_slice(),
            self.server.as_bytes().as_slice(),
            self.client.as_bytes().as_slice(),
            self.server_ephemeral.as_bytes().as_slice(),
        ]
        .concat()
    }
}

struct SessionKeys {
    welcome: [u8; KEY_LEN],
    client_to_server: [u8; KEY_LEN],
    server_to_client: [u8; KEY_LEN],
}

fn session_keys(ikm: &[u8], transcript: &Transcript) -> Result<SessionKeys, TransportError> {
    let salt = transcript.bytes();
    Ok(SessionKeys {
        welcome: derive(ikm, &salt, b"sqlite_rx welcome")?,
        client_to_server: derive(ikm, &salt, b"sqlite_rx c2s")?,
        server_to_client: derive(ikm, &salt, b"sqlite_rx s2c")?,
    })
}

fn read_handshake_frame(frame: Option<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
    frame.ok_or_else(|| TransportError::Handshake("peer closed during handshake".to_string()))
}

/// Client side. Returns the cipher for the established session.
pub async fn initiate<S>(
    stream: &mut S,
    client: &KeyPair,
    server: &PublicKey,
) -> Result<SessionCipher, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let k_hello = hello_key(
        ephemeral.diffie_hellman(server).as_bytes(),
        &ephemeral_public,
        server,
    )?;
    let mut hello = ephemeral_public.as_bytes().to_vec();
    hello.extend(seal_once(&k_hello, client.public().as_bytes())?);
    write_frame(stream, &hello).await?;

    let reply = read_handshake_frame(read_frame(stream).await?)?;
    let (server_ephemeral, sealed) = split_key(&reply)?;

    let ikm = [
        *ephemeral.diffie_hellman(&server_ephemeral).as_bytes(),
        *ephemeral.diffie_hellman(server).as_bytes(),
        *client.diffie_hellman(&server_ephemeral).as_bytes(),
    ]
    .concat();
    let keys = session_keys(
        &ikm,
        &Transcript {
            client_ephemeral: ephemeral_public,
            server: *server,
            client: *client.public(),
            server_ephemeral,
        },
    )?;

    if open_once(&keys.welcome, sealed)? != WELCOME {
        return Err(TransportError::Handshake("unexpected welcome".to_string()));
    }
    Ok(SessionCipher::new(&keys.client_to_server, &keys.server_to_client))
}

/// Server side, after the client's hello has been read. The caller decides
/// whether to [`complete`](ServerHandshake::complete) it based on
/// [`client_key`](ServerHandshake::client_key).
#[derive(Debug)]
pub struct ServerHandshake {
    client_ephemeral: PublicKey,
    client: PublicKey,
}

impl ServerHandshake {
    pub async fn read_hello<S>(stream: &mut S, server: &KeyPair) -> Result<Self, TransportError>
    where
        S: AsyncRead + Unpin,
    {
        let hello = read_handshake_frame(read_frame(stream).await?)?;
        let (client_ephemeral, sealed) = split_key(&hello)?;

        let k_hello = hello_key(
            server.diffie_hellman(&client_ephemeral).as_bytes(),
            &client_ephemeral,
            server.public(),
        )?;
        let opened = open_once(&k_hello, sealed)?;
        let client: [u8; KEY_LEN] = opened
            .try_into()
            .map_err(|_| TransportError::Handshake("client key has the wrong length".to_string()))?;

        Ok(Self {
            client_ephemeral,
            client: PublicKey::from(client),
        })
    }

    /// The static public key the client claims. It is proven only once
    /// the session is in use.
    pub fn client_key(&self) -> &PublicKey {
        &self.client
    }

    pub async fn complete<S>(
        self,
        stream: &mut S,
        server: &KeyPair,
    ) -> Result<SessionCipher, TransportError>
    where
        S: AsyncWrite + Unpin,
    {
        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let ikm = [
            *ephemeral.diffie_hellman(&self.client_ephemeral).as_bytes(),
            *server.diffie_hellman(&self.client_ephemeral).as_bytes(),
            *ephemeral.diffie_hellman(&self.client).as_bytes(),
        ]
        .concat();
        let keys = session_keys(
            &ikm,
            &Transcript {
                client_ephemeral: self.client_ephemeral,
                server: *server.public(),
                client: self.client,
                server_ephemeral: ephemeral_public,
            },
        )?;

        let mut welcome = ephemeral_public.as_bytes().to_vec();
        welcome.extend(seal_once(&keys.welcome, WELCOME)?);
        write_frame(stream, &welcome).await?;

        Ok(SessionCipher::new(&keys.server_to_client, &keys.client_to_server))
    }
}
