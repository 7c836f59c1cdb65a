//! Reliable request/reply client.
//!
//! Implements the Lazy Pirate pattern: each request is sent and the reply
//! awaited for at most `request_timeout`. When no reply arrives the socket
//! is discarded and a fresh one is opened for the next attempt, until the
//! retry budget runs out.
//!
//! Retries resend the identical request. If the server executed the first
//! copy and only the reply was lost, a non-idempotent statement runs
//! twice.
//!
//! A [`SQLiteClient`] owns exactly one connection and `execute` takes
//! `&mut self`, so at most one request is ever outstanding on it. Give each
//! concurrent worker its own client, e.g. from a [`ClientFactory`].

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::{ClientConfig, Endpoint};
use crate::error::{ClientError, ConfigError, TransportError};
use crate::protocol::{Request, Response};
use crate::security::{initiate, ClientKeys, KeyManager};
use crate::sqlite::{Params, Value};
use crate::transport::Channel;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DEFAULT_RETRIES: u32 = 5;

/// Per-call execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub execute_many: bool,
    pub execute_script: bool,
    /// How long each attempt waits for a reply.
    pub request_timeout: Duration,
    /// Attempts before giving up.
    pub retries: u32,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            execute_many: false,
            execute_script: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl ExecuteOptions {
    pub fn many(mut self) -> Self {
        self.execute_many = true;
        self
    }

    pub fn script(mut self) -> Self {
        self.execute_script = true;
        self
    }

    pub fn timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.execute_many && self.execute_script {
            return Err(ClientError::InvalidRequest(
                "execute_many and execute_script cannot both be set".to_string(),
            ));
        }
        if self.retries == 0 {
            return Err(ClientError::InvalidRequest(
                "retries must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::InvalidRequest(
                "request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hands out independent clients sharing one validated configuration.
#[derive(Debug, Clone)]
pub struct ClientFactory {
    endpoint: Endpoint,
    keys: Option<ClientKeys>,
    defaults: ExecuteOptions,
}

impl ClientFactory {
    /// Validates `config` and loads key material once for every client.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = Endpoint::parse(&config.connect_address)?;

        let keys = if config.use_encryption {
            let server_key_id = config
                .server_key_id
                .as_deref()
                .ok_or(ConfigError::MissingServerKeyId)?;
            let manager = KeyManager::new(config.curve_dir.clone());
            Some(manager.setup_secure_client(config.client_key_id.as_deref(), server_key_id)?)
        } else {
            None
        };

        let defaults = ExecuteOptions::default()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .retries(config.retries);

        Ok(Self {
            endpoint,
            keys,
            defaults,
        })
    }

    pub fn client(&self) -> SQLiteClient {
        SQLiteClient {
            client_id: format!("rust@{}", Uuid::new_v4()),
            endpoint: self.endpoint.clone(),
            keys: self.keys.clone(),
            defaults: self.defaults,
            channel: None,
        }
    }
}

enum Attempt {
    Expired(String),
    Failed(TransportError),
}

/// A single-owner connection to a server.
#[derive(Debug)]
pub struct SQLiteClient {
    client_id: String,
    endpoint: Endpoint,
    keys: Option<ClientKeys>,
    defaults: ExecuteOptions,
    channel: Option<Channel>,
}

impl SQLiteClient {
    /// Builds a client. The socket is opened by the first request.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        Ok(ClientFactory::new(config)?.client())
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Runs one statement with positional parameters.
    pub async fn execute(
        &mut self,
        query: &str,
        params: impl Into<Params>,
    ) -> Result<Response, ClientError> {
        let options = self.defaults;
        self.execute_with(query, params, options).await
    }

    /// Runs one statement once per parameter row.
    pub async fn execute_many(
        &mut self,
        query: &str,
        rows: Vec<Vec<Value>>,
    ) -> Result<Response, ClientError> {
        let options = self.defaults.many();
        self.execute_with(query, rows, options).await
    }

    /// Runs a multi-statement script.
    pub async fn execute_script(&mut self, script: &str) -> Result<Response, ClientError> {
        let options = self.defaults.script();
        self.execute_with(script, Params::default(), options).await
    }

    pub async fn execute_with(
        &mut self,
        query: &str,
        params: impl Into<Params>,
        options: ExecuteOptions,
    ) -> Result<Response, ClientError> {
        options.validate()?;

        let request = Request::new(&self.client_id, query)
            .with_params(params)
            .execute_many(options.execute_many)
            .execute_script(options.execute_script);
        let payload = codec::encode(&request)?;

        info!("Executing query {query} for client {}", self.client_id);

        let mut remaining = options.retries;
        let mut attempts = 0;
        while remaining > 0 {
            attempts += 1;
            debug!("READY attempt {attempts} of {}", options.retries);
            let deadline = Instant::now() + options.request_timeout;

            let reason = match tokio::time::timeout_at(deadline, self.exchange(&payload)).await {
                Ok(Ok(reply)) => {
                    debug!("REPLIED after {attempts} attempt(s)");
                    return Ok(codec::decode(&reply)?);
                }
                Ok(Err(Attempt::Failed(e))) => {
                    error!("Exception while sending message: {e}");
                    self.shutdown();
                    return Err(e.into());
                }
                Ok(Err(Attempt::Expired(reason))) => reason,
                Err(_) => "no response within the request timeout".to_string(),
            };

            warn!("EXPIRED: {reason}; client will disconnect and retry");
            self.shutdown();
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep_until(deadline).await;
            info!("Reconnecting to {} and resending request", self.endpoint);
        }

        error!("Server at {} seems to be offline, abandoning", self.endpoint);
        Err(ClientError::Connection {
            address: self.endpoint.to_string(),
            attempts,
        })
    }

    /// Drops the connection immediately. The next request reconnects.
    pub fn shutdown(&mut self) {
        if self.channel.take().is_some() {
            debug!("Client {} disconnected", self.client_id);
        }
    }

    async fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, Attempt> {
        if self.channel.is_none() {
            let channel = self
                .open()
                .await
                .map_err(|e| Attempt::Expired(format!("connect failed: {e}")))?;
            self.channel = Some(channel);
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Attempt::Expired("not connected".to_string()))?;

        channel.send(payload).await.map_err(Attempt::Failed)?;
        debug!("SENT, AWAITING_REPLY");

        match channel.recv().await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Attempt::Expired("connection closed by server".to_string())),
            Err(e) => Err(Attempt::Expired(e.to_string())),
        }
    }

    async fn open(&self) -> Result<Channel, TransportError> {
        let mut stream = TcpStream::connect(self.endpoint.authority()).await?;
        stream.set_nodelay(true)?;
        match &self.keys {
            Some(keys) => {
                let cipher = initiate(&mut stream, &keys.keys, &keys.server).await?;
                Ok(Channel::sealed(stream, cipher))
            }
            None => Ok(Channel::plain(stream)),
        }
    }
}
