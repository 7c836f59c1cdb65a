//! The request/reply server.
//!
//! One thread runs everything: an acceptor task spawns a task per
//! connection, each connection forwards decoded frames to a single handler
//! loop that owns the database, and replies travel back over a oneshot.
//! The handler processes one message at a time, so statements from
//! different clients never interleave.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::auth::AuthorizationPolicy;
use crate::backup::{BackupJob, BackupScheduler};
use crate::codec;
use crate::config::{Endpoint, ServerConfig};
use crate::error::{ConfigError, ServerError, TransportError};
use crate::protocol::{ErrorInfo, Request, Response};
use crate::security::{KeyManager, ServerHandshake, ServerSecurity, SessionCipher, SEAL_OVERHEAD};
use crate::sqlite::Database;
use crate::transport::{Channel, MAX_FRAME_SIZE};

/// How long a client gets to finish the secure handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const INBOX_CAPACITY: usize = 1024;

/// Error type reported for frames that cannot be decoded.
pub const CODEC_ERROR_TYPE: &str = "sqlite_rx.CodecError";

/// Decodes a request frame, runs it and encodes the reply.
#[derive(Debug)]
pub struct QueryHandler {
    database: Database,
    max_response_size: usize,
}

impl QueryHandler {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            max_response_size: MAX_FRAME_SIZE - SEAL_OVERHEAD,
        }
    }

    /// Largest encoded reply sent as-is; bigger results are replaced by an
    /// error reply so the connection stays usable.
    pub fn with_max_response_size(mut self, limit: usize) -> Self {
        self.max_response_size = limit;
        self
    }

    /// Undecodable input and oversized results become an error
    /// [`Response`]. `None` means not even an error reply could be encoded
    /// and the connection should be closed.
    pub fn handle(&mut self, message: &[u8]) -> Option<Vec<u8>> {
        let response = match codec::decode::<Request>(message) {
            Ok(request) => {
                debug!("Request from {}: {}", request.client_id, request.query);
                self.database.execute(&request)
            }
            Err(e) => {
                error!("Exception while preparing response: {e}");
                codec_failure(e)
            }
        };

        let encoded = match codec::encode(&response) {
            Ok(bytes) if bytes.len() <= self.max_response_size => return Some(bytes),
            Ok(bytes) => {
                error!(
                    "Response of {} bytes exceeds the {} byte limit",
                    bytes.len(),
                    self.max_response_size
                );
                codec::encode(&codec_failure(format!(
                    "response of {} bytes exceeds maximum frame size",
                    bytes.len()
                )))
            }
            Err(e) => {
                error!("Failed to encode response: {e}");
                codec::encode(&codec_failure(e))
            }
        };

        match encoded {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode error response, closing connection: {e}");
                None
            }
        }
    }
}

fn codec_failure(reason: impl std::fmt::Display) -> Response {
    Response::failure(ErrorInfo::new(
        CODEC_ERROR_TYPE,
        format!("{CODEC_ERROR_TYPE}: {reason}"),
    ))
}

struct Inbound {
    payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// A validated server, not yet listening.
#[derive(Debug)]
pub struct SQLiteServer {
    config: ServerConfig,
    endpoint: Endpoint,
    policy: AuthorizationPolicy,
    security: Option<ServerSecurity>,
    backup: Option<BackupJob>,
}

impl SQLiteServer {
    /// Validates the configuration and loads key material. Nothing is bound
    /// yet, so every configuration error surfaces here.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let endpoint = config.endpoint()?;

        if config.use_auth && !config.use_encryption {
            return Err(ConfigError::AuthWithoutEncryption.into());
        }

        let policy = match &config.authorization {
            Some(policy) => AuthorizationPolicy::from_config(policy)?,
            None => AuthorizationPolicy::default(),
        };

        let backup = match &config.backup_database {
            Some(target) => Some(
                BackupJob::new(&config.database, target, config.backup_interval()?)?
                    .with_pages_per_step(config.backup_pages_per_step),
            ),
            None => None,
        };

        let security = if config.use_encryption {
            let manager = KeyManager::new(config.curve_dir.clone());
            Some(manager.setup_secure_server(config.server_key_id.as_deref(), config.use_auth)?)
        } else {
            None
        };

        Ok(Self {
            config,
            endpoint,
            policy,
            security,
            backup,
        })
    }

    /// Opens the database and binds the listener.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let database = Database::open(&self.config.database, self.policy)?;
        let listener = TcpListener::bind(self.endpoint.authority()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Listening on tcp://{local_addr} (database {}, encryption {}, authentication {})",
            self.config.database,
            self.security.is_some(),
            self.config.use_auth
        );

        Ok(BoundServer {
            listener,
            local_addr,
            handler: QueryHandler::new(database),
            security: self.security.map(Arc::new),
            backup: self.backup,
        })
    }

    /// Binds and serves until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.bind().await?.run(shutdown).await
    }

    /// Serves on a single-threaded runtime until SIGINT or SIGTERM, then
    /// exits the process.
    pub fn start(self) -> Result<Infallible, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.serve(shutdown_signal()))?;
        drop(runtime);

        info!("Server stopped");
        std::process::exit(0)
    }
}

/// A server with its listener bound.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: QueryHandler,
    security: Option<Arc<ServerSecurity>>,
    backup: Option<BackupJob>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the event loop until `shutdown` resolves. The listener is
    /// closed and the backup timer cancelled before this returns.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            local_addr,
            mut handler,
            security,
            backup,
        } = self;

        let mut scheduler = match backup {
            Some(job) => Some(BackupScheduler::start(job)?),
            None => None,
        };

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Inbound>(INBOX_CAPACITY);
        let acceptor = tokio::spawn(accept_loop(listener, inbox_tx, security));
        info!("Server event loop started on tcp://{local_addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                inbound = inbox_rx.recv() => {
                    let Some(Inbound { payload, reply }) = inbound else {
                        break;
                    };
                    match handler.handle(&payload) {
                        Some(response) => {
                            if reply.send(response).is_err() {
                                debug!("Client went away before the reply was sent");
                            }
                        }
                        None => drop(reply),
                    }
                }
            }
        }

        acceptor.abort();
        let _ = acceptor.await;
        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.cancel();
        }
        info!("Server event loop stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<Inbound>,
    security: Option<Arc<ServerSecurity>>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {peer}");
                    let inbox = inbox.clone();
                    let security = security.clone();
                    connections.spawn(async move {
                        match serve_connection(stream, inbox, security).await {
                            Ok(()) => debug!("Connection from {peer} closed"),
                            Err(TransportError::Rejected) => {
                                warn!("Rejected client {peer}: key not authorized")
                            }
                            Err(e) => warn!("Connection error from {peer}: {e}"),
                        }
                    });
                }
                Err(e) => error!("Accept error: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    inbox: mpsc::Sender<Inbound>,
    security: Option<Arc<ServerSecurity>>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;

    let mut channel = match security.as_deref() {
        Some(security) => {
            let cipher = tokio::time::timeout(HANDSHAKE_TIMEOUT, secure(&mut stream, security))
                .await
                .map_err(|_| TransportError::Timeout)??;
            Channel::sealed(stream, cipher)
        }
        None => Channel::plain(stream),
    };

    while let Some(payload) = channel.recv().await? {
        let (reply, answer) = oneshot::channel();
        if inbox.send(Inbound { payload, reply }).await.is_err() {
            return Ok(());
        }
        let Ok(response) = answer.await else {
            return Ok(());
        };
        channel.send(&response).await?;
    }
    Ok(())
}

async fn secure(
    stream: &mut TcpStream,
    security: &ServerSecurity,
) -> Result<SessionCipher, TransportError> {
    let hello = ServerHandshake::read_hello(stream, &security.keys).await?;
    if let Some(authenticator) = &security.authenticator {
        if !authenticator.verify(hello.client_key()).await {
            return Err(TransportError::Rejected);
        }
    }
    hello.complete(stream, &security.keys).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
