//! Running a server as an isolated child process.
//!
//! A crash in one server process cannot take down its supervisor or other
//! servers, and servers bound to different addresses run in parallel.

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{Endpoint, ServerConfig};
use crate::error::{ConfigError, ServerError};

const READY_POLL: Duration = Duration::from_millis(50);

/// A `sqlite-server` child process.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    endpoint: Endpoint,
}

impl ServerProcess {
    /// Starts `binary` with `config` rendered as command-line arguments.
    pub fn spawn(binary: impl AsRef<Path>, config: &ServerConfig) -> Result<Self, ServerError> {
        let endpoint = config.endpoint()?;

        let child = Command::new(binary.as_ref())
            .args(command_line(config)?)
            .stdin(Stdio::null())
            .spawn()?;
        info!("Started server process {} for {endpoint}", child.id());

        Ok(Self { child, endpoint })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Blocks until the server accepts TCP connections.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let addr = self.ready_addr()?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("server process exited early with {status}"),
                )
                .into());
            }
            if TcpStream::connect_timeout(&addr, READY_POLL).is_ok() {
                debug!("Server process {} is accepting on {addr}", self.child.id());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("server process did not listen on {addr} within {timeout:?}"),
                )
                .into());
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Waits up to `timeout` for the process to exit on its own.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(READY_POLL);
        }
    }

    /// Kills the process and reaps it.
    pub fn stop(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()?;
        let status = self.child.wait()?;
        info!("Server process {} stopped ({status})", self.child.id());
        Ok(())
    }

    fn ready_addr(&self) -> io::Result<SocketAddr> {
        let host = match self.endpoint.host() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            host => host,
        };
        (host, self.endpoint.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to"))
    }
}

/// One flag per setting. The authorization policy has no flag and travels
/// as inline TOML.
pub(crate) fn command_line(config: &ServerConfig) -> Result<Vec<OsString>, ConfigError> {
    let mut args: Vec<OsString> = vec![
        "--tcp-address".into(),
        config.bind_address.clone().into(),
        "--database".into(),
        config.database.clone().into(),
    ];
    if config.use_encryption {
        args.push("--curvezmq".into());
    }
    if config.use_auth {
        args.push("--zap".into());
    }
    if let Some(dir) = &config.curve_dir {
        args.push("--curve-dir".into());
        args.push(dir.clone().into());
    }
    if let Some(key_id) = &config.server_key_id {
        args.push("--key-id".into());
        args.push(key_id.clone().into());
    }
    if let Some(target) = &config.backup_database {
        args.push("--backup-database".into());
        args.push(target.clone().into());
    }
    args.push("--backup-interval".into());
    args.push(config.backup_interval_secs.to_string().into());
    args.push(format!("--backup-pages-per-step={}", config.backup_pages_per_step).into());

    if let Some(policy) = &config.authorization {
        let policy_only = ServerConfig {
            authorization: Some(policy.clone()),
            ..ServerConfig::default()
        };
        args.push("--config-toml".into());
        args.push(policy_only.to_toml()?.into());
    }
    Ok(args)
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop server process {}: {e}", self.child.id());
        }
    }
}
