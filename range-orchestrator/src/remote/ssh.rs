//! SSH implementation of the remote command channel (libssh2).
//!
//! libssh2 is blocking, so every session runs on tokio's blocking pool.

use async_trait::async_trait;
use ssh2::{ErrorCode, ExtendedData, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use super::{CommandOutput, RemoteError, RemoteShell};
use crate::config::SshConfig;

/// libssh2's LIBSSH2_ERROR_TIMEOUT
const SSH_ERROR_TIMEOUT: i32 = -9;

#[derive(Clone)]
pub struct SshShell {
    username: String,
    password: String,
    port: u16,
    timeout: Duration,
}

/// Disconnects the session on every exit path.
struct SessionGuard {
    session: Session,
    host: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "done", None) {
            debug!("SSH disconnect from {} failed: {}", self.host, e);
        }
    }
}

impl SshShell {
    pub fn new(cfg: &SshConfig) -> Self {
        Self {
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            port: cfg.port,
            timeout: cfg.connect_timeout(),
        }
    }

    fn map_ssh_error(host: &str, err: ssh2::Error, wrap: impl FnOnce(String, String) -> RemoteError) -> RemoteError {
        if matches!(err.code(), ErrorCode::Session(SSH_ERROR_TIMEOUT)) {
            RemoteError::Timeout { host: host.to_string() }
        } else {
            wrap(host.to_string(), err.to_string())
        }
    }

    fn open(&self, host: &str) -> Result<SessionGuard, RemoteError> {
        let connect_err = |source: std::io::Error| RemoteError::Connect { host: host.to_string(), source };

        let addr = (host, self.port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(connect_err)?;

        let mut session = Session::new().map_err(|e| RemoteError::Handshake {
            host: host.to_string(),
            detail: e.to_string(),
        })?;
        session.set_tcp_stream(tcp);
        // Applies to every blocking libssh2 call on this session.
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| Self::map_ssh_error(host, e, |host, detail| RemoteError::Handshake { host, detail }))?;

        let guard = SessionGuard { session, host: host.to_string() };
        guard
            .session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| Self::map_ssh_error(host, e, |host, detail| RemoteError::Auth { host, detail }))?;

        Ok(guard)
    }

    fn run_blocking(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let guard = self.open(host)?;
        let exec_err = |e: ssh2::Error| Self::map_ssh_error(host, e, |host, detail| RemoteError::Exec { host, detail });
        let io_err = |e: std::io::Error| RemoteError::Exec {
            host: host.to_string(),
            detail: e.to_string(),
        };

        let mut channel = guard.session.channel_session().map_err(exec_err)?;
        // stderr comes through the stdout stream so neither can fill the window
        channel.handle_extended_data(ExtendedData::Merge).map_err(exec_err)?;
        channel.exec(command).map_err(exec_err)?;

        let mut output = String::new();
        channel.read_to_string(&mut output).map_err(io_err)?;

        channel.wait_close().map_err(exec_err)?;
        let exit_status = channel.exit_status().map_err(exec_err)?;

        Ok(CommandOutput { output, exit_status })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let shell = self.clone();
        let host = host.to_string();
        let command = command.to_string();

        debug!("SSH {}: {}", host, command);
        tokio::task::spawn_blocking(move || shell.run_blocking(&host, &command))
            .await
            .map_err(|e| RemoteError::Join(e.to_string()))?
    }
}
