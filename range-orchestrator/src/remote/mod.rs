//! Remote command channel
//!
//! One authenticated shell session per command: open, run, capture the
//! combined output, close.

mod ssh;

pub use ssh::SshShell;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("cannot connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("SSH handshake with {host} failed: {detail}")]
    Handshake { host: String, detail: String },
    #[error("SSH authentication to {host} failed: {detail}")]
    Auth { host: String, detail: String },
    #[error("command on {host} failed: {detail}")]
    Exec { host: String, detail: String },
    #[error("SSH session to {host} timed out")]
    Timeout { host: String },
    #[error("SSH worker failed: {0}")]
    Join(String),
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout and stderr, merged in the order the remote wrote them.
    pub output: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `host` and return once the channel has closed.
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError>;
}
