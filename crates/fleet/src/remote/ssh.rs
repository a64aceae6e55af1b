//! Remote shell over SSH (libssh2).
//!
//! Host keys are not verified: nodes are trusted through the mutual-TLS
//! authority, not through their SSH identity.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SshConfig;
use crate::error::{FleetError, Result};

use super::Chunk;

/// SSH service port on every node.
pub const SSH_PORT: u16 = 22;

/// Transport used by the remote executor.
///
/// `exec` forwards the command's output to `sink` as it is produced and
/// returns once the command exits. Standard error is merged into the same
/// stream in arrival order, so follow-mode commands that log to stderr
/// stream live. A nonzero exit is [`FleetError::RemoteCommand`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Execute `command` on `host`, streaming its output.
    async fn exec(&self, host: &str, command: &str, sink: mpsc::Sender<Chunk>) -> Result<()>;

    /// Write `content` to `/tmp/<dir>/<file>` on `host`, creating the directory.
    async fn copy(&self, host: &str, dir: &str, file: &str, content: &[u8]) -> Result<()>;
}

/// [`RemoteShell`] backed by libssh2 sessions on blocking threads.
#[derive(Debug, Clone)]
pub struct Ssh2Shell {
    user: String,
    private_key: PathBuf,
    connect_timeout: Duration,
}

impl Ssh2Shell {
    #[must_use]
    pub fn new(user: impl Into<String>, private_key: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
            connect_timeout,
        }
    }

    /// Build a shell for the invoking user's default Compute Engine keypair.
    ///
    /// # Errors
    /// Returns a configuration error if the user or home directory is unknown.
    pub fn from_config(config: &SshConfig) -> Result<Self> {
        Ok(Self::new(
            config.resolved_user()?,
            config.resolved_private_key()?,
            config.connect_timeout,
        ))
    }

    fn connect(&self, host: &str) -> Result<Session> {
        let addr = resolve(host)?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| FleetError::Transport(format!("dial {addr}: {e}")))?;

        let mut session =
            Session::new().map_err(|e| FleetError::Transport(format!("ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| FleetError::Transport(format!("ssh handshake with {addr}: {e}")))?;

        session
            .userauth_pubkey_file(&self.user, None, &self.private_key, None)
            .map_err(|e| {
                FleetError::Authentication(format!(
                    "{}@{host} with {}: {e}",
                    self.user,
                    self.private_key.display()
                ))
            })?;
        if !session.authenticated() {
            return Err(FleetError::Authentication(format!(
                "{}@{host}: public key rejected",
                self.user
            )));
        }
        Ok(session)
    }

    /// Run `command`, forwarding output to `sink` or discarding it.
    fn exec_blocking(&self, host: &str, command: &str, sink: Option<&mpsc::Sender<Chunk>>) -> Result<()> {
        let session = self.connect(host)?;
        let mut channel = session.channel_session().map_err(transport)?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(transport)?;
        channel.exec(command).map_err(transport)?;
        debug!(host, command, "Remote command started");

        let mut buf = [0u8; 8192];
        loop {
            let n = channel.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if let Some(sink) = sink {
                if sink.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    // Reader went away; stop forwarding.
                    return Ok(());
                }
            }
        }

        channel.wait_close().map_err(transport)?;
        let status = channel.exit_status().map_err(transport)?;
        if status != 0 {
            return Err(FleetError::RemoteCommand {
                command: command.to_string(),
                status,
            });
        }
        Ok(())
    }

    fn copy_blocking(&self, host: &str, dir: &str, file: &str, content: &[u8]) -> Result<()> {
        let remote_dir = format!("/tmp/{dir}");
        self.exec_blocking(host, &format!("mkdir -p {remote_dir}"), None)?;

        let session = self.connect(host)?;
        let remote_path = format!("{remote_dir}/{file}");
        let size = u64::try_from(content.len()).unwrap_or(u64::MAX);
        let mut channel = session
            .scp_send(Path::new(&remote_path), 0o644, size, None)
            .map_err(transport)?;
        channel.write_all(content)?;
        channel.send_eof().map_err(transport)?;
        channel.wait_eof().map_err(transport)?;
        channel.close().map_err(transport)?;
        channel.wait_close().map_err(transport)?;
        debug!(host, path = %remote_path, bytes = content.len(), "Copied file");
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for Ssh2Shell {
    async fn exec(&self, host: &str, command: &str, sink: mpsc::Sender<Chunk>) -> Result<()> {
        let shell = self.clone();
        let host = host.to_string();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || shell.exec_blocking(&host, &command, Some(&sink)))
            .await
            .map_err(|e| FleetError::Task(e.to_string()))?
    }

    async fn copy(&self, host: &str, dir: &str, file: &str, content: &[u8]) -> Result<()> {
        let shell = self.clone();
        let host = host.to_string();
        let dir = dir.to_string();
        let file = file.to_string();
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || shell.copy_blocking(&host, &dir, &file, &content))
            .await
            .map_err(|e| FleetError::Task(e.to_string()))?
    }
}

fn resolve(host: &str) -> Result<SocketAddr> {
    (host, SSH_PORT)
        .to_socket_addrs()
        .map_err(|e| FleetError::Transport(format!("resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| FleetError::Transport(format!("no address for {host}")))
}

fn transport(err: ssh2::Error) -> FleetError {
    FleetError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_uses_ssh_port() {
        let addr = resolve("127.0.0.1").unwrap();
        assert_eq!(addr.port(), 22);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let shell = Ssh2Shell::new("fleet", "/nonexistent/key", Duration::from_millis(200));
        let (tx, _rx) = mpsc::channel(1);
        // Reserved TEST-NET-1 address, never routable.
        let err = shell.exec("192.0.2.1", "true", tx).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
