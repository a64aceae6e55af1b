//! Remote executor: retried copy and command execution against nodes.
//!
//! Every operation goes through one [`RetryPolicy`]. Authentication failures
//! and nonzero exits end the operation immediately; connection-level errors
//! are retried with backoff until the caller's [`CancellationToken`] fires.

pub mod retry;
pub mod ssh;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};

pub use retry::{ErrorClass, RetryPolicy};
pub use ssh::{RemoteShell, Ssh2Shell};

/// One piece of remote output, or the error that ended the stream.
pub type Chunk = Result<Vec<u8>>;

const STREAM_CAPACITY: usize = 64;

/// Live output of a remote command.
///
/// The stream stays open while the command runs and closes when it exits.
/// If the command failed, the last item is the error.
#[derive(Debug)]
pub struct RemoteStream {
    rx: mpsc::Receiver<Chunk>,
}

impl RemoteStream {
    /// Create a connected sender/stream pair.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<Chunk>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (tx, Self { rx })
    }

    /// Next chunk, or `None` once the stream is closed.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Drain the stream.
    ///
    /// # Errors
    /// Returns the error that terminated the stream, if any.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Drain the stream as UTF-8 (lossy).
    ///
    /// # Errors
    /// Returns the error that terminated the stream, if any.
    pub async fn read_to_string(self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl futures::Stream for RemoteStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Retrying executor over a [`RemoteShell`].
#[derive(Clone)]
pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    policy: RetryPolicy,
}

impl RemoteExecutor {
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>, policy: RetryPolicy) -> Self {
        Self { shell, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start `command` on `host` and return its output stream.
    ///
    /// The command runs on a background task. Transient failures are
    /// retried until `cancel` fires or the stream is dropped, but only while
    /// no output has been delivered: once the command has produced output,
    /// any failure ends the stream. A terminal error, or
    /// [`FleetError::Cancelled`], is delivered as the stream's last item.
    #[must_use]
    pub fn run(&self, host: &str, command: &str, cancel: &CancellationToken) -> RemoteStream {
        let (tx, stream) = RemoteStream::channel();
        let shell = self.shell.clone();
        let policy = self.policy;
        let host = host.to_string();
        let command = command.to_string();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let label = format!("run `{command}` on {host}");
            let result = policy
                .retry(&cancel, &label, || attempt(shell.as_ref(), &host, &command, &tx))
                .await
                .and_then(std::convert::identity);
            match result {
                Ok(()) => debug!(host = %host, command = %command, "Remote command finished"),
                Err(e) => {
                    warn!(host = %host, command = %command, "Remote command failed: {e}");
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        stream
    }

    /// Copy `content` to `/tmp/<dir>/<file>` on `host`.
    ///
    /// # Errors
    /// Returns the terminal error, or [`FleetError::Cancelled`].
    pub async fn copy(
        &self,
        host: &str,
        dir: &str,
        file: &str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let label = format!("copy {file} to {host}");
        self.policy
            .retry(cancel, &label, || self.shell.copy(host, dir, file, content))
            .await
    }

    /// Read a file on `host`.
    ///
    /// # Errors
    /// Returns [`FleetError::RemoteCommand`] if the file cannot be read.
    pub async fn read(&self, host: &str, path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        if path.is_empty() {
            return Err(FleetError::Configuration("path is required".into()));
        }
        self.run(host, &format!("cat {path}"), cancel).read_to_end().await
    }
}

/// One execution of `command`.
///
/// The outer error is retryable and only returned before any output has
/// been forwarded; the inner result is final.
async fn attempt(
    shell: &dyn RemoteShell,
    host: &str,
    command: &str,
    tx: &mpsc::Sender<Chunk>,
) -> Result<Result<()>> {
    if tx.is_closed() {
        debug!(host, command, "Output stream dropped, not running");
        return Ok(Err(FleetError::Cancelled));
    }

    let (attempt_tx, mut attempt_rx) = mpsc::channel(STREAM_CAPACITY);
    let forward = async move {
        let mut forwarded = false;
        while let Some(chunk) = attempt_rx.recv().await {
            forwarded = true;
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        forwarded
    };
    let (result, forwarded) = tokio::join!(shell.exec(host, command, attempt_tx), forward);

    if forwarded {
        Ok(result)
    } else {
        result.map(Ok)
    }
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures::StreamExt;

    use super::ssh::MockRemoteShell;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_streams_output() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_exec()
            .withf(|host, command, _| host == "10.0.0.2" && command == "cat /etc/hostname")
            .times(1)
            .returning(|_, _, sink| {
                sink.try_send(Ok(b"fleet-00\n".to_vec())).unwrap();
                Ok(())
            });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let out = executor
            .read("10.0.0.2", "/etc/hostname", &cancel)
            .await
            .unwrap();
        assert_eq!(out, b"fleet-00\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_ends_stream_with_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut shell = MockRemoteShell::new();
        shell.expect_exec().returning(move |_, command, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FleetError::RemoteCommand {
                command: command.to_string(),
                status: 1,
            })
        });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let mut stream = executor.run("10.0.0.2", "cat /missing", &cancel);

        let last = stream.next().await.unwrap();
        assert!(matches!(last, Err(FleetError::RemoteCommand { status: 1, .. })));
        assert!(stream.next().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut shell = MockRemoteShell::new();
        shell
            .expect_copy()
            .withf(|_, dir, file, content| dir == "secrets" && file == "fleet.pem" && content == b"pem")
            .returning(move |_, _, _, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FleetError::Transport("connection refused".into()))
                } else {
                    Ok(())
                }
            });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let cancel = CancellationToken::new();
        executor
            .copy("10.0.0.2", "secrets", "fleet.pem", b"pem", &cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_output_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut shell = MockRemoteShell::new();
        shell.expect_exec().returning(move |_, _, sink| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                sink.try_send(Ok(b"line1\n".to_vec())).unwrap();
                Err(FleetError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )))
            } else {
                sink.try_send(Ok(b"line1\nline2\n".to_vec())).unwrap();
                Ok(())
            }
        });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let mut stream = executor.run("10.0.0.2", "tail -n 2 /var/log/boot.log", &CancellationToken::new());

        assert_eq!(stream.next().await.unwrap().unwrap(), b"line1\n");
        assert!(matches!(stream.next().await, Some(Err(FleetError::Io(_)))));
        assert!(stream.next().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_keeps_arrival_order() {
        let mut shell = MockRemoteShell::new();
        shell.expect_exec().times(1).returning(|_, _, sink| {
            for line in ["pulling image\n", "warning: slow mirror\n", "started\n"] {
                sink.try_send(Ok(line.as_bytes().to_vec())).unwrap();
            }
            Ok(())
        });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let output = executor
            .run("10.0.0.2", "docker container logs --follow 3f2a", &CancellationToken::new())
            .read_to_string()
            .await
            .unwrap();
        assert_eq!(output, "pulling image\nwarning: slow mirror\nstarted\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut shell = MockRemoteShell::new();
        shell.expect_exec().returning(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FleetError::Transport("connection refused".into()))
        });

        let executor = RemoteExecutor::new(Arc::new(shell), RetryPolicy::default());
        let stream = executor.run("10.0.0.2", "uptime", &CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_requires_path() {
        let executor = RemoteExecutor::new(Arc::new(MockRemoteShell::new()), RetryPolicy::default());
        let err = executor
            .read("10.0.0.2", "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }
}
