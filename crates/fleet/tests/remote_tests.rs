//! Integration tests for the remote executor and log tailer.
//!
//! A scripted shell replays a fixed sequence of outcomes so that retry
//! timing and container discovery can be checked on a paused clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet::config::TailConfig;
use fleet::remote::{Chunk, RemoteShell};
use fleet::tail::LogTailer;
use fleet::{
    Authority, AuthorityDistribution, Backend, BackendKind, Endpoint, Fleet, FleetConfig,
    FleetError, Node, RemoteExecutor, RetryPolicy,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted shell
// =============================================================================

/// Replays one scripted outcome per `exec` call; an exhausted script
/// succeeds with no output.
#[derive(Default)]
struct ScriptedShell {
    script: Mutex<VecDeque<fleet::Result<String>>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedShell {
    fn new(script: Vec<fleet::Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            commands: Mutex::default(),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn exec(&self, _host: &str, command: &str, sink: mpsc::Sender<Chunk>) -> fleet::Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(output)) if !output.is_empty() => {
                let _ = sink.send(Ok(output.into_bytes())).await;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn copy(&self, _host: &str, _dir: &str, _file: &str, _content: &[u8]) -> fleet::Result<()> {
        Ok(())
    }
}

fn transient() -> fleet::Result<String> {
    Err(FleetError::Transport("connection refused".to_string()))
}

fn executor(shell: &Arc<ScriptedShell>) -> RemoteExecutor {
    RemoteExecutor::new(shell.clone(), RetryPolicy::default())
}

// =============================================================================
// Remote executor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_retries_transient_failures_with_backoff() {
    let shell = ScriptedShell::new(vec![
        transient(),
        transient(),
        transient(),
        transient(),
        Ok("hello\n".to_string()),
    ]);
    let start = Instant::now();
    let output = executor(&shell)
        .run("203.0.113.7", "echo hello", &CancellationToken::new())
        .read_to_string()
        .await
        .unwrap();

    assert_eq!(output, "hello\n");
    // 1s + 1.5s + 2.25s + 3.375s
    assert_eq!(start.elapsed(), Duration::from_millis(8125));
    assert_eq!(shell.commands().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let shell = ScriptedShell::new(vec![Err(FleetError::Authentication(
        "publickey denied".to_string(),
    ))]);
    let start = Instant::now();
    let err = executor(&shell)
        .run("203.0.113.7", "uptime", &CancellationToken::new())
        .read_to_end()
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Authentication(_)));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(shell.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_nonzero_exit_is_not_retried() {
    let shell = ScriptedShell::new(vec![Err(FleetError::RemoteCommand {
        command: "cat /missing".to_string(),
        status: 1,
    })]);
    let err = executor(&shell)
        .read("203.0.113.7", "/missing", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::RemoteCommand { status: 1, .. }));
    assert_eq!(shell.commands(), vec!["cat /missing"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_retrying() {
    let shell = ScriptedShell::new((0..100).map(|_| transient()).collect());
    let cancel = CancellationToken::new();
    let stream = executor(&shell).run("203.0.113.7", "uptime", &cancel);

    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();
    let err = stream.read_to_end().await.unwrap_err();

    assert!(matches!(err, FleetError::Cancelled));
    assert!(shell.commands().len() < 5);
}

// =============================================================================
// Log tailer
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tailer_waits_for_container_then_follows() {
    let shell = ScriptedShell::new(vec![
        Ok(String::new()),
        Ok(String::new()),
        Ok("3f2a\n".to_string()),
        Ok("booting\n".to_string()),
    ]);
    let tailer = LogTailer::new(executor(&shell), &TailConfig::default());

    let start = Instant::now();
    let output = tailer
        .tail("203.0.113.7", &CancellationToken::new())
        .await
        .unwrap()
        .read_to_string()
        .await
        .unwrap();

    assert_eq!(output, "booting\n");
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    let commands = shell.commands();
    assert_eq!(commands.len(), 4);
    assert_eq!(commands[0], tailer.list_command());
    assert_eq!(commands[3], "docker container logs --follow 3f2a");
}

#[tokio::test(start_paused = true)]
async fn test_tailer_rejects_multiple_containers() {
    let shell = ScriptedShell::new(vec![Ok("3f2a\n9b1c\n".to_string())]);
    let tailer = LogTailer::new(executor(&shell), &TailConfig::default());

    let err = tailer
        .tail("203.0.113.7", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::AmbiguousTarget(_)));
    assert_eq!(shell.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tailer_gives_up_when_cancelled() {
    let shell = ScriptedShell::new(Vec::new());
    let tailer = LogTailer::new(executor(&shell), &TailConfig::default());
    let cancel = CancellationToken::new();

    let on_timer = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        on_timer.cancel();
    });
    let err = tailer.tail("203.0.113.7", &cancel).await.unwrap_err();

    assert!(matches!(err, FleetError::Cancelled));
    assert_eq!(shell.commands().len(), 3);
}

// =============================================================================
// Fleet facade
// =============================================================================

struct ShellOnlyBackend;

#[async_trait]
impl Backend for ShellOnlyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ComputeInstance
    }

    fn owner(&self) -> &str {
        "fleet"
    }

    fn authority_distribution(&self) -> AuthorityDistribution {
        AuthorityDistribution::Copy
    }

    async fn create(&self, name: &str, _cancel: &CancellationToken) -> fleet::Result<Node> {
        Err(FleetError::create(name, "not used"))
    }

    async fn delete(&self, _name: &str) -> fleet::Result<()> {
        Ok(())
    }

    async fn list(&self, _owner: &str) -> fleet::Result<Vec<Node>> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_fleet_tail_falls_back_to_remote_shell() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(Authority::load_or_create(&dir.path().join("fleet.pem")).unwrap());
    let shell = ScriptedShell::new(vec![Ok("3f2a\n".to_string()), Ok("ready\n".to_string())]);
    let fleet = Fleet::with_parts(
        FleetConfig::default(),
        Arc::new(ShellOnlyBackend),
        authority,
        Some(executor(&shell)),
    );
    let node = Node::observed(
        "fleet-00",
        BackendKind::ComputeInstance,
        "fleet",
        Some(Endpoint::new("203.0.113.7", 443)),
    );

    let output = fleet
        .tail(&node, &CancellationToken::new())
        .await
        .unwrap()
        .read_to_string()
        .await
        .unwrap();
    assert_eq!(output, "ready\n");
}
