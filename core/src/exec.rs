//! Remote command execution with a per-command time limit

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::ErrorKind;
use crate::task::run_until;
use crate::transport::Connection;
use crate::{CommandTask, Completion, NodeOutcome, Result};

/// Keyword prepended when elevation is requested
pub const ELEVATION_PREFIX: &str = "sudo ";

/// Command line actually sent to the host
pub fn command_line(task: &CommandTask) -> String {
    if task.use_elevation {
        format!("{}{}", ELEVATION_PREFIX, task.command)
    } else {
        task.command.clone()
    }
}

/// Run `task` on an open connection
///
/// Exceeding `task.timeout` or cancellation of `token` yields
/// [`NodeOutcome::Timeout`] and asks the remote side to kill the process.
/// `started` is when the host task began, so reported durations include the
/// connection setup.
#[instrument(skip(connection, task, token), fields(command = %task.command))]
pub async fn run_command(
    connection: &dyn Connection,
    task: &CommandTask,
    token: &CancellationToken,
    started: Instant,
) -> Result<NodeOutcome> {
    let line = command_line(task);
    let mut session = connection.open_exec(&line).await?;

    let run = async {
        // Commands get no stdin
        let _ = session.shutdown().await;

        let mut stdout = Vec::new();
        session.read_to_end(&mut stdout).await?;
        let exit = session.wait().await?;
        Ok::<_, crate::Error>((stdout, exit))
    };

    let (stdout, exit) = match run_until(run, Some(effective_timeout(task)), token).await {
        Ok(result) => result?,
        Err(reason) => {
            let elapsed = started.elapsed();
            warn!(?reason, elapsed_ms = elapsed.as_millis() as u64, "Command interrupted");
            if !session.kill() {
                debug!("Session already gone, nothing to signal");
            }
            return Ok(NodeOutcome::Timeout { elapsed });
        }
    };

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = exit.stderr_text();

    let outcome = match (exit.exit_status, exit.exit_signal) {
        (Some(status), _) => NodeOutcome::Success {
            duration: started.elapsed(),
            completion: Completion::Command {
                exit_code: status as i32,
                stdout,
                stderr,
            },
        },
        (None, Some(signal)) => NodeOutcome::failure(
            ErrorKind::Command,
            format!("command killed by signal {}", signal),
        ),
        (None, None) => NodeOutcome::failure(
            ErrorKind::Connection,
            "session closed without an exit status",
        ),
    };

    Ok(outcome)
}

/// Time limit actually applied to a command
pub fn effective_timeout(task: &CommandTask) -> Duration {
    if task.timeout.is_zero() {
        crate::types::DEFAULT_COMMAND_TIMEOUT
    } else {
        task.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RemoteSession, SessionControl, SessionExit};
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Scripted remote side for one command
    #[derive(Clone)]
    enum Script {
        Exit { status: u32, stdout: &'static str, stderr: &'static str },
        Signalled,
        Hang,
    }

    #[derive(Clone)]
    struct FakeConnection {
        script: Script,
        commands: Arc<Mutex<Vec<String>>>,
        signals: Arc<Mutex<Vec<SessionControl>>>,
    }

    impl FakeConnection {
        fn new(script: Script) -> Self {
            Self {
                script,
                commands: Arc::default(),
                signals: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn open_exec(&self, command: &str) -> Result<RemoteSession> {
            self.commands.lock().unwrap().push(command.to_string());
            let (session, mut remote) = RemoteSession::pair();
            let script = self.script.clone();
            let signals = self.signals.clone();

            tokio::spawn(async move {
                match script {
                    Script::Exit { status, stdout, stderr } => {
                        remote.io.write_all(stdout.as_bytes()).await.unwrap();
                        drop(remote.io);
                        let _ = remote.exit.send(Ok(SessionExit {
                            exit_status: Some(status),
                            exit_signal: None,
                            stderr: stderr.as_bytes().to_vec(),
                        }));
                    }
                    Script::Signalled => {
                        drop(remote.io);
                        let _ = remote.exit.send(Ok(SessionExit {
                            exit_status: None,
                            exit_signal: Some("KILL".to_string()),
                            stderr: Vec::new(),
                        }));
                    }
                    Script::Hang => {
                        while let Some(request) = remote.control.recv().await {
                            signals.lock().unwrap().push(request);
                        }
                    }
                }
            });
            Ok(session)
        }
    }

    #[test]
    fn test_elevation_prefix() {
        let task = CommandTask::new("systemctl restart nginx").with_elevation(true);
        assert_eq!(command_line(&task), "sudo systemctl restart nginx");

        let plain = CommandTask::new("uptime");
        assert_eq!(command_line(&plain), "uptime");
    }

    #[test]
    fn test_effective_timeout() {
        let zero = CommandTask::new("uptime").with_timeout(Duration::ZERO);
        assert_eq!(effective_timeout(&zero), Duration::from_secs(30));
        let short = CommandTask::new("uptime").with_timeout(Duration::from_millis(200));
        assert_eq!(effective_timeout(&short), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_sends_elevated_command() {
        let conn = FakeConnection::new(Script::Exit { status: 0, stdout: "", stderr: "" });
        let task = CommandTask::new("whoami").with_elevation(true);
        run_command(&conn, &task, &CancellationToken::new(), Instant::now())
            .await
            .unwrap();
        assert_eq!(conn.commands.lock().unwrap().as_slice(), ["sudo whoami"]);
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let conn = FakeConnection::new(Script::Exit {
            status: 3,
            stdout: "partial\n",
            stderr: "boom\n",
        });
        let outcome = run_command(
            &conn,
            &CommandTask::new("false"),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap();

        match outcome {
            NodeOutcome::Success {
                completion: Completion::Command { exit_code, stdout, stderr },
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stdout, "partial\n");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_killed_by_signal_is_command_failure() {
        let conn = FakeConnection::new(Script::Signalled);
        let outcome = run_command(
            &conn,
            &CommandTask::new("sleep 100"),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            NodeOutcome::Failure { kind: ErrorKind::Command, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_returns_promptly_and_signals() {
        let conn = FakeConnection::new(Script::Hang);
        let task = CommandTask::new("sleep 10").with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = run_command(&conn, &task, &CancellationToken::new(), Instant::now())
            .await
            .unwrap();
        let wall = started.elapsed();

        match outcome {
            NodeOutcome::Timeout { elapsed } => {
                assert!(elapsed >= Duration::from_millis(200));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(wall < Duration::from_millis(250), "took {:?}", wall);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.signals.lock().unwrap().as_slice(), [SessionControl::Kill]);
    }

    #[tokio::test]
    async fn test_cancellation_reports_timeout() {
        let conn = FakeConnection::new(Script::Hang);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = run_command(&conn, &CommandTask::new("sleep 10"), &token, Instant::now())
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_exit_report_is_error() {
        struct Vanishing;

        #[async_trait]
        impl Connection for Vanishing {
            async fn open_exec(&self, _command: &str) -> Result<RemoteSession> {
                let (session, remote) = RemoteSession::pair();
                drop(remote);
                Ok(session)
            }
        }

        let err = run_command(
            &Vanishing,
            &CommandTask::new("uptime"),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
    }
}
