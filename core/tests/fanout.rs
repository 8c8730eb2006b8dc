//! Fan-out behaviour against an in-memory connector

use async_trait::async_trait;
use nodectl_core::{
    CancellationToken, ClientConfig, CommandTask, Completion, Connection, Connector,
    CredentialOptions, Engine, Error, ErrorKind, EventKind, EventSink, HostTarget, NodeOutcome,
    NodeStatus, Operation, OperationOptions, RemoteSession, ResolverEnv, SessionExit,
    TransferTask,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

/// How a fake host behaves
#[derive(Clone)]
enum Behavior {
    /// Commands print their own text and exit 0; transfers are accepted
    Healthy,
    Refuse,
    /// Handshake never completes within the connect timeout
    HandshakeTimeout,
    /// Connects but never answers a command
    Hang,
    /// Connection succeeds after a delay
    Slow(Duration),
}

#[derive(Default)]
struct FakeNet {
    behaviors: HashMap<String, Behavior>,
    /// Bytes received by each host's sink
    received: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeNet {
    fn with(mut self, host: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(host.to_string(), behavior);
        self
    }
}

struct FakeConn {
    host: String,
    behavior: Behavior,
    received: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Connector for FakeNet {
    async fn connect(
        &self,
        target: &HostTarget,
        _config: &ClientConfig,
    ) -> nodectl_core::Result<Box<dyn Connection>> {
        let behavior = self
            .behaviors
            .get(&target.host)
            .cloned()
            .unwrap_or(Behavior::Healthy);

        match behavior {
            Behavior::Refuse => {
                return Err(Error::ConnectionError(format!(
                    "SSH connection failed: {} refused",
                    target.host
                )))
            }
            Behavior::HandshakeTimeout => return Err(Error::Timeout(Duration::from_secs(30))),
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        Ok(Box::new(FakeConn {
            host: target.host.clone(),
            behavior,
            received: self.received.clone(),
            commands: self.commands.clone(),
        }))
    }
}

#[async_trait]
impl Connection for FakeConn {
    async fn open_exec(&self, command: &str) -> nodectl_core::Result<RemoteSession> {
        self.commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let (session, remote) = RemoteSession::pair();
        let behavior = self.behavior.clone();
        let host = self.host.clone();
        let received = self.received.clone();
        let command = command.to_string();

        tokio::spawn(async move {
            if matches!(behavior, Behavior::Hang) {
                let _keep = remote;
                std::future::pending::<()>().await;
                return;
            }

            if command.starts_with("scp -t ") {
                let mut reader = BufReader::new(remote.io);
                reader.get_mut().write_all(&[0]).await.unwrap();
                let mut header = String::new();
                reader.read_line(&mut header).await.unwrap();
                let size: usize = header.split(' ').nth(1).unwrap().parse().unwrap();
                reader.get_mut().write_all(&[0]).await.unwrap();
                let mut body = vec![0u8; size + 1];
                reader.read_exact(&mut body).await.unwrap();
                body.pop();
                received.lock().unwrap().insert(host, body);
                reader.get_mut().write_all(&[0]).await.unwrap();
                let mut rest = Vec::new();
                let _ = reader.read_to_end(&mut rest).await;
                drop(reader);
                let _ = remote.exit.send(Ok(SessionExit {
                    exit_status: Some(0),
                    ..Default::default()
                }));
            } else if command.starts_with("cat ") {
                let mut io = remote.io;
                let body = received.lock().unwrap().get(&host).cloned().unwrap_or_default();
                io.write_all(&body).await.unwrap();
                drop(io);
                let _ = remote.exit.send(Ok(SessionExit {
                    exit_status: Some(0),
                    ..Default::default()
                }));
            } else if command.starts_with("xxhsum ") {
                drop(remote.io);
                let _ = remote.exit.send(Ok(SessionExit {
                    exit_status: Some(127),
                    ..Default::default()
                }));
            } else {
                let mut io = remote.io;
                io.write_all(format!("{}\n", command).as_bytes()).await.unwrap();
                drop(io);
                let _ = remote.exit.send(Ok(SessionExit {
                    exit_status: Some(0),
                    ..Default::default()
                }));
            }
        });

        Ok(session)
    }
}

fn env() -> ResolverEnv {
    ResolverEnv {
        home_dir: None,
        agent_socket: None,
        user: Some("ops".to_string()),
    }
}

fn credentials() -> CredentialOptions {
    CredentialOptions {
        password: Some("pw".to_string()),
        ..Default::default()
    }
}

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn command_options(names: &[&str], task: CommandTask) -> OperationOptions {
    OperationOptions::new(hosts(names), Operation::Command(task)).with_credentials(credentials())
}

#[tokio::test]
async fn test_one_outcome_per_host() {
    for n in [0usize, 1, 5, 20] {
        let names: Vec<String> = (0..n).map(|i| format!("node{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let engine = Engine::new(Arc::new(FakeNet::default()));

        let result = engine
            .run(
                &command_options(&refs, CommandTask::new("uptime")),
                &env(),
                EventSink::none(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), n);
        assert_eq!(result.summary().as_tuple(), (n, 0, 0));
        for name in &names {
            assert!(result.get(name).is_some(), "missing {}", name);
        }
    }
}

#[tokio::test]
async fn test_failing_hosts_do_not_affect_others() {
    let net = FakeNet::default()
        .with("bad1", Behavior::Refuse)
        .with("bad2", Behavior::Refuse);
    let engine = Engine::new(Arc::new(net));

    let result = engine
        .run(
            &command_options(&["good1", "bad1", "good2", "bad2"], CommandTask::new("hostname")),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.summary().as_tuple(), (2, 2, 0));
    match result.get("good2").unwrap() {
        NodeOutcome::Success {
            completion: Completion::Command { stdout, exit_code, .. },
            ..
        } => {
            assert_eq!(*exit_code, 0);
            assert_eq!(stdout, "hostname\n");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(
        result.get("bad1").unwrap(),
        NodeOutcome::Failure { kind: ErrorKind::Connection, .. }
    ));
    assert!(!result.all_succeeded());
}

#[tokio::test]
async fn test_hanging_host_times_out_without_blocking_others() {
    let net = FakeNet::default().with("stuck", Behavior::Hang);
    let engine = Engine::new(Arc::new(net));
    let task = CommandTask::new("sleep 100").with_timeout(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let result = engine
        .run(
            &command_options(&["a", "stuck", "b"], task),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(result.summary().as_tuple(), (2, 0, 1));
    assert_eq!(result.get("stuck").unwrap().status(), NodeStatus::TimedOut);
}

#[tokio::test]
async fn test_handshake_timeout_counts_as_timed_out() {
    let net = FakeNet::default()
        .with("mute", Behavior::HandshakeTimeout)
        .with("down", Behavior::Refuse);
    let engine = Engine::new(Arc::new(net));

    let result = engine
        .run(
            &command_options(&["up", "mute", "down"], CommandTask::new("true")),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.summary().as_tuple(), (1, 1, 1));
    assert_eq!(result.get("mute").unwrap().status(), NodeStatus::TimedOut);
    assert_eq!(result.get("down").unwrap().status(), NodeStatus::Failed);
}

#[tokio::test]
async fn test_operation_deadline_interrupts_connect() {
    let net = FakeNet::default().with("slow", Behavior::Slow(Duration::from_secs(30)));
    let engine = Engine::new(Arc::new(net));
    let options = command_options(&["fast", "slow"], CommandTask::new("true"))
        .with_deadline(Some(Duration::from_millis(100)));

    let result = engine
        .run(&options, &env(), EventSink::none(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.summary().as_tuple(), (1, 0, 1));
    assert!(matches!(result.get("slow"), Some(NodeOutcome::Timeout { .. })));
}

#[tokio::test]
async fn test_elevation_reaches_transport() {
    let net = FakeNet::default();
    let commands = net.commands.clone();
    let engine = Engine::new(Arc::new(net));

    engine
        .run(
            &command_options(&["node1"], CommandTask::new("apt-get update").with_elevation(true)),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        commands.lock().unwrap().as_slice(),
        [("node1".to_string(), "sudo apt-get update".to_string())]
    );
}

#[tokio::test]
async fn test_duplicate_hosts_run_once() {
    let net = FakeNet::default();
    let commands = net.commands.clone();
    let engine = Engine::new(Arc::new(net));

    let result = engine
        .run(
            &command_options(&["node1", "node2", "node1"], CommandTask::new("true")),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.hosts, vec!["node1", "node2"]);
    assert_eq!(commands.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrency_cap_still_completes_all() {
    let engine = Engine::new(Arc::new(FakeNet::default()));
    let options = command_options(&["a", "b", "c", "d", "e"], CommandTask::new("true"))
        .with_max_concurrency(Some(2));

    let result = engine
        .run(&options, &env(), EventSink::none(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.summary().as_tuple(), (5, 0, 0));
}

#[tokio::test]
async fn test_missing_credentials_abort_before_fan_out() {
    let net = FakeNet::default();
    let commands = net.commands.clone();
    let engine = Engine::new(Arc::new(net));
    let options = OperationOptions::new(hosts(&["a"]), Operation::Command(CommandTask::new("true")));

    let err = engine
        .run(&options, &env(), EventSink::none(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAuthMethodAvailable));
    assert!(commands.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transfer_with_verification() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("release.tar.gz");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&source, &content).unwrap();

    let net = FakeNet::default();
    let received = net.received.clone();
    let engine = Engine::new(Arc::new(net));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = events.clone();
        EventSink::new(move |event| {
            events
                .lock()
                .unwrap()
                .push((event.host.clone(), event.kind.clone()))
        })
    };

    let task = TransferTask::new(&source, "/opt/releases").with_verify(true);
    let options = OperationOptions::new(hosts(&["n1", "n2"]), Operation::Transfer(task))
        .with_credentials(credentials());

    let result = engine
        .run(&options, &env(), sink, CancellationToken::new())
        .await
        .unwrap();

    assert!(result.all_succeeded(), "{:?}", result);
    assert!(result.local_digest.is_some());
    for host in ["n1", "n2"] {
        let checksum = result.get(host).unwrap().checksum().unwrap();
        assert!(checksum.verified);
        assert_eq!(received.lock().unwrap().get(host), Some(&content));
    }

    let events = events.lock().unwrap();
    let n1: Vec<&EventKind> = events
        .iter()
        .filter(|(host, _)| host == "n1")
        .map(|(_, kind)| kind)
        .collect();
    assert_eq!(n1.first(), Some(&&EventKind::Connecting));
    assert_eq!(n1.last(), Some(&&EventKind::Completed));
    assert!(n1.contains(&&EventKind::Verifying));
    assert!(n1.contains(&&EventKind::Progress {
        written: content.len() as u64,
        total: content.len() as u64
    }));
}

#[tokio::test]
async fn test_missing_source_is_configuration_error() {
    let engine = Engine::new(Arc::new(FakeNet::default()));
    let task = TransferTask::new("/definitely/not/here.bin", "/tmp");
    let options = OperationOptions::new(hosts(&["n1"]), Operation::Transfer(task))
        .with_credentials(credentials());

    let err = engine
        .run(&options, &env(), EventSink::none(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSource(_)));
}

#[tokio::test]
async fn test_sequential_cancel_returns_partial() {
    let engine = Engine::new(Arc::new(FakeNet::default()));
    let token = CancellationToken::new();

    // Cancel as soon as the first host completes
    let sink = {
        let token = token.clone();
        EventSink::new(move |event| {
            if event.kind == EventKind::Completed {
                token.cancel();
            }
        })
    };

    let err = engine
        .run_sequential(
            &command_options(&["a", "b", "c"], CommandTask::new("true")),
            &env(),
            sink,
            token,
        )
        .await
        .unwrap_err();

    match err {
        Error::Cancelled { partial } => {
            assert_eq!(partial.hosts, vec!["a", "b", "c"]);
            assert_eq!(partial.outcomes.len(), 1);
            assert!(partial.get("a").unwrap().is_success());
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_runs_in_order() {
    let net = FakeNet::default();
    let commands = net.commands.clone();
    let engine = Engine::new(Arc::new(net));

    let result = engine
        .run_sequential(
            &command_options(&["c", "a", "b"], CommandTask::new("true")),
            &env(),
            EventSink::none(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.summary().as_tuple(), (3, 0, 0));
    let order: Vec<String> = commands.lock().unwrap().iter().map(|(h, _)| h.clone()).collect();
    assert_eq!(order, vec!["c", "a", "b"]);
}
