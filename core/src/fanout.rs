//! Multi-host fan-out
//!
//! Runs one [`Operation`] against every requested host and folds the per-host
//! outcomes into an [`OperationResult`]. Only configuration problems
//! (credentials, an unreadable source file) abort the whole operation; anything
//! that goes wrong on a host is recorded as that host's outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::auth::{self, ClientConfig, CredentialOptions, ResolverEnv, DEFAULT_CONNECT_TIMEOUT};
use crate::error::ErrorKind;
use crate::events::{EventKind, EventSink, NodeEvent};
use crate::ssh::SshConnector;
use crate::target::HostTarget;
use crate::task::{deadline_token, run_until};
use crate::transfer::FileHeader;
use crate::transport::{Connection, Connector};
use crate::{checksum, exec, transfer};
use crate::{
    Completion, Error, NodeOutcome, Operation, OperationResult, Result, TransferTask,
};

/// Everything one operation needs
#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Host strings as given by the caller; duplicates run once
    pub hosts: Vec<String>,
    pub credentials: CredentialOptions,
    /// Port for hosts that do not name one
    pub port: Option<u16>,
    pub operation: Operation,
    /// Wall-clock limit for the whole operation (per host when sequential)
    pub deadline: Option<Duration>,
    /// Cap on simultaneous hosts; `None` runs every host at once
    pub max_concurrency: Option<usize>,
    pub connect_timeout: Duration,
}

impl OperationOptions {
    pub fn new(hosts: Vec<String>, operation: Operation) -> Self {
        Self {
            hosts,
            credentials: CredentialOptions::default(),
            port: None,
            operation,
            deadline: None,
            max_concurrency: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialOptions) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: Option<usize>) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

/// Runs operations across hosts through a [`Connector`]
#[derive(Clone)]
pub struct Engine {
    connector: Arc<dyn Connector>,
}

/// Validated, shared inputs of one operation
struct Prepared {
    config: Arc<ClientConfig>,
    operation: Arc<Operation>,
    local_digest: Option<String>,
    port: Option<u16>,
}

/// What a single host task works with
struct HostContext {
    host: String,
    port: Option<u16>,
    config: Arc<ClientConfig>,
    operation: Arc<Operation>,
    local_digest: Option<String>,
    connector: Arc<dyn Connector>,
    events: EventSink,
}

impl Engine {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Engine that talks SSH
    pub fn ssh() -> Self {
        Self::new(Arc::new(SshConnector::new()))
    }

    /// Run on every host concurrently and wait for all of them
    ///
    /// `token` and `options.deadline` interrupt every host at its next
    /// suspension point; interrupted hosts report [`NodeOutcome::Timeout`].
    ///
    /// # Errors
    ///
    /// Configuration errors only: credential resolution and source validation.
    pub async fn run(
        &self,
        options: &OperationOptions,
        env: &ResolverEnv,
        events: EventSink,
        token: CancellationToken,
    ) -> Result<OperationResult> {
        let started = Instant::now();
        let prepared = prepare(options, env).await?;
        let hosts = dedupe(&options.hosts);

        let deadline = deadline_token(&token, options.deadline);
        let semaphore = options
            .max_concurrency
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));

        info!(
            hosts = hosts.len(),
            max_concurrency = ?options.max_concurrency,
            "Starting parallel operation"
        );

        let mut handles = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let ctx = self.context(&prepared, host, &events);
            let token = deadline.clone();
            let semaphore = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let queued = Instant::now();
                // Held until the host finishes
                let _permit = match semaphore {
                    Some(semaphore) => {
                        match run_until(semaphore.acquire_owned(), None, &token).await {
                            Ok(Ok(permit)) => Some(permit),
                            Ok(Err(_)) => None,
                            Err(_) => {
                                let outcome = NodeOutcome::Timeout {
                                    elapsed: queued.elapsed(),
                                };
                                ctx.finish(&outcome);
                                return outcome;
                            }
                        }
                    }
                    None => None,
                };
                run_host(&ctx, &token).await
            }));
        }

        let mut result = OperationResult {
            hosts: hosts.clone(),
            local_digest: prepared.local_digest.clone(),
            ..Default::default()
        };
        for (host, handle) in hosts.into_iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(host = %host, error = %e, "Host task aborted");
                    NodeOutcome::failure(ErrorKind::Internal, format!("host task aborted: {}", e))
                }
            };
            result.insert(host, outcome);
        }

        // Stops the deadline timer
        deadline.cancel();
        result.total_duration = started.elapsed();
        log_summary(&result);
        Ok(result)
    }

    /// Run on one host at a time, in the requested order
    ///
    /// Each host gets its own `options.deadline`. Once `token` fires no further
    /// host is started; the host in flight runs to completion.
    ///
    /// # Errors
    ///
    /// Configuration errors, or [`Error::Cancelled`] carrying the hosts that
    /// finished before the cancellation was observed.
    pub async fn run_sequential(
        &self,
        options: &OperationOptions,
        env: &ResolverEnv,
        events: EventSink,
        token: CancellationToken,
    ) -> Result<OperationResult> {
        let started = Instant::now();
        let prepared = prepare(options, env).await?;
        let hosts = dedupe(&options.hosts);

        info!(hosts = hosts.len(), "Starting sequential operation");

        let mut result = OperationResult {
            hosts: hosts.clone(),
            local_digest: prepared.local_digest.clone(),
            ..Default::default()
        };

        for host in hosts {
            if token.is_cancelled() {
                warn!(
                    completed = result.outcomes.len(),
                    remaining = result.hosts.len() - result.outcomes.len(),
                    "Cancelled, not starting remaining hosts"
                );
                result.total_duration = started.elapsed();
                return Err(Error::Cancelled {
                    partial: Box::new(result),
                });
            }

            let ctx = self.context(&prepared, &host, &events);
            let host_token = deadline_token(&CancellationToken::new(), options.deadline);
            let outcome = run_host(&ctx, &host_token).await;
            host_token.cancel();
            result.insert(host, outcome);
        }

        result.total_duration = started.elapsed();
        log_summary(&result);
        Ok(result)
    }

    fn context(&self, prepared: &Prepared, host: &str, events: &EventSink) -> HostContext {
        HostContext {
            host: host.to_string(),
            port: prepared.port,
            config: prepared.config.clone(),
            operation: prepared.operation.clone(),
            local_digest: prepared.local_digest.clone(),
            connector: self.connector.clone(),
            events: events.clone(),
        }
    }
}

// ============================================================================
// Preparation
// ============================================================================

async fn prepare(options: &OperationOptions, env: &ResolverEnv) -> Result<Prepared> {
    let mut config = auth::resolve(&options.credentials, env)?;
    config.connect_timeout = options.connect_timeout;

    let mut operation = options.operation.clone();
    let mut local_digest = None;

    if let Operation::Transfer(task) = &mut operation {
        validate_source(task).await?;
        if task.verify {
            let digest = checksum::local_digest(&task.source_path).await?;
            info!(source = %task.source_path.display(), digest = %digest, "Computed local checksum");
            local_digest = Some(digest);
        }
    }

    Ok(Prepared {
        config: Arc::new(config),
        operation: Arc::new(operation),
        local_digest,
        port: options.port,
    })
}

/// Check the source is a regular file and record its size
async fn validate_source(task: &mut TransferTask) -> Result<()> {
    let path = &task.source_path;
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::InvalidSource(format!("{}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(Error::InvalidSource(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    task.file_size = metadata.len();

    let name = task
        .file_name()
        .ok_or_else(|| Error::InvalidSource(format!("{} has no file name", path.display())))?;
    FileHeader::new(task.mode, task.file_size, name)?;
    Ok(())
}

/// Drop repeated hosts, keeping the first occurrence
fn dedupe(hosts: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .filter(|host| seen.insert(host.as_str()))
        .cloned()
        .collect()
}

fn log_summary(result: &OperationResult) {
    let summary = result.summary();
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        checksum_mismatches = result.checksum_mismatches().len(),
        duration_ms = result.total_duration.as_millis() as u64,
        "Operation finished"
    );
}

// ============================================================================
// Per-host execution
// ============================================================================

impl HostContext {
    fn emit(&self, kind: EventKind) {
        self.events.emit(NodeEvent::new(&self.host, kind));
    }

    /// Report the final outcome of this host
    fn finish(&self, outcome: &NodeOutcome) {
        let kind = if outcome.is_success() {
            EventKind::Completed
        } else {
            EventKind::Failed
        };
        self.events.emit(
            NodeEvent::new(&self.host, kind)
                .with_message(outcome.to_string())
                .with_outcome(outcome.clone()),
        );
    }
}

#[instrument(skip_all, fields(host = %ctx.host))]
async fn run_host(ctx: &HostContext, token: &CancellationToken) -> NodeOutcome {
    let started = Instant::now();

    let outcome = match execute(ctx, token, started).await {
        Ok(outcome) => outcome,
        Err(Error::Timeout(limit)) => {
            warn!(limit_ms = limit.as_millis() as u64, "Host timed out");
            NodeOutcome::Timeout {
                elapsed: started.elapsed(),
            }
        }
        Err(e) => {
            warn!(error = %e, "Host failed");
            NodeOutcome::failure(e.kind(), e.to_string())
        }
    };

    ctx.finish(&outcome);
    outcome
}

async fn execute(
    ctx: &HostContext,
    token: &CancellationToken,
    started: Instant,
) -> Result<NodeOutcome> {
    let target = HostTarget::parse(&ctx.host, ctx.port)?;

    ctx.emit(EventKind::Connecting);
    let connection = match run_until(ctx.connector.connect(&target, &ctx.config), None, token).await
    {
        Ok(connection) => connection?,
        Err(_) => {
            return Ok(NodeOutcome::Timeout {
                elapsed: started.elapsed(),
            })
        }
    };
    ctx.emit(EventKind::Connected);

    ctx.emit(EventKind::Executing);
    let outcome = match ctx.operation.as_ref() {
        Operation::Command(task) => {
            let outcome = exec::run_command(connection.as_ref(), task, token, started).await;
            if let Ok(NodeOutcome::Success {
                completion: Completion::Command { stdout, .. },
                ..
            }) = &outcome
            {
                ctx.events
                    .emit(NodeEvent::new(&ctx.host, EventKind::Output).with_message(stdout.clone()));
            }
            outcome
        }
        Operation::Transfer(task) => {
            push_file(ctx, connection.as_ref(), task, token, started).await
        }
    };

    connection.close().await;
    outcome
}

async fn push_file(
    ctx: &HostContext,
    connection: &dyn Connection,
    task: &TransferTask,
    token: &CancellationToken,
    started: Instant,
) -> Result<NodeOutcome> {
    let total = task.file_size;
    let on_progress = |written| ctx.emit(EventKind::Progress { written, total });

    let written = match run_until(transfer::upload(connection, task, on_progress), None, token).await
    {
        Ok(written) => written?,
        Err(_) => {
            return Ok(NodeOutcome::Timeout {
                elapsed: started.elapsed(),
            })
        }
    };

    let mut checksum = None;
    if let (true, Some(local), Some(remote_path)) =
        (task.verify, ctx.local_digest.as_deref(), task.remote_path())
    {
        ctx.emit(EventKind::Verifying);
        match run_until(checksum::verify(connection, &remote_path, local), None, token).await {
            Ok(result) => checksum = Some(result),
            Err(_) => {
                return Ok(NodeOutcome::Timeout {
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    Ok(NodeOutcome::Success {
        duration: started.elapsed(),
        completion: Completion::Transfer {
            bytes: written,
            checksum,
        },
    })
}
