//! nodectl - run commands and push files across many nodes over SSH
//!
//! Examples:
//!
//! ```text
//! nodectl exec -c "uptime" -n node1,node2,node3
//! nodectl exec -c "systemctl status kubelet" -n @workers --sudo -o stream
//! nodectl copy -f release.tar.gz -n node1,node2 -d /opt/releases --verify
//! ```

mod config;
mod duration;
mod output;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nodectl_core::types::DEFAULT_COMMAND_TIMEOUT;
use nodectl_core::{
    CancellationToken, CommandTask, CredentialOptions, Engine, Error, EventSink, Operation,
    OperationOptions, OperationResult, ResolverEnv, TransferTask,
};
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{get_secret, Config, PASSWORD_ENV};
use crate::duration::{format_bytes, format_duration, parse_duration};
use crate::output::{OutputMode, OutputWriter};

/// nodectl - Multi-node command execution and file distribution
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// SSH user name (default: current user)
    #[arg(short, long, global = true, env = "NODECTL_USER")]
    user: Option<String>,

    /// SSH password, same for every node (also NODECTL_PASSWORD or NODECTL_PASSWORD_FILE)
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Private key file (default: ssh-agent or ~/.ssh/id_*)
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,

    /// SSH port for nodes that do not name one
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Show progress and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/nodectl/config.toml)
    #[arg(long, global = true, env = "NODECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of nodes contacted at once (default: all)
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the same command on several nodes
    Exec(ExecArgs),

    /// Copy a file to the same directory on several nodes
    Copy(CopyArgs),
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Command to run
    #[arg(short, long)]
    command: String,

    /// Target nodes, comma separated; `@group` expands a configured group
    #[arg(short, long, required = true, num_args = 1..)]
    nodes: Vec<String>,

    /// Run the command with sudo
    #[arg(long)]
    sudo: bool,

    /// Per-command timeout (e.g. 10s, 1m, 2m30s; default 30s)
    #[arg(short, long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Output mode
    #[arg(short, long, value_enum, default_value_t = OutputMode::Grouped)]
    output: OutputMode,

    /// One node at a time, in the given order
    #[arg(long)]
    sequential: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CopyArgs {
    /// Local file to send
    #[arg(short, long)]
    file: PathBuf,

    /// Target nodes, comma separated; `@group` expands a configured group
    #[arg(short, long, required = true, num_args = 1..)]
    nodes: Vec<String>,

    /// Destination directory on every node
    #[arg(short, long)]
    dest: String,

    /// Compare XXH64 checksums after the copy
    #[arg(long)]
    verify: bool,

    /// Overall time limit for the copy
    #[arg(short, long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

/// Settings shared by every subcommand after merging flags and config
struct Settings {
    config: Config,
    credentials: CredentialOptions,
    port: Option<u16>,
    max_concurrency: Option<usize>,
    verbose: bool,
}

impl Settings {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

        let credentials = CredentialOptions {
            username: cli.user.clone().or_else(|| config.user.clone()),
            password: cli.password.clone().or_else(|| get_secret(PASSWORD_ENV)),
            identity: cli.identity.clone().or_else(|| config.identity.clone()),
        };

        Ok(Self {
            port: cli.port.or(config.port),
            max_concurrency: cli.max_concurrency.or(config.max_concurrency),
            credentials,
            verbose: cli.verbose,
            config,
        })
    }

    fn auth_description(&self) -> String {
        if self.credentials.password.as_deref().is_some_and(|p| !p.is_empty()) {
            "password".to_string()
        } else if let Some(identity) = &self.credentials.identity {
            format!("private key ({})", identity.display())
        } else {
            "default (ssh-agent or ~/.ssh/id_*)".to_string()
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so command output stays clean
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("Command failed: {:#}", e);
            process::exit(1);
        }
    }
}

/// Returns whether every node succeeded
async fn run(cli: Cli) -> Result<bool> {
    let settings = Settings::from_cli(&cli)?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling remaining work (press Ctrl-C again to abort)");
                token.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                process::exit(130);
            }
        }
    });

    match cli.command {
        Commands::Exec(args) => handle_exec(&settings, args, token).await,
        Commands::Copy(args) => handle_copy(&settings, args, token).await,
    }
}

async fn handle_exec(settings: &Settings, args: ExecArgs, token: CancellationToken) -> Result<bool> {
    let nodes = settings.config.expand_nodes(&args.nodes)?;
    let timeout = match args.timeout {
        Some(timeout) => timeout,
        None => settings
            .config
            .command_timeout()?
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
    };

    let task = CommandTask::new(&args.command)
        .with_elevation(args.sudo)
        .with_timeout(timeout);
    let options = OperationOptions::new(nodes.clone(), Operation::Command(task))
        .with_credentials(settings.credentials.clone())
        .with_port(settings.port)
        .with_max_concurrency(settings.max_concurrency);

    let output = Arc::new(OutputWriter::new(io::stdout(), args.output, settings.verbose));
    if !args.json {
        output.write_header(
            "Multi-node exec",
            &[
                ("Command", args.command.clone()),
                ("Nodes", nodes.join(", ")),
                ("Timeout", format_duration(timeout)),
            ],
        );
    }

    let events = event_sink(&output, args.json);
    let (result, cancelled) = run_operation(&options, events, token, args.sequential)
        .await
        .context("Execution failed")?;

    if args.json {
        output.write_json(&result, cancelled)?;
    } else {
        if args.output == OutputMode::Grouped {
            output.write_grouped_results(&result);
        }
        output.write_summary(&result, cancelled);
    }

    Ok(result.all_succeeded() && !cancelled)
}

async fn handle_copy(settings: &Settings, args: CopyArgs, token: CancellationToken) -> Result<bool> {
    let nodes = settings.config.expand_nodes(&args.nodes)?;

    let task = TransferTask::new(&args.file, &args.dest).with_verify(args.verify);
    let options = OperationOptions::new(nodes.clone(), Operation::Transfer(task))
        .with_credentials(settings.credentials.clone())
        .with_port(settings.port)
        .with_deadline(args.timeout)
        .with_max_concurrency(settings.max_concurrency);

    let output = Arc::new(OutputWriter::new(
        io::stdout(),
        OutputMode::Grouped,
        settings.verbose,
    ));
    if !args.json {
        let size = std::fs::metadata(&args.file)
            .map(|m| format_bytes(m.len()))
            .unwrap_or_else(|_| "unknown".to_string());
        output.write_header(
            "File distribution",
            &[
                ("Source", format!("{} ({})", args.file.display(), size)),
                ("Destination", args.dest.clone()),
                ("Nodes", nodes.join(", ")),
                ("Auth", settings.auth_description()),
                ("Verify", if args.verify { "xxh64" } else { "off" }.to_string()),
            ],
        );
    }

    let events = event_sink(&output, args.json);
    let (result, cancelled) = run_operation(&options, events, token, false)
        .await
        .context("File distribution failed")?;

    if let Some(digest) = &result.local_digest {
        info!(digest = %digest, "Local checksum");
    }

    if args.json {
        output.write_json(&result, cancelled)?;
    } else {
        output.write_transfer_results(&result);
        output.write_summary(&result, cancelled);
    }

    Ok(result.all_succeeded() && !cancelled)
}

fn event_sink(output: &Arc<OutputWriter<Stdout>>, json: bool) -> EventSink {
    if json {
        return EventSink::none();
    }
    let output = output.clone();
    EventSink::new(move |event| output.write_event(event))
}

/// Run the operation; a cancelled sequential run still yields its partial result
async fn run_operation(
    options: &OperationOptions,
    events: EventSink,
    token: CancellationToken,
    sequential: bool,
) -> std::result::Result<(OperationResult, bool), Error> {
    let engine = Engine::ssh();
    let env = ResolverEnv::from_process();

    if !sequential {
        let cancelled = token.clone();
        let result = engine.run(options, &env, events, token).await?;
        return Ok((result, cancelled.is_cancelled()));
    }

    match engine.run_sequential(options, &env, events, token).await {
        Ok(result) => Ok((result, false)),
        Err(Error::Cancelled { partial }) => {
            warn!("Cancelled, reporting the nodes that finished");
            Ok((*partial, true))
        }
        Err(e) => Err(e),
    }
}
