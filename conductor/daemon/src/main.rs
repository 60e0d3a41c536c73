//! Whist Launcher - Headless Main Process
//!
//! Hosts the flow graph for one user session. The renderer runs as the
//! launcher's parent (or any process holding its stdio) and speaks
//! line-delimited JSON: actions arrive on stdin, state and window commands
//! leave on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! whist-launcher
//!
//! # Against a staging webserver with a local protocol build
//! whist-launcher --webserver-url https://dev-server.whist.com --protocol-path ./WhistClient
//!
//! # Every login succeeds without contacting the webserver
//! WHIST_MOCK_SCHEMA=loginSuccess whist-launcher
//!
//! # Every mandelbox request fails with NO_INSTANCE_AVAILABLE
//! whist-launcher --mock-schema mandelboxUnavailable
//!
//! # Verbose logging
//! RUST_LOG=debug whist-launcher
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the protocol, flush the store, exit

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use whist_conductor::{
    config, ConfigOverrides, Dependencies, FlowContext, FlowGraph, IpcBridge, LauncherConfig,
    MockSchema, OutboundMessage, ProcessSpawner, Store, Subscription, TriggerRegistry,
    WebserverApi,
};

/// Whist Launcher - session establishment for the Whist streaming client
#[derive(Parser, Debug)]
#[command(name = "whist-launcher")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "WHIST_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Webserver base URL
    #[arg(long, value_name = "URL")]
    webserver_url: Option<String>,

    /// Region to request mandelboxes in
    #[arg(long)]
    region: Option<String>,

    /// Protocol client binary
    #[arg(long, value_name = "PATH")]
    protocol_path: Option<PathBuf>,

    /// Persisted store file
    #[arg(long, value_name = "PATH")]
    store_path: Option<PathBuf>,

    /// Built-in mock schema replacing webserver answers
    #[arg(long, value_name = "NAME")]
    mock_schema: Option<String>,

    /// PID file used as the single-instance lock
    #[arg(long, env = "WHIST_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "WHIST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.webserver_url {
            overrides = overrides.with_webserver_url(url.clone());
        }
        if let Some(region) = &self.region {
            overrides = overrides.with_region(region.clone());
        }
        if let Some(path) = &self.protocol_path {
            overrides = overrides.with_protocol_path(path.clone());
        }
        if let Some(path) = &self.store_path {
            overrides = overrides.with_store_path(path.clone());
        }
        if let Some(name) = &self.mock_schema {
            overrides = overrides.with_mock_schema(name.clone());
        }
        overrides
    }
}

/// Get the default PID file path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/whist-$UID/`
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("whist").join("launcher.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/whist-{uid}/launcher.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start while another launcher holds the PID file
fn check_existing_instance(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks that the process exists
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another whist-launcher is already running (PID: {pid}). \
             Close it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging on stderr; stdout carries IPC
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "whist_launcher={level},whist_conductor={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn load_config(args: &Args) -> Result<LauncherConfig> {
    let path = args.config.clone().or_else(config::default_config_path);
    let mut config = config::load_config_from(path, |key| std::env::var(key).ok())
        .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Write every outbound message to stdout, one per line
async fn write_outbound(mut messages: Subscription<OutboundMessage>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = messages.next().await {
        let mut line = message.encode()?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to renderer")?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Build the graph and serve the renderer until quit, EOF or a signal
async fn run(config: LauncherConfig) -> Result<()> {
    let store = Store::open(&config.store_path).await;

    let mut context = FlowContext::new(Arc::new(WebserverApi::new(&config.webserver_url)));
    context.region.clone_from(&config.region);
    context.policy_timeout = config.policy_timeout;
    context.mandelbox_timeout = config.mandelbox_timeout;
    context.schema = config
        .mock_schema
        .as_deref()
        .and_then(MockSchema::resolve)
        .map(Arc::new);

    let spawner = Arc::new(ProcessSpawner::new(&config.protocol_path));
    let deps = Dependencies::new(context, store, spawner)
        .with_intervals(config.token_refresh_interval, config.autoupdate_interval);

    let registry = TriggerRegistry::new();
    let graph = FlowGraph::build(&registry, deps).context("Failed to wire flow graph")?;
    let bridge = IpcBridge::new(registry.clone());

    let outbound = graph
        .renderer_states()
        .map(OutboundMessage::state)
        .merge(&graph.window_commands().map(OutboundMessage::window));
    let writer = tokio::spawn(write_outbound(outbound.subscribe()));

    let mut quit = graph.quit_requested().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    graph.start().context("Failed to start flow graph")?;
    info!(webserver = %config.webserver_url, region = %config.region, "Launcher ready");

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read renderer input")? {
                Some(line) => {
                    if let Err(e) = bridge.handle_line(&line) {
                        warn!(error = %e, "Renderer message rejected");
                    }
                }
                None => {
                    info!("Renderer closed stdin, shutting down");
                    break;
                }
            },
            _ = quit.next() => {
                info!("Quit requested");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    graph.shutdown().await;
    writer.abort();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Whist Launcher starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = load_config(&args)?;
    info!(source = %config.source(), store = ?config.store_path, "Configuration loaded");

    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    check_existing_instance(&pid_path)?;
    write_pid_file(&pid_path)?;

    let result = run(config).await;

    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Launcher stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Launcher stopped with error");
            Err(e)
        }
    }
}
