mod console;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use cardbridge::{
    BridgeConfig, CardRenderer, ClaudeCliBackend, InboundMessage, SessionManager,
    TaskOrchestrator, TaskRegistry,
};

use console::{ConsoleTransport, dispatch, split_attachment};

/// The single conversation the console drives.
const CONSOLE_CONTEXT: &str = "console";

/// How long running tasks get to render their final card on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "cardbridge",
    about = "Drive a coding agent from the terminal, rendering live task cards"
)]
struct Args {
    /// Path to cardbridge.toml (defaults to ./cardbridge.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace for new conversations, overriding the config file
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(workspace) = args.workspace {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("workspace {} does not exist", workspace.display()))?;
        config.bridge.default_workspace = Some(workspace);
    }

    let orchestrator = Arc::new(TaskOrchestrator::new(
        Arc::new(SessionManager::from_config(&config.bridge)),
        Arc::new(TaskRegistry::new()),
        Arc::new(ClaudeCliBackend::new(config.agent.clone())),
        Arc::new(ConsoleTransport::default()),
        Arc::new(CardRenderer),
        config.bridge.clone(),
    ));
    orchestrator.start();

    tracing::info!(
        workspace = ?config.bridge.default_workspace,
        agent = %config.agent.command,
        "cardbridge ready; type a task, /help for commands"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let mut next_message = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        next_message += 1;
        let (image_key, text) = split_attachment(&line);
        let message = InboundMessage {
            context_id: CONSOLE_CONTEXT.to_string(),
            message_id: format!("msg-{next_message}"),
            text,
            image_key,
        };
        dispatch(&orchestrator, &mut tasks, message).await;

        // Reap finished handlers so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
    }

    orchestrator.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        tracing::warn!("tasks still running after shutdown grace period");
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let local = Path::new("cardbridge.toml");
            if local.exists() {
                BridgeConfig::from_file(local).context("failed to load ./cardbridge.toml")
            } else {
                Ok(BridgeConfig::default())
            }
        }
    }
}
