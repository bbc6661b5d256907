use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use alibi_core::{MessageRouter, ScriptedResponder};
use alibi_gateway::GatewayServer;
use alibi_store::{ConversationStore, MemoryConversationStore, SqliteConversationStore};

mod config;
mod simulate;

use config::AlibiConfig;

const DEFAULT_URL: &str = "ws://127.0.0.1:5000/ws";

#[derive(Parser)]
#[command(name = "alibi")]
#[command(version)]
#[command(about = "alibi, a message router for suspect interrogations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router and gateway until Ctrl+C
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Print a stored conversation as JSON
    History {
        participant: String,
        suspect: String,
    },

    /// Answer for a suspect with canned replies
    Agent {
        suspect: String,

        /// Gateway WebSocket URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Delay before each reply
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },

    /// Send one message and print the suspect's reply
    Chat {
        participant: String,
        suspect: String,
        message: String,

        /// Gateway WebSocket URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins when set
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::History {
            participant,
            suspect,
        } => cmd_history(&cli.config, &participant, &suspect).await,
        Commands::Agent {
            suspect,
            url,
            delay_ms,
        } => cmd_agent(&url, &suspect, delay_ms).await,
        Commands::Chat {
            participant,
            suspect,
            message,
            url,
            timeout_secs,
        } => cmd_chat(&url, &participant, &suspect, &message, timeout_secs).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("alibi initialized at {}", config_dir.display());
    println!("Edit {} to change the suspects and fallback lines.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AlibiConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

fn open_store(cfg: &AlibiConfig) -> Result<Arc<dyn ConversationStore>> {
    if cfg.store.ephemeral {
        warn!("Using in-memory conversation store; history is lost on exit");
        return Ok(Arc::new(MemoryConversationStore::new()));
    }

    let db_path = cfg.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteConversationStore::open(&db_path)
        .with_context(|| format!("Failed to open conversation store at {}", db_path.display()))?;
    info!("Conversation store at {}", db_path.display());
    Ok(Arc::new(store))
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = AlibiConfig::load(config_path)?;
    info!("Starting alibi...");

    let cancel = CancellationToken::new();
    let store = open_store(&cfg)?;
    let fallback = Arc::new(ScriptedResponder::new(cfg.fallback.replies.clone()));

    let (router, handle) = MessageRouter::new(cfg.router_config(), store.clone(), fallback);
    let router_task = tokio::spawn(router.run(cancel.clone()));

    let gateway = GatewayServer::new(
        cfg.bind_addr()?,
        handle,
        store,
        cfg.suspects.clone(),
        cancel.clone(),
    );
    let mut gateway_task = gateway.spawn();

    info!(
        "alibi is running on {} ({} suspects). Press Ctrl+C to stop.",
        cfg.bind_addr()?,
        cfg.suspects.len()
    );

    let finished = tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Shutting down...");
            None
        }
        res = &mut gateway_task => Some(res),
    };
    cancel.cancel();

    let gateway_result = match finished {
        Some(res) => res,
        None => gateway_task.await,
    };
    if let Err(e) = router_task.await {
        error!("Router task failed: {}", e);
    }
    match gateway_result {
        Ok(res) => res.context("Gateway stopped")?,
        Err(e) => return Err(e).context("Gateway task failed"),
    }

    info!("alibi stopped");
    Ok(())
}

async fn cmd_history(config_path: &Option<PathBuf>, participant: &str, suspect: &str) -> Result<()> {
    let cfg = AlibiConfig::load(config_path)?;
    if cfg.store.ephemeral {
        warn!("Store is ephemeral; there is no history on disk");
    }
    let store = SqliteConversationStore::open(cfg.db_path())
        .with_context(|| format!("Failed to open {}", cfg.db_path().display()))?;
    let conversation = store
        .read(participant, suspect)
        .await
        .with_context(|| format!("Failed to read history for ({}, {})", participant, suspect))?;
    println!("{}", serde_json::to_string_pretty(&conversation)?);
    Ok(())
}

async fn cmd_agent(url: &str, suspect: &str, delay_ms: u64) -> Result<()> {
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    simulate::run_agent(url, suspect, Duration::from_millis(delay_ms), cancel).await
}

async fn cmd_chat(
    url: &str,
    participant: &str,
    suspect: &str,
    message: &str,
    timeout_secs: u64,
) -> Result<()> {
    let reply = simulate::chat_once(
        url,
        participant,
        suspect,
        message,
        Duration::from_secs(timeout_secs),
    )
    .await?;
    println!("{}: {}", suspect, reply);
    Ok(())
}
