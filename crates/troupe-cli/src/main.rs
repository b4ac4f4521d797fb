mod commands;
mod render;
mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use troupe::agents::manager::AgentManager;
use troupe::config::{AgentConfig, AgentsFile, GlobalConfig};
use troupe::engine::TurnEngine;
use troupe::errors::{ConfigError, Error};
use troupe::mcp::config::McpServersFile;
use troupe::mcp::supervisor::McpSupervisor;
use troupe::persistence::{ConversationStore, DEFAULT_PRUNE_DAYS};
use troupe::providers::factory;
use troupe::registry::ModelRegistry;
use troupe::tools::registry::ToolRegistry;
use troupe::tools::transfer::transfer_entry;

use session::Session;

#[derive(Parser)]
#[command(name = "troupe", version, about = "Multi-agent conversational runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat session
    Chat {
        /// Provider to start with (anthropic, openai, gemini, groq, deepinfra,
        /// or a configured custom provider)
        #[arg(long)]
        provider: Option<String>,

        /// Path to the agents TOML file
        #[arg(long)]
        agent_config: Option<PathBuf>,

        /// Path to the MCP servers JSON manifest
        #[arg(long)]
        mcp_config: Option<PathBuf>,

        /// Plain console output (no styling)
        #[arg(long)]
        console: bool,
    },
    /// Serve local agents over the agent-to-agent HTTP protocol
    A2aServer {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8700)]
        port: u16,

        /// Public base URL agents are advertised under
        #[arg(long)]
        base_url: Option<String>,

        #[arg(long)]
        provider: Option<String>,
    },
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<Error>() {
        Some(Error::Config(ConfigError::MissingCredentials(_))) => 2,
        Some(Error::Config(_)) => 1,
        _ => 3,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Chat {
            provider,
            agent_config,
            mcp_config,
            console,
        } => run_chat(provider, agent_config, mcp_config, console).await,
        Command::A2aServer {
            host,
            port,
            base_url,
            provider,
        } => run_server(host, port, base_url, provider).await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<Error>() {
            Some(core) => eprintln!("{}", core.user_message()),
            None => eprintln!("{e}"),
        }
        std::process::exit(exit_code(&e));
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("troupe")
}

fn default_agents() -> AgentsFile {
    AgentsFile {
        agents: vec![AgentConfig {
            name: "Assistant".to_string(),
            description: "General-purpose assistant".to_string(),
            tools: vec![],
            system_prompt: "You are a helpful assistant. Today is {current_date}.".to_string(),
            temperature: None,
            remote_endpoint: None,
        }],
    }
}

async fn bootstrap(
    provider_override: Option<String>,
    agent_config: Option<PathBuf>,
    mcp_config: Option<PathBuf>,
) -> Result<(TurnEngine, Option<Arc<McpSupervisor>>)> {
    let config_dir = config_dir();

    let global_path = config_dir.join("config.json");
    let global = if global_path.exists() {
        GlobalConfig::load(&global_path).map_err(Error::from)?
    } else {
        GlobalConfig::default()
    };

    let models = Arc::new(ModelRegistry::new());
    let known = factory::known_providers(&global);
    for model in global.custom_models() {
        models.register(model, &known).map_err(Error::from)?;
    }
    if let Some(provider) = &provider_override {
        let model = models
            .default_for_provider(provider)
            .ok_or_else(|| Error::from(ConfigError::UnknownProvider(provider.clone())))?;
        models.set_current(&model.id).map_err(Error::from)?;
    }

    let tools = Arc::new(ToolRegistry::new());
    tools.register(transfer_entry()).map_err(Error::from)?;

    let mcp_path = mcp_config.or_else(|| {
        let default = config_dir.join("mcp_servers.json");
        default.exists().then_some(default)
    });
    let supervisor = match mcp_path {
        Some(path) => {
            let manifest = McpServersFile::load(&path).map_err(Error::from)?;
            let supervisor = Arc::new(McpSupervisor::new(manifest, Arc::clone(&tools)));
            supervisor.start_all().await;
            supervisor
                .register_reconnect_tool()
                .map_err(Error::from)?;
            Some(supervisor)
        }
        None => None,
    };

    let agents_path = agent_config.or_else(|| {
        let default = config_dir.join("agents.toml");
        default.exists().then_some(default)
    });
    let agents = match agents_path {
        Some(path) => AgentsFile::load(&path).map_err(Error::from)?,
        None => default_agents(),
    };
    let first_agent = agents
        .agents
        .first()
        .map(|a| a.name.clone())
        .ok_or_else(|| {
            Error::from(ConfigError::Malformed {
                path: "agents".to_string(),
                message: "no agents configured".to_string(),
            })
        })?;

    let model = models.get_current();
    let provider_name = model.provider.clone();
    let provider = factory::get_provider(&provider_name, &global, model)?;
    let mut manager = AgentManager::new(
        agents,
        provider,
        Arc::clone(&tools),
        Arc::clone(&models),
        global,
    )
    .map_err(Error::from)?;
    manager.select(&first_agent)?;

    let store = ConversationStore::new(config_dir.join("conversations")).map_err(Error::from)?;
    match store.prune(DEFAULT_PRUNE_DAYS) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "pruned old conversations"),
        Err(e) => tracing::warn!("conversation pruning failed: {e}"),
    }

    Ok((TurnEngine::new(manager, store), supervisor))
}

async fn run_chat(
    provider: Option<String>,
    agent_config: Option<PathBuf>,
    mcp_config: Option<PathBuf>,
    console: bool,
) -> Result<()> {
    let (engine, supervisor) = bootstrap(provider, agent_config, mcp_config).await?;
    Session::new(engine, supervisor, console).start().await
}

async fn run_server(
    host: String,
    port: u16,
    base_url: Option<String>,
    provider: Option<String>,
) -> Result<()> {
    let (engine, _supervisor) = bootstrap(provider, None, None).await?;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    if let Some(base_url) = base_url {
        for agent in engine.manager().roster() {
            tracing::info!("serving agent at {base_url}/{}", agent.name);
        }
    }
    troupe_server::serve(engine, addr).await
}
