use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration files.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("agent '{agent}' references unknown tool '{tool}'")]
    UnknownTool { agent: String, tool: String },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("missing credentials for provider '{0}'")]
    MissingCredentials(String),

    #[error("duplicate agent name '{0}'")]
    DuplicateAgent(String),
}

/// Errors surfaced by a provider adapter. Transient-case retry is internal to
/// the adapter; anything reaching the caller is terminal for the request.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("malformed provider response: {0}")]
    Response(String),
}

/// Tool failures. These are serializable because they travel inside canonical
/// messages as tool results and must survive a persistence round-trip.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid parameters for tool: {0}")]
    InvalidParameters(String),

    #[error("tool execution failed: {0}")]
    Execution(String),

    #[error("timeout: tool '{0}' did not complete in time")]
    Timeout(String),

    #[error("mcp server '{0}' unavailable")]
    ServerDown(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),
}

/// Failures of an inter-agent transfer.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("unknown target agent '{target}'. Available agents: {available}")]
    UnknownAgent { target: String, available: String },

    #[error("transfer arguments malformed: {0}")]
    BadArguments(String),
}

/// Operation attempted in a turn-engine state that does not allow it.
#[derive(Error, Debug)]
#[error("operation not allowed while {state}: {operation}")]
pub struct StateError {
    pub state: String,
    pub operation: String,
}

/// Durable-storage failures. The turn that triggered the snapshot is retained
/// in memory and the next snapshot retries.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("conversation store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversation '{0}' not found")]
    NotFound(String),

    #[error("corrupt conversation file {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Top-level error for the orchestration core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl Error {
    /// Single-paragraph, user-facing rendering: error kind plus a short hint.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(e) => format!("configuration error: {e} — check your config files"),
            Error::Provider(e) => format!("provider error: {e} — the turn was not completed"),
            Error::Tool(e) => format!("tool error: {e}"),
            Error::Transfer(e) => format!("transfer failed: {e}"),
            Error::State(e) => format!("{e} — wait for the current turn to finish"),
            Error::Persistence(e) => {
                format!("persistence error: {e} — the conversation is kept in memory")
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
