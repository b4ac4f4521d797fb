use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProviderError, ToolError};
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::registry::Model;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    /// Dollar cost of the turn so far, from the active model's prices.
    pub cost: Option<f64>,
}

impl Usage {
    pub fn new(input_tokens: Option<i64>, output_tokens: Option<i64>, cost: Option<f64>) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost,
        }
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error(String),
}

/// One event from a provider stream. Adapters translate every vendor wire
/// format into this sequence; the turn engine consumes nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ThinkingSignature {
        signature: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallArgsDelta {
        id: String,
        partial_json: String,
    },
    /// Terminal event for one tool call. A JSON parse failure fails the
    /// single call, not the stream: `arguments` then carries the error.
    ToolCallEnd {
        id: String,
        name: String,
        arguments: Result<Value, ToolError>,
    },
    UsageUpdate {
        usage: Usage,
    },
    Stop {
        reason: StopReason,
    },
}

/// Thinking-mode request. Budget-based providers take a token budget (minimum
/// 1024, silently raised); effort-based providers take a level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Budget(u32),
    Effort(Effort),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// Parse the `/think` argument: a token budget, a level name, or 0/none.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "0" | "none" | "off" => Some(ThinkingLevel::Off),
            "low" => Some(ThinkingLevel::Effort(Effort::Low)),
            "medium" => Some(ThinkingLevel::Effort(Effort::Medium)),
            "high" => Some(ThinkingLevel::Effort(Effort::High)),
            other => other.parse::<u32>().ok().map(ThinkingLevel::Budget),
        }
    }
}

/// A lazy, forward-only sequence of stream events. Dropping the stream
/// releases the underlying connection and any partial state.
pub type ProviderStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Uniform contract against one LLM backend. An adapter carries the mutable
/// per-agent state (system prompt, tool schemas, thinking mode) that shapes
/// the next stream.
pub trait Provider: Send + Sync {
    /// Short provider name ("anthropic", "openai", ...).
    fn name(&self) -> &str;

    /// Side-effects the next stream.
    fn set_system_prompt(&mut self, prompt: &str);

    /// Add a tool schema to the set the next stream will carry.
    fn register_tool(&mut self, tool: &Tool);

    fn clear_tools(&mut self);

    /// Returns whether the requested mode is supported. Unsupported modes
    /// leave the adapter's thinking state unchanged.
    fn set_thinking(&mut self, level: ThinkingLevel) -> bool;

    /// Sampling temperature for the next stream; `None` uses the provider
    /// default.
    fn set_temperature(&mut self, temperature: Option<f32>);

    fn model(&self) -> &Model;

    fn set_model(&mut self, model: &Model);

    /// Open a stream for the given canonical history. The call itself does
    /// not perform I/O; the request is issued on first poll.
    fn stream(&self, messages: &[Message]) -> ProviderStream;
}
