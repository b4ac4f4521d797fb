//! The `transfer` tool: a special tool call that hands the conversation and a
//! projected history slice to another agent. The turn engine intercepts it
//! before normal dispatch, so its registered handler never runs in practice.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::registry::{AgentScope, FnToolHandler, ToolEntry};
use crate::errors::{ToolError, TransferError};
use crate::models::tool::Tool;

pub const TRANSFER_TOOL_NAME: &str = "transfer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferArgs {
    pub target_agent: String,
    pub task: String,
    /// Indices into the source agent's history to carry over. Out-of-range
    /// entries are dropped silently.
    #[serde(default)]
    pub relevant_messages: Vec<usize>,
}

impl TransferArgs {
    pub fn parse(arguments: &Value) -> Result<Self, TransferError> {
        serde_json::from_value(arguments.clone())
            .map_err(|e| TransferError::BadArguments(e.to_string()))
    }
}

pub fn transfer_tool() -> Tool {
    Tool::new(
        TRANSFER_TOOL_NAME,
        "Transfer the conversation to a specialized agent when the current task \
         requires expertise beyond this agent's capabilities. Explain to the user \
         why the transfer is necessary before calling this tool.",
        json!({
            "type": "object",
            "properties": {
                "target_agent": {
                    "type": "string",
                    "description": "Name of the agent to transfer to. See the \
                                    Agents section of your instructions for the roster."
                },
                "task": {
                    "type": "string",
                    "description": "A precise, actionable description of the task \
                                    the target agent should perform."
                },
                "relevant_messages": {
                    "type": "array",
                    "items": {"type": "integer", "minimum": 0},
                    "description": "Indices of messages from this conversation the \
                                    target agent needs as context."
                }
            },
            "required": ["target_agent", "task"]
        }),
    )
}

pub fn transfer_entry() -> ToolEntry {
    ToolEntry::builtin(
        transfer_tool(),
        AgentScope::All,
        Arc::new(FnToolHandler(|_: Value| async move {
            // Reached only if dispatch bypassed the engine's interception
            Err::<Vec<crate::models::content::Content>, ToolError>(ToolError::Execution(
                "transfer is performed by the orchestrator".to_string(),
            ))
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_arguments() {
        let args = TransferArgs::parse(&json!({
            "target_agent": "Coder",
            "task": "fix bug in foo.py",
            "relevant_messages": [0, 2]
        }))
        .unwrap();
        assert_eq!(args.target_agent, "Coder");
        assert_eq!(args.relevant_messages, vec![0, 2]);
    }

    #[test]
    fn test_relevant_messages_defaults_empty() {
        let args = TransferArgs::parse(&json!({
            "target_agent": "Coder",
            "task": "do it"
        }))
        .unwrap();
        assert!(args.relevant_messages.is_empty());
    }

    #[test]
    fn test_missing_target_is_bad_arguments() {
        let result = TransferArgs::parse(&json!({"task": "do it"}));
        assert!(matches!(result, Err(TransferError::BadArguments(_))));
    }
}
