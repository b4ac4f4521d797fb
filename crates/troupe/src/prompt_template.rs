use chrono::Utc;
use serde::Serialize;
use tera::{Context, Error as TeraError, Tera};

use crate::agents::agent::AgentSummary;
use crate::tools::transfer::TRANSFER_TOOL_NAME;

const TRANSFER_SECTION: &str = include_str!("prompts/transfer.md");

/// Render an inline tera template against any serializable context.
pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    tera.render("inline_template", &context)
}

/// Render an agent's system prompt: substitute the `{current_date}`
/// placeholder, then append the transfer roster section when the agent is
/// configured with the transfer tool and there are peers to hand off to.
pub fn render_system_prompt(
    template: &str,
    agent_name: &str,
    tool_names: &[String],
    roster: &[AgentSummary],
) -> String {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    let mut prompt = template.replace("{current_date}", &date);

    let has_transfer = tool_names.iter().any(|t| t == TRANSFER_TOOL_NAME);
    let peers: Vec<&AgentSummary> = roster.iter().filter(|a| a.name != agent_name).collect();
    if has_transfer && !peers.is_empty() {
        #[derive(Serialize)]
        struct TransferContext<'a> {
            agents: Vec<&'a AgentSummary>,
        }
        match load_prompt(TRANSFER_SECTION, &TransferContext { agents: peers }) {
            Ok(section) => {
                prompt.push_str("\n\n");
                prompt.push_str(section.trim_end());
            }
            Err(e) => tracing::warn!("failed to render transfer section: {e}"),
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn roster() -> Vec<AgentSummary> {
        vec![
            AgentSummary {
                name: "Router".to_string(),
                description: "Routes requests".to_string(),
            },
            AgentSummary {
                name: "Coder".to_string(),
                description: "Writes code".to_string(),
            },
        ]
    }

    fn transfer_tools() -> Vec<String> {
        vec!["transfer".to_string()]
    }

    #[test]
    fn test_load_prompt() {
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        let result = load_prompt("Hello, {{ name }}!", &context).unwrap();
        assert_eq!(result, "Hello, Alice!");
    }

    #[test]
    fn test_current_date_substitution() {
        let rendered = render_system_prompt("Today is {current_date}.", "Solo", &[], &[]);
        assert!(!rendered.contains("{current_date}"));
        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(rendered, format!("Today is {date}."));
    }

    #[test]
    fn test_transfer_section_lists_peers_only() {
        let rendered = render_system_prompt("Base.", "Router", &transfer_tools(), &roster());
        assert!(rendered.contains("Coder: Writes code"));
        assert!(!rendered.contains("Router: Routes requests"));
        assert!(rendered.contains("transfer"));
    }

    #[test]
    fn test_no_transfer_section_for_single_agent() {
        let roster = vec![AgentSummary {
            name: "Echo".to_string(),
            description: "Echoes".to_string(),
        }];
        let rendered = render_system_prompt("Base.", "Echo", &transfer_tools(), &roster);
        assert_eq!(rendered, "Base.");
    }

    #[test]
    fn test_no_transfer_section_without_transfer_tool() {
        // Peers exist, but the agent is not configured with transfer: the
        // prompt must not advertise a capability the adapter won't carry.
        let tools = vec!["web_search".to_string()];
        let rendered = render_system_prompt("Base.", "Router", &tools, &roster());
        assert_eq!(rendered, "Base.");
    }
}
