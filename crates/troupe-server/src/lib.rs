pub mod routes;
pub mod state;

use std::net::SocketAddr;

use anyhow::Result;

pub use state::AppState;
use troupe::engine::TurnEngine;

/// Serve the agent-to-agent endpoint until the process exits.
pub async fn serve(engine: TurnEngine, addr: SocketAddr) -> Result<()> {
    let state = AppState::new(engine);
    let app = routes::routes(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("a2a server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::StreamExt;
    use troupe::agents::manager::AgentManager;
    use troupe::config::{AgentConfig, AgentsFile, GlobalConfig};
    use troupe::persistence::ConversationStore;
    use troupe::providers::base::{StopReason, StreamEvent};
    use troupe::providers::mock::MockProvider;
    use troupe::registry::ModelRegistry;
    use troupe::tools::registry::ToolRegistry;

    fn test_engine(dir: &std::path::Path) -> TurnEngine {
        let provider = MockProvider::with_events(vec![vec![
            StreamEvent::TextDelta {
                text: "done: fixed the bug".to_string(),
            },
            StreamEvent::Stop {
                reason: StopReason::EndTurn,
            },
        ]]);
        let manager = AgentManager::new(
            AgentsFile {
                agents: vec![AgentConfig {
                    name: "Coder".to_string(),
                    description: "Writes code".to_string(),
                    tools: vec![],
                    system_prompt: "You code.".to_string(),
                    temperature: None,
                    remote_endpoint: None,
                }],
            },
            Box::new(provider),
            Arc::new(ToolRegistry::new()),
            Arc::new(ModelRegistry::new()),
            GlobalConfig::default(),
        )
        .unwrap();
        TurnEngine::new(manager, ConversationStore::new(dir).unwrap())
    }

    #[tokio::test]
    async fn test_task_endpoint_streams_events() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_engine(dir.path()));
        let app = routes::routes(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/Coder"))
            .json(&serde_json::json!({
                "task": "fix bug in foo.py",
                "relevant_messages": []
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let mut body = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        }

        let events: Vec<StreamEvent> = body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::TextDelta { text } if text.contains("fixed the bug")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Stop { .. })));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_engine(dir.path()));
        let app = routes::routes(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/Nobody"))
            .json(&serde_json::json!({"task": "t"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }
}
