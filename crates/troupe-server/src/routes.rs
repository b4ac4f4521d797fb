//! The agent-to-agent endpoint: each local agent is exposed at
//! `<base-url>/<agent-name>`, accepting a task envelope and returning the
//! turn's canonical stream events, one JSON object per line.

use axum::{
    extract::{Path, State},
    http::{self, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use troupe::engine::{EventSink, UiEvent};
use troupe::models::message::Message;
use troupe::providers::base::{StopReason, StreamEvent};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    task: String,
    #[serde(default)]
    relevant_messages: Vec<Message>,
}

/// Streaming newline-delimited JSON response.
struct EventStreamResponse {
    rx: ReceiverStream<String>,
}

impl IntoResponse for EventStreamResponse {
    fn into_response(self) -> axum::response::Response {
        let body = axum::body::Body::from_stream(
            self.rx.map(|line| Ok::<Bytes, std::convert::Infallible>(Bytes::from(line))),
        );
        http::Response::builder()
            .header("Content-Type", "application/x-ndjson")
            .header("Cache-Control", "no-cache")
            .body(body)
            .unwrap()
    }
}

fn event_line(event: &StreamEvent) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_default();
    line.push('\n');
    line
}

async fn task_handler(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    Json(envelope): Json<TaskEnvelope>,
) -> Result<EventStreamResponse, StatusCode> {
    {
        let engine = state.engine.lock().await;
        if engine.manager().agent(&agent_name).is_none() {
            return Err(StatusCode::NOT_FOUND);
        }
    }

    let (sink, mut events) = EventSink::channel();
    let (tx, rx) = mpsc::channel::<String>(64);

    // Forward the turn's raw stream events as JSON lines
    let forward_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let UiEvent::Stream { event, .. } = event {
                if forward_tx.send(event_line(&event)).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut engine = state.engine.lock().await;

        // Construct the target's turn context exactly as a transfer would:
        // rendered system prompt, the caller's message slice, then the task
        // as a synthetic user message.
        let setup = (|| -> Result<(), troupe::errors::Error> {
            let manager = engine.manager_mut()?;
            let roster = manager.roster();
            let rendered = manager
                .agent(&agent_name)
                .expect("checked before spawning")
                .render_system_prompt(&roster);
            let mut history = vec![Message::system().with_text(rendered)];
            history.extend(envelope.relevant_messages);
            manager
                .agent_mut(&agent_name)
                .expect("checked before spawning")
                .history = history;
            manager.select(&agent_name)?;
            Ok(())
        })();

        let result = match setup {
            Ok(()) => {
                engine
                    .run_turn(
                        Message::user().with_text(&envelope.task),
                        &sink,
                        CancellationToken::new(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::warn!(agent = %agent_name, "a2a turn failed: {e}");
            let stop = StreamEvent::Stop {
                reason: StopReason::Error(e.user_message()),
            };
            let _ = tx.send(event_line(&stop)).await;
        }
    });

    Ok(EventStreamResponse {
        rx: ReceiverStream::new(rx),
    })
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/:agent", post(task_handler))
        .with_state(state)
}
