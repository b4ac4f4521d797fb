//! The turn engine: a single-turn state machine that drives the provider
//! stream, dispatches tool batches, performs transfers, and snapshots the
//! conversation at turn boundaries.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::manager::AgentManager;
use crate::agents::remote::RemoteAgentClient;
use crate::conversation::Conversation;
use crate::errors::{Error, ProviderError, StateError, ToolError};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::ToolCall;
use crate::persistence::ConversationStore;
use crate::providers::base::{ProviderStream, StopReason, StreamEvent};
use crate::providers::utils::flatten_tool_result;
use crate::tools::transfer::{TransferArgs, TRANSFER_TOOL_NAME};

/// Concurrency bound for one tool batch.
pub const TOOL_CONCURRENCY: usize = 4;
const UI_CHANNEL_CAPACITY: usize = 256;
/// Soft cap on a whole turn, over and above provider-level timeouts.
const TURN_SOFT_CAP: std::time::Duration = std::time::Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    Tools,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnState::Idle => write!(f, "IDLE"),
            TurnState::Streaming => write!(f, "STREAMING"),
            TurnState::Tools => write!(f, "TOOLS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
}

/// Events delivered to the UI during a turn. Raw provider events are
/// forwarded verbatim in `Stream`; the rest mark orchestration milestones.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Stream {
        agent: String,
        event: StreamEvent,
    },
    ToolResult {
        agent: String,
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    AgentChanged {
        agent: String,
    },
    TurnCompleted {
        agent: String,
        conversation_id: String,
    },
}

/// Bounded, non-blocking event delivery. Display deltas are dropped when the
/// UI lags; milestone events wait for room. History state never travels this
/// channel, so nothing durable is ever lost.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<UiEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<UiEvent>) {
        let (tx, rx) = mpsc::channel(UI_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    fn is_droppable(event: &UiEvent) -> bool {
        matches!(
            event,
            UiEvent::Stream {
                event: StreamEvent::TextDelta { .. }
                    | StreamEvent::ThinkingDelta { .. }
                    | StreamEvent::ToolCallArgsDelta { .. },
                ..
            }
        )
    }

    async fn emit(&self, event: UiEvent) {
        if Self::is_droppable(&event) {
            if self.tx.try_send(event).is_err() {
                tracing::debug!("UI lagging, dropping display delta");
            }
        } else {
            let _ = self.tx.send(event).await;
        }
    }
}

/// The in-progress assistant message for one stream.
#[derive(Default)]
struct Draft {
    text: String,
    thinking: String,
    signature: String,
    calls: Vec<(String, String, Result<Value, ToolError>)>,
}

impl Draft {
    fn push_call(&mut self, id: String, name: String, arguments: Result<Value, ToolError>) {
        if self.calls.iter().any(|(existing, _, _)| existing == &id) {
            tracing::warn!(id = %id, "duplicate tool call id in stream, keeping first");
            return;
        }
        self.calls.push((id, name, arguments));
    }

    fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Build the assistant message: thinking first (verbatim, so that
    /// continuation streams pass signature checks), then text, then the tool
    /// requests. Providers reject empty text next to tool calls, so the text
    /// part degrades to a single space.
    fn into_message(self) -> Option<Message> {
        let mut message = Message::assistant();
        if !self.thinking.is_empty() {
            let signature = if self.signature.is_empty() {
                None
            } else {
                Some(self.signature)
            };
            message = message.with_thinking(self.thinking, signature);
        }
        if !self.text.is_empty() {
            message = message.with_text(self.text);
        } else if !self.calls.is_empty() {
            message = message.with_text(" ");
        }
        for (id, name, arguments) in self.calls {
            let call = arguments.map(|args| ToolCall::new(&name, args));
            message = message.with_tool_request(id, call);
        }
        if message.content.is_empty() {
            None
        } else {
            Some(message)
        }
    }
}

enum StreamEnd {
    Stopped(StopReason),
    Cancelled,
}

pub struct TurnEngine {
    manager: AgentManager,
    store: ConversationStore,
    conversation: Conversation,
    state: TurnState,
}

impl TurnEngine {
    pub fn new(manager: AgentManager, store: ConversationStore) -> Self {
        Self {
            manager,
            store,
            conversation: Conversation::new(),
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn manager(&self) -> &AgentManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> Result<&mut AgentManager, StateError> {
        self.ensure_idle("agent/model change")?;
        Ok(&mut self.manager)
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    fn ensure_idle(&self, operation: &str) -> Result<(), StateError> {
        if self.state != TurnState::Idle {
            return Err(StateError {
                state: self.state.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Start a fresh conversation, discarding in-memory histories.
    pub fn clear(&mut self) -> Result<(), StateError> {
        self.ensure_idle("/clear")?;
        self.manager.clear_histories();
        self.conversation = Conversation::new();
        Ok(())
    }

    /// Load a stored conversation and re-point the agent histories at it.
    pub fn load_conversation(&mut self, id: &str) -> Result<(), Error> {
        self.ensure_idle("/load")?;
        let conversation = self.store.load(id)?;
        self.manager.restore_histories(conversation.histories.clone());
        self.conversation = conversation;
        Ok(())
    }

    /// Rewind to the end of the given turn; later content is discarded.
    pub fn jump(&mut self, turn: usize) -> Result<(), Error> {
        self.ensure_idle("/jump")?;
        self.conversation.jump(turn)?;
        self.manager
            .restore_histories(self.conversation.histories.clone());
        Ok(())
    }

    /// Run one user turn to completion (or cancellation). Turns are strictly
    /// serialized: input is rejected unless the engine is idle.
    pub async fn run_turn(
        &mut self,
        user_message: Message,
        events: &EventSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, Error> {
        self.ensure_idle("user input")?;
        if self.manager.current_agent().is_none() {
            return Err(StateError {
                state: TurnState::Idle.to_string(),
                operation: "user input with no agent selected".to_string(),
            }
            .into());
        }

        let preview = user_message.text();
        let snapshot = self.manager.histories();
        self.state = TurnState::Streaming;
        self.manager
            .current_agent_mut()
            .expect("checked above")
            .history
            .push(user_message);

        let result = match tokio::time::timeout(TURN_SOFT_CAP, self.turn_loop(events, &cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Request("turn exceeded the soft time cap".to_string())
                .into()),
        };
        self.state = TurnState::Idle;

        match result {
            Ok(StreamEnd::Stopped(_)) => {
                let agent = self
                    .manager
                    .current_name()
                    .unwrap_or_default()
                    .to_string();
                self.conversation
                    .record_turn(&agent, &preview, self.manager.histories());
                if let Err(e) = self.store.save(&self.conversation) {
                    // The turn stays in memory; the next snapshot retries
                    tracing::warn!("failed to persist conversation: {e}");
                }
                events
                    .emit(UiEvent::TurnCompleted {
                        agent,
                        conversation_id: self.conversation.id.clone(),
                    })
                    .await;
                Ok(TurnOutcome::Completed)
            }
            Ok(StreamEnd::Cancelled) => {
                // No partial-turn commit: histories return to turn start
                self.manager.restore_histories(snapshot);
                Ok(TurnOutcome::Cancelled)
            }
            Err(e) => {
                self.manager.restore_histories(snapshot);
                Err(e)
            }
        }
    }

    /// The streaming/tool loop: stream until a stop, commit the draft,
    /// execute tools or finish, repeat until the assistant ends its turn.
    async fn turn_loop(
        &mut self,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, Error> {
        loop {
            let agent_name = self
                .manager
                .current_name()
                .expect("turn always has a current agent")
                .to_string();
            let history = self
                .manager
                .current_agent()
                .expect("turn always has a current agent")
                .history
                .clone();
            let endpoint = self
                .manager
                .current_agent()
                .and_then(|a| a.remote_endpoint.clone());

            let stream = match endpoint {
                Some(endpoint) => Self::open_remote_stream(&endpoint, &history)?,
                None => self.manager.provider().stream(&history),
            };

            let (draft, end) = self
                .consume_stream(stream, &agent_name, events, cancel)
                .await?;

            let reason = match end {
                StreamEnd::Cancelled => return Ok(StreamEnd::Cancelled),
                StreamEnd::Stopped(reason) => reason,
            };

            match reason {
                StopReason::ToolUse if draft.has_calls() => {
                    self.state = TurnState::Tools;
                    let calls = self.commit_draft(draft);

                    if let Some(transfer) = Self::find_transfer(&calls) {
                        let args = TransferArgs::parse(&transfer)?;
                        self.manager.transfer(&args)?;
                        let agent = self.manager.current_name().unwrap().to_string();
                        events.emit(UiEvent::AgentChanged { agent }).await;
                        self.state = TurnState::Streaming;
                        continue;
                    }

                    match self.execute_tools(calls, &agent_name, events, cancel).await {
                        Some(()) => {
                            self.state = TurnState::Streaming;
                            continue;
                        }
                        None => return Ok(StreamEnd::Cancelled),
                    }
                }
                reason => {
                    self.commit_draft(draft);
                    if let StopReason::Error(message) = reason {
                        return Err(ProviderError::Request(message).into());
                    }
                    return Ok(StreamEnd::Stopped(reason));
                }
            }
        }
    }

    fn open_remote_stream(endpoint: &str, history: &[Message]) -> Result<ProviderStream, Error> {
        let task = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default();
        let relevant: Vec<Message> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .take(history.len().saturating_sub(1))
            .cloned()
            .collect();
        let client = RemoteAgentClient::new(endpoint.to_string())?;
        Ok(client.stream(&task, &relevant))
    }

    /// Drain one provider stream into a draft, forwarding events to the UI.
    async fn consume_stream(
        &self,
        mut stream: ProviderStream,
        agent_name: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(Draft, StreamEnd), Error> {
        let mut draft = Draft::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream releases the connection
                    return Ok((draft, StreamEnd::Cancelled));
                }
                event = stream.next() => event,
            };

            let event = match event {
                None => return Ok((draft, StreamEnd::Stopped(StopReason::EndTurn))),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(event)) => event,
            };

            let mut stop = None;
            match &event {
                StreamEvent::TextDelta { text } => draft.text.push_str(text),
                StreamEvent::ThinkingDelta { text } => draft.thinking.push_str(text),
                StreamEvent::ThinkingSignature { signature } => {
                    draft.signature.push_str(signature)
                }
                StreamEvent::ToolCallEnd {
                    id,
                    name,
                    arguments,
                } => {
                    draft.push_call(id.clone(), name.clone(), arguments.clone());
                }
                StreamEvent::ToolCallStart { .. }
                | StreamEvent::ToolCallArgsDelta { .. }
                | StreamEvent::UsageUpdate { .. } => {}
                StreamEvent::Stop { reason } => stop = Some(reason.clone()),
            }

            events
                .emit(UiEvent::Stream {
                    agent: agent_name.to_string(),
                    event,
                })
                .await;

            if let Some(reason) = stop {
                return Ok((draft, StreamEnd::Stopped(reason)));
            }
        }
    }

    /// Append the draft to the current agent's history, returning the tool
    /// calls it carried.
    fn commit_draft(&mut self, draft: Draft) -> Vec<(String, String, Result<Value, ToolError>)> {
        let calls = draft
            .calls
            .iter()
            .map(|(id, name, args)| (id.clone(), name.clone(), args.clone()))
            .collect();
        if let Some(message) = draft.into_message() {
            if let Some(agent) = self.manager.current_agent_mut() {
                agent.history.push(message);
            }
        }
        calls
    }

    /// First successfully-parsed `transfer` call, if any. Transfer wins over
    /// its siblings: the rest of the batch is suppressed.
    fn find_transfer(calls: &[(String, String, Result<Value, ToolError>)]) -> Option<Value> {
        calls.iter().find_map(|(_, name, arguments)| {
            if name == TRANSFER_TOOL_NAME {
                arguments.as_ref().ok().cloned()
            } else {
                None
            }
        })
    }

    /// Execute a tool batch with bounded concurrency. Results are appended
    /// in call order regardless of completion order, keeping provider-side
    /// id matching stable. Returns `None` on cancellation.
    async fn execute_tools(
        &mut self,
        calls: Vec<(String, String, Result<Value, ToolError>)>,
        agent_name: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Option<()> {
        let registry = Arc::clone(self.manager.tool_registry());
        let tasks = calls.into_iter().map(|(id, name, arguments)| {
            let registry = Arc::clone(&registry);
            async move {
                let result = match arguments {
                    Ok(arguments) => registry.invoke(&name, arguments).await,
                    // The model sees the parse failure as a structured error
                    Err(e) => Err(e),
                };
                (id, name, result)
            }
        });
        let mut batch = futures::stream::iter(tasks).buffered(TOOL_CONCURRENCY);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return None,
                next = batch.next() => next,
            };
            let Some((id, name, result)) = next else {
                return Some(());
            };

            let message = Message::tool(&id, result);
            let response = message.tool_responses()[0];
            let (content, is_error) = flatten_tool_result(response);
            events
                .emit(UiEvent::ToolResult {
                    agent: agent_name.to_string(),
                    id: id.clone(),
                    name,
                    content,
                    is_error,
                })
                .await;
            if let Some(agent) = self.manager.current_agent_mut() {
                agent.history.push(message);
            }
        }
    }
}
