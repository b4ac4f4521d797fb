//! Scripted provider for tests: plays back pre-recorded event sequences and
//! records everything the runtime did to it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::stream;

use super::base::{Provider, ProviderStream, StreamEvent, ThinkingLevel};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::registry::{Model, ModelRegistry};

/// Observable adapter state, shared with the test through an `Arc`.
#[derive(Debug, Default)]
pub struct MockState {
    pub system_prompt: Mutex<String>,
    pub tools: Mutex<Vec<String>>,
    pub temperature: Mutex<Option<f32>>,
    /// Every message slice the runtime streamed, in call order.
    pub calls: Mutex<Vec<Vec<Message>>>,
}

pub struct MockProvider {
    state: Arc<MockState>,
    model: Model,
    scripts: Mutex<VecDeque<Vec<Result<StreamEvent, ProviderError>>>>,
    /// When set, a continuation stream (one whose history carries a tool
    /// result) is rejected with a 400 unless the matching assistant message
    /// re-submits its thinking block — the signed-thinking contract.
    require_thinking_continuation: bool,
    /// When set, streams never yield; for exercising cancellation.
    never_completes: bool,
}

impl MockProvider {
    pub fn new(scripts: Vec<Vec<Result<StreamEvent, ProviderError>>>) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            model: ModelRegistry::new().get_current(),
            scripts: Mutex::new(scripts.into()),
            require_thinking_continuation: false,
            never_completes: false,
        }
    }

    /// A provider whose streams hang forever.
    pub fn pending() -> Self {
        let mut provider = Self::new(Vec::new());
        provider.never_completes = true;
        provider
    }

    /// Convenience: scripts of plain events, no errors.
    pub fn with_events(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self::new(
            scripts
                .into_iter()
                .map(|script| script.into_iter().map(Ok).collect())
                .collect(),
        )
    }

    pub fn require_thinking_continuation(mut self) -> Self {
        self.require_thinking_continuation = true;
        self
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    fn continuation_missing_thinking(&self, messages: &[Message]) -> bool {
        let mut pending: Vec<&str> = Vec::new();
        for message in messages {
            for response in message.tool_responses() {
                pending.push(&response.id);
            }
        }
        if pending.is_empty() {
            return false;
        }
        // The assistant message that requested each pending tool must still
        // carry its thinking parts.
        for id in pending {
            let originating = messages.iter().find(|m| {
                m.tool_requests().iter().any(|request| request.id == id)
            });
            match originating {
                Some(message) if !message.thinking_parts().is_empty() => {}
                _ => return true,
            }
        }
        false
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn set_system_prompt(&mut self, prompt: &str) {
        *self.state.system_prompt.lock().unwrap() = prompt.to_string();
    }

    fn register_tool(&mut self, tool: &Tool) {
        self.state.tools.lock().unwrap().push(tool.name.clone());
    }

    fn clear_tools(&mut self) {
        self.state.tools.lock().unwrap().clear();
    }

    fn set_thinking(&mut self, _level: ThinkingLevel) -> bool {
        true
    }

    fn set_temperature(&mut self, temperature: Option<f32>) {
        *self.state.temperature.lock().unwrap() = temperature;
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn set_model(&mut self, model: &Model) {
        self.model = model.clone();
    }

    fn stream(&self, messages: &[Message]) -> ProviderStream {
        self.state.calls.lock().unwrap().push(messages.to_vec());

        if self.never_completes {
            return Box::pin(stream::pending());
        }

        if self.require_thinking_continuation && self.continuation_missing_thinking(messages) {
            return Box::pin(stream::iter(vec![Err(ProviderError::Request(
                "400: thinking block missing from continuation".to_string(),
            ))]));
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Box::pin(stream::iter(script))
    }
}
