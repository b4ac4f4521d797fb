use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::base::{Provider, ProviderStream, StopReason, StreamEvent, ThinkingLevel, Usage};
use super::utils::{flatten_tool_result, SseParser, ToolCallAccumulator};
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::registry::{Capability, Model};

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MIN_THINKING_BUDGET: u32 = 1024;

pub struct AnthropicProvider {
    client: Client,
    host: String,
    api_key: String,
    model: Model,
    system_prompt: String,
    tools: Vec<Tool>,
    temperature: Option<f32>,
    thinking_budget: Option<u32>,
}

impl AnthropicProvider {
    pub fn new(host: String, api_key: String, model: Model) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            host,
            api_key,
            model,
            system_prompt: String::new(),
            tools: Vec::new(),
            temperature: None,
            thinking_budget: None,
        })
    }

    /// Convert canonical messages to the Messages API shape.
    ///
    /// There is no dedicated tool role: tool results become user messages
    /// with `tool_result` blocks, and consecutive tool messages merge into a
    /// single user turn so roles keep alternating. Signed thinking blocks are
    /// passed through verbatim.
    fn messages_to_anthropic_spec(messages: &[Message], vision: bool) -> Vec<Value> {
        let mut output: Vec<Value> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => continue,
                Role::User => {
                    let mut blocks = Vec::new();
                    for content in &message.content {
                        match content {
                            MessageContent::Text(text) => {
                                blocks.push(json!({"type": "text", "text": text.text}));
                            }
                            MessageContent::Image(image) => {
                                if vision {
                                    blocks.push(json!({
                                        "type": "image",
                                        "source": {
                                            "type": "base64",
                                            "media_type": image.mime_type,
                                            "data": image.data,
                                        }
                                    }));
                                } else {
                                    tracing::debug!("dropping image part for non-vision model");
                                }
                            }
                            MessageContent::Document(doc) => {
                                blocks.push(json!({
                                    "type": "document",
                                    "source": {
                                        "type": "base64",
                                        "media_type": doc.mime_type,
                                        "data": doc.data,
                                    }
                                }));
                            }
                            _ => {}
                        }
                    }
                    output.push(json!({"role": "user", "content": blocks}));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    for content in &message.content {
                        match content {
                            MessageContent::Thinking(thinking) => {
                                let mut block = json!({
                                    "type": "thinking",
                                    "thinking": thinking.thinking,
                                });
                                if let Some(signature) = &thinking.signature {
                                    block["signature"] = json!(signature);
                                }
                                blocks.push(block);
                            }
                            MessageContent::Text(text) => {
                                // The API rejects empty text blocks
                                if !text.text.is_empty() && text.text != " " {
                                    blocks.push(json!({"type": "text", "text": text.text}));
                                }
                            }
                            MessageContent::ToolRequest(request) => {
                                if let Ok(call) = &request.tool_call {
                                    blocks.push(json!({
                                        "type": "tool_use",
                                        "id": request.id,
                                        "name": call.name,
                                        "input": call.arguments,
                                    }));
                                }
                            }
                            _ => {}
                        }
                    }
                    output.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    let mut blocks = Vec::new();
                    for response in message.tool_responses() {
                        let (text, is_error) = flatten_tool_result(response);
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": response.id,
                            "content": text,
                            "is_error": is_error,
                        }));
                    }
                    // Merge with a preceding tool-result user message
                    if let Some(last) = output.last_mut() {
                        let mergeable = last["role"] == "user"
                            && last["content"]
                                .as_array()
                                .map(|blocks| {
                                    blocks.iter().all(|b| b["type"] == "tool_result")
                                })
                                .unwrap_or(false);
                        if mergeable {
                            last["content"]
                                .as_array_mut()
                                .unwrap()
                                .extend(blocks);
                            continue;
                        }
                    }
                    output.push(json!({"role": "user", "content": blocks}));
                }
            }
        }

        output
    }

    fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect()
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let vision = self.model.supports(Capability::Vision);
        let mut payload = json!({
            "model": self.model.id,
            "messages": Self::messages_to_anthropic_spec(messages, vision),
            "max_tokens": self.thinking_budget.map_or(DEFAULT_MAX_TOKENS, |b| b + DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !self.system_prompt.is_empty() {
            payload["system"] = json!(self.system_prompt);
        }
        if !self.tools.is_empty() {
            payload["tools"] = json!(Self::tools_to_anthropic_spec(&self.tools));
        }
        if let Some(budget) = self.thinking_budget {
            payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        } else if let Some(temperature) = self.temperature {
            // Thinking requires the default temperature
            payload["temperature"] = json!(temperature);
        }
        payload
    }

    fn map_stop_reason(reason: &str) -> StopReason {
        match reason {
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn set_system_prompt(&mut self, prompt: &str) {
        self.system_prompt = prompt.to_string();
    }

    fn register_tool(&mut self, tool: &Tool) {
        if !self.tools.iter().any(|t| t.name == tool.name) {
            self.tools.push(tool.clone());
        }
    }

    fn clear_tools(&mut self) {
        self.tools.clear();
    }

    fn set_thinking(&mut self, level: ThinkingLevel) -> bool {
        match level {
            ThinkingLevel::Off => {
                self.thinking_budget = None;
                true
            }
            ThinkingLevel::Budget(budget) => {
                if budget < MIN_THINKING_BUDGET {
                    tracing::warn!(
                        requested = budget,
                        minimum = MIN_THINKING_BUDGET,
                        "thinking budget below provider minimum, raising"
                    );
                }
                self.thinking_budget = Some(budget.max(MIN_THINKING_BUDGET));
                true
            }
            ThinkingLevel::Effort(_) => false,
        }
    }

    fn set_temperature(&mut self, temperature: Option<f32>) {
        self.temperature = temperature;
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn set_model(&mut self, model: &Model) {
        self.model = model.clone();
    }

    fn stream(&self, messages: &[Message]) -> ProviderStream {
        let payload = self.build_payload(messages);
        let client = self.client.clone();
        let url = format!("{}/v1/messages", self.host.trim_end_matches('/'));
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        Box::pin(try_stream! {
            let response = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .json(&payload)
                .send()
                .await?;

            let status = response.status();
            if status != StatusCode::OK {
                let body = response.text().await.unwrap_or_default();
                Err::<(), ProviderError>(match status {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        ProviderError::Authentication(body)
                    }
                    StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimit(body),
                    StatusCode::NOT_FOUND => ProviderError::ModelNotFound(model.id.clone()),
                    _ => ProviderError::Request(format!("{status}: {body}")),
                })?;
                return;
            }

            let mut body = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut calls = ToolCallAccumulator::new();
            // Maps content-block index to tool-call id for delta routing
            let mut block_tools: HashMap<u64, String> = HashMap::new();
            let mut input_tokens: Option<i64> = None;
            let mut stop_reason = StopReason::EndTurn;

            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for sse in parser.push(&chunk) {
                    let data: Value = match serde_json::from_str(&sse.data) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };
                    match data["type"].as_str().unwrap_or_default() {
                        "message_start" => {
                            input_tokens = data["message"]["usage"]["input_tokens"].as_i64();
                        }
                        "content_block_start" => {
                            let block = &data["content_block"];
                            if block["type"] == "tool_use" {
                                let id = block["id"].as_str().unwrap_or_default().to_string();
                                let name = block["name"].as_str().unwrap_or_default();
                                if let Some(index) = data["index"].as_u64() {
                                    block_tools.insert(index, id.clone());
                                }
                                if let Some(event) = calls.start(&id, name) {
                                    yield event;
                                }
                            }
                        }
                        "content_block_delta" => {
                            let delta = &data["delta"];
                            match delta["type"].as_str().unwrap_or_default() {
                                "text_delta" => {
                                    if let Some(text) = delta["text"].as_str() {
                                        yield StreamEvent::TextDelta { text: text.to_string() };
                                    }
                                }
                                "thinking_delta" => {
                                    if let Some(text) = delta["thinking"].as_str() {
                                        yield StreamEvent::ThinkingDelta {
                                            text: text.to_string(),
                                        };
                                    }
                                }
                                "signature_delta" => {
                                    if let Some(signature) = delta["signature"].as_str() {
                                        yield StreamEvent::ThinkingSignature {
                                            signature: signature.to_string(),
                                        };
                                    }
                                }
                                "input_json_delta" => {
                                    let id = data["index"]
                                        .as_u64()
                                        .and_then(|index| block_tools.get(&index).cloned());
                                    if let (Some(id), Some(partial)) =
                                        (id, delta["partial_json"].as_str())
                                    {
                                        if let Some(event) = calls.push_args(&id, partial) {
                                            yield event;
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            let id = data["index"]
                                .as_u64()
                                .and_then(|index| block_tools.remove(&index));
                            if let Some(id) = id {
                                if let Some(event) = calls.end(&id) {
                                    yield event;
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                                stop_reason = Self::map_stop_reason(reason);
                            }
                            let output_tokens = data["usage"]["output_tokens"].as_i64();
                            let cost = match (input_tokens, output_tokens) {
                                (Some(input), Some(output)) => Some(model.cost(input, output)),
                                _ => None,
                            };
                            yield StreamEvent::UsageUpdate {
                                usage: Usage::new(input_tokens, output_tokens, cost),
                            };
                        }
                        "message_stop" => {
                            for event in calls.finish() {
                                yield event;
                            }
                            yield StreamEvent::Stop { reason: stop_reason.clone() };
                        }
                        "error" => {
                            let message = data["error"]["message"]
                                .as_str()
                                .unwrap_or("unknown provider error")
                                .to_string();
                            Err::<(), ProviderError>(ProviderError::Request(message))?;
                        }
                        _ => {}
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_model() -> Model {
        crate::registry::ModelRegistry::new()
            .get("claude-3-7-sonnet-latest")
            .unwrap()
    }

    async fn setup(body: &str) -> (MockServer, AnthropicProvider) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_API_VERSION))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body.to_string(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let provider =
            AnthropicProvider::new(server.uri(), "test_api_key".to_string(), test_model())
                .unwrap();
        (server, provider)
    }

    async fn collect(provider: &AnthropicProvider, messages: &[Message]) -> Vec<StreamEvent> {
        provider
            .stream(messages)
            .map(|e| e.expect("stream event"))
            .collect()
            .await
    }

    fn sse(events: &[(&str, Value)]) -> String {
        events
            .iter()
            .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_stream_text_turn() {
        let body = sse(&[
            (
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 10}}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "text_delta", "text": "pong"}}),
            ),
            (
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"},
                       "usage": {"output_tokens": 4}}),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
        let (_server, provider) = setup(&body).await;

        let events = collect(&provider, &[Message::user().with_text("ping")]).await;
        assert_eq!(
            events[0],
            StreamEvent::TextDelta {
                text: "pong".to_string()
            }
        );
        match &events[1] {
            StreamEvent::UsageUpdate { usage } => {
                assert_eq!(usage.input_tokens, Some(10));
                assert_eq!(usage.output_tokens, Some(4));
                assert!(usage.cost.unwrap() > 0.0);
            }
            other => panic!("expected UsageUpdate, got {other:?}"),
        }
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Stop {
                reason: StopReason::EndTurn
            }
        );
    }

    #[tokio::test]
    async fn test_stream_tool_use() {
        let body = sse(&[
            (
                "content_block_start",
                json!({"type": "content_block_start", "index": 0,
                       "content_block": {"type": "tool_use", "id": "t1", "name": "web_search"}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "input_json_delta", "partial_json": "{\"query\":"}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "input_json_delta", "partial_json": "\"latest Go release\"}"}}),
            ),
            (
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            ),
            (
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"},
                       "usage": {"output_tokens": 12}}),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
        let (_server, provider) = setup(&body).await;

        let events = collect(&provider, &[Message::user().with_text("latest Go release")]).await;
        assert_eq!(
            events[0],
            StreamEvent::ToolCallStart {
                id: "t1".to_string(),
                name: "web_search".to_string()
            }
        );
        let end = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallEnd { id, arguments, .. } => Some((id, arguments)),
                _ => None,
            })
            .expect("tool call end");
        assert_eq!(end.0, "t1");
        assert_eq!(end.1.as_ref().unwrap()["query"], "latest Go release");
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Stop {
                reason: StopReason::ToolUse
            }
        );
    }

    #[tokio::test]
    async fn test_stream_thinking_with_signature() {
        let body = sse(&[
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "thinking_delta", "thinking": "Let me reason."}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "signature_delta", "signature": "c2ln"}}),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
        let (_server, provider) = setup(&body).await;

        let events = collect(&provider, &[Message::user().with_text("think")]).await;
        assert_eq!(
            events[0],
            StreamEvent::ThinkingDelta {
                text: "Let me reason.".to_string()
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::ThinkingSignature {
                signature: "c2ln".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_authentication_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;
        let provider =
            AnthropicProvider::new(server.uri(), "bad_key".to_string(), test_model()).unwrap();

        let mut stream = provider.stream(&[Message::user().with_text("hi")]);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ProviderError::Authentication(_))));
    }

    #[test]
    fn test_thinking_budget_minimum_raised() {
        let mut provider =
            AnthropicProvider::new("http://unused".to_string(), "k".to_string(), test_model())
                .unwrap();
        assert!(provider.set_thinking(ThinkingLevel::Budget(100)));
        assert_eq!(provider.thinking_budget, Some(MIN_THINKING_BUDGET));
        assert!(!provider.set_thinking(ThinkingLevel::Effort(super::super::base::Effort::Low)));
        assert!(provider.set_thinking(ThinkingLevel::Off));
        assert_eq!(provider.thinking_budget, None);
    }

    #[test]
    fn test_spec_tool_results_become_user_messages() {
        let messages = vec![
            Message::user().with_text("search"),
            Message::assistant().with_tool_request(
                "t1",
                Ok(ToolCall::new("web_search", json!({"query": "go"}))),
            ),
            Message::tool(
                "t1",
                Ok(vec![crate::models::content::Content::text("Go 1.23")]),
            ),
        ];
        let spec = AnthropicProvider::messages_to_anthropic_spec(&messages, true);
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[2]["role"], "user");
        assert_eq!(spec[2]["content"][0]["type"], "tool_result");
        assert_eq!(spec[2]["content"][0]["tool_use_id"], "t1");
        assert_eq!(spec[2]["content"][0]["is_error"], false);
    }

    #[test]
    fn test_spec_merges_consecutive_tool_results() {
        let messages = vec![
            Message::tool("t1", Ok(vec![crate::models::content::Content::text("a")])),
            Message::tool("t2", Ok(vec![crate::models::content::Content::text("b")])),
        ];
        let spec = AnthropicProvider::messages_to_anthropic_spec(&messages, true);
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_spec_preserves_thinking_blocks_verbatim() {
        let messages = vec![Message::assistant()
            .with_thinking("chain of thought", Some("c2lnbmF0dXJl".to_string()))
            .with_tool_request("t1", Ok(ToolCall::new("lookup", json!({}))))];
        let spec = AnthropicProvider::messages_to_anthropic_spec(&messages, true);
        let blocks = spec[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["thinking"], "chain of thought");
        assert_eq!(blocks[0]["signature"], "c2lnbmF0dXJl");
        assert_eq!(blocks[1]["type"], "tool_use");
    }
}
