use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::base::{
    Effort, Provider, ProviderStream, StopReason, StreamEvent, ThinkingLevel, Usage,
};
use super::utils::{messages_to_openai_spec, tools_to_openai_spec, SseParser, ToolCallAccumulator};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::registry::{Capability, Model};

/// Chat Completions adapter. Serves api.openai.com and any openai-compatible
/// backend (Groq, DeepInfra, custom endpoints) — only host, path, and
/// credentials differ.
pub struct OpenAiProvider {
    client: Client,
    provider_name: String,
    host: String,
    path: String,
    api_key: String,
    model: Model,
    system_prompt: String,
    tools: Vec<Tool>,
    temperature: Option<f32>,
    effort: Option<Effort>,
}

impl OpenAiProvider {
    pub fn new(host: String, api_key: String, model: Model) -> Result<Self, ProviderError> {
        Self::compatible("openai", host, "/v1/chat/completions", api_key, model)
    }

    /// Construct an adapter for an openai-compatible backend under its own
    /// provider name.
    pub fn compatible(
        provider_name: &str,
        host: String,
        path: &str,
        api_key: String,
        model: Model,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            provider_name: provider_name.to_string(),
            host,
            path: path.to_string(),
            api_key,
            model,
            system_prompt: String::new(),
            tools: Vec::new(),
            temperature: None,
            effort: None,
        })
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let vision = self.model.supports(Capability::Vision);
        let mut spec = vec![json!({"role": "system", "content": self.system_prompt})];
        spec.extend(messages_to_openai_spec(messages, vision));

        let mut payload = json!({
            "model": self.model.id,
            "messages": spec,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !self.tools.is_empty() {
            payload["tools"] = json!(tools_to_openai_spec(&self.tools));
        }
        if let Some(temperature) = self.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(effort) = self.effort {
            payload["reasoning_effort"] = json!(match effort {
                Effort::Low => "low",
                Effort::Medium => "medium",
                Effort::High => "high",
            });
        }
        payload
    }

    fn map_finish_reason(reason: &str) -> StopReason {
        match reason {
            "tool_calls" => StopReason::ToolUse,
            "length" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
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
                self.effort = None;
                true
            }
            ThinkingLevel::Effort(effort) => {
                self.effort = Some(effort);
                true
            }
            ThinkingLevel::Budget(_) => false,
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
        let url = format!("{}{}", self.host.trim_end_matches('/'), self.path);
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        Box::pin(try_stream! {
            let response = client
                .post(&url)
                .header("Authorization", format!("Bearer {api_key}"))
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
            // Chat Completions keys tool-call deltas by index, not id
            let mut index_ids: HashMap<u64, String> = HashMap::new();
            let mut stop_reason: Option<StopReason> = None;
            let mut done = false;

            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for sse in parser.push(&chunk) {
                    if sse.data == "[DONE]" {
                        done = true;
                        continue;
                    }
                    let data: Value = match serde_json::from_str(&sse.data) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };

                    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
                        let input = usage["prompt_tokens"].as_i64();
                        let output = usage["completion_tokens"].as_i64();
                        let cost = match (input, output) {
                            (Some(i), Some(o)) => Some(model.cost(i, o)),
                            _ => None,
                        };
                        yield StreamEvent::UsageUpdate {
                            usage: Usage::new(input, output, cost),
                        };
                    }

                    let Some(choice) = data["choices"].get(0) else {
                        continue;
                    };

                    let delta = &choice["delta"];
                    if let Some(text) = delta["content"].as_str() {
                        if !text.is_empty() {
                            yield StreamEvent::TextDelta { text: text.to_string() };
                        }
                    }
                    if let Some(tool_deltas) = delta["tool_calls"].as_array() {
                        for tool_delta in tool_deltas {
                            let index = tool_delta["index"].as_u64().unwrap_or(0);
                            if let Some(id) = tool_delta["id"].as_str() {
                                index_ids.insert(index, id.to_string());
                                let name = tool_delta["function"]["name"]
                                    .as_str()
                                    .unwrap_or_default();
                                if let Some(event) = calls.start(id, name) {
                                    yield event;
                                }
                            }
                            if let Some(arguments) = tool_delta["function"]["arguments"].as_str()
                            {
                                if !arguments.is_empty() {
                                    if let Some(id) = index_ids.get(&index).cloned() {
                                        if let Some(event) = calls.push_args(&id, arguments) {
                                            yield event;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    if let Some(reason) = choice["finish_reason"].as_str() {
                        stop_reason = Some(Self::map_finish_reason(reason));
                    }
                }
                if done {
                    break;
                }
            }

            for event in calls.finish() {
                yield event;
            }
            yield StreamEvent::Stop {
                reason: stop_reason.unwrap_or(StopReason::EndTurn),
            };
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_model() -> Model {
        crate::registry::ModelRegistry::new().get("gpt-4o").unwrap()
    }

    fn sse_body(chunks: &[Value]) -> String {
        let mut body: String = chunks
            .iter()
            .map(|c| format!("data: {c}\n\n"))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn setup(body: String) -> (MockServer, OpenAiProvider) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;
        let provider =
            OpenAiProvider::new(server.uri(), "test_api_key".to_string(), test_model()).unwrap();
        (server, provider)
    }

    #[tokio::test]
    async fn test_stream_text_turn() {
        let body = sse_body(&[
            json!({"choices": [{"delta": {"content": "Hello"}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"content": " there"}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}],
                   "usage": {"prompt_tokens": 9, "completion_tokens": 2}}),
        ]);
        let (_server, provider) = setup(body).await;

        let events: Vec<StreamEvent> = provider
            .stream(&[Message::user().with_text("hi")])
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events[0],
            StreamEvent::TextDelta {
                text: "Hello".to_string()
            }
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::UsageUpdate { usage } if usage.input_tokens == Some(9))));
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Stop {
                reason: StopReason::EndTurn
            }
        );
    }

    #[tokio::test]
    async fn test_stream_tool_call_deltas() {
        let body = sse_body(&[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "web_search", "arguments": ""}}
            ]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"query\":\"go\"}"}}
            ]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ]);
        let (_server, provider) = setup(body).await;

        let events: Vec<StreamEvent> = provider
            .stream(&[Message::user().with_text("latest Go release")])
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events[0],
            StreamEvent::ToolCallStart {
                id: "call_1".to_string(),
                name: "web_search".to_string()
            }
        );
        let end = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallEnd { arguments, .. } => Some(arguments),
                _ => None,
            })
            .unwrap();
        assert_eq!(end.as_ref().unwrap()["query"], "go");
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Stop {
                reason: StopReason::ToolUse
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let provider =
            OpenAiProvider::new(server.uri(), "k".to_string(), test_model()).unwrap();

        let mut stream = provider.stream(&[Message::user().with_text("hi")]);
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(ProviderError::RateLimit(_))
        ));
    }

    #[test]
    fn test_effort_thinking_only() {
        let mut provider =
            OpenAiProvider::new("http://unused".to_string(), "k".to_string(), test_model())
                .unwrap();
        assert!(provider.set_thinking(ThinkingLevel::Effort(Effort::High)));
        assert!(!provider.set_thinking(ThinkingLevel::Budget(2048)));
        // Rejected budget leaves the effort in place
        assert_eq!(provider.effort, Some(Effort::High));
        assert!(provider.set_thinking(ThinkingLevel::Off));
        assert_eq!(provider.effort, None);
    }

    #[test]
    fn test_compatible_backend_name() {
        let provider = OpenAiProvider::compatible(
            "groq",
            "https://api.groq.com/openai".to_string(),
            "/v1/chat/completions",
            "k".to_string(),
            test_model(),
        )
        .unwrap();
        assert_eq!(provider.name(), "groq");
    }

    #[test]
    fn test_payload_carries_system_and_tools() {
        let mut provider =
            OpenAiProvider::new("http://unused".to_string(), "k".to_string(), test_model())
                .unwrap();
        provider.set_system_prompt("You are terse.");
        provider.register_tool(&Tool::new("lookup", "Look something up", json!({})));
        let payload = provider.build_payload(&[Message::user().with_text("q")]);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][0]["content"], "You are terse.");
        assert_eq!(payload["tools"][0]["function"]["name"], "lookup");
        assert_eq!(payload["stream"], true);
    }
}
