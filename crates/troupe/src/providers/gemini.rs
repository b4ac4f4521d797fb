use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::base::{Provider, ProviderStream, StopReason, StreamEvent, ThinkingLevel, Usage};
use super::utils::{flatten_tool_result, SseParser};
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::registry::{Capability, Model};

const MIN_THINKING_BUDGET: u32 = 1024;

pub struct GeminiProvider {
    client: Client,
    host: String,
    api_key: String,
    model: Model,
    system_prompt: String,
    tools: Vec<Tool>,
    temperature: Option<f32>,
    thinking_budget: Option<u32>,
}

impl GeminiProvider {
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

    /// Find the tool name a response id refers to. generateContent matches
    /// function responses by name, so the id is resolved against the
    /// originating request in the canonical history.
    fn tool_name_for_id(messages: &[Message], id: &str) -> Option<String> {
        messages.iter().rev().find_map(|message| {
            message.tool_requests().iter().find_map(|request| {
                if request.id == id {
                    request.tool_call.as_ref().ok().map(|c| c.name.clone())
                } else {
                    None
                }
            })
        })
    }

    /// Convert canonical messages to generateContent `contents`. There is no
    /// tool role: results become user turns carrying `functionResponse`
    /// parts, matched by tool name.
    fn messages_to_gemini_spec(messages: &[Message], vision: bool) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();

        for (position, message) in messages.iter().enumerate() {
            match message.role {
                Role::System => continue,
                Role::User => {
                    let mut parts = Vec::new();
                    for content in &message.content {
                        match content {
                            MessageContent::Text(text) => {
                                parts.push(json!({"text": text.text}));
                            }
                            MessageContent::Image(image) if vision => {
                                parts.push(json!({"inlineData": {
                                    "mimeType": image.mime_type,
                                    "data": image.data,
                                }}));
                            }
                            MessageContent::Image(_) => {
                                tracing::debug!("dropping image part for non-vision model");
                            }
                            MessageContent::Document(doc) => {
                                parts.push(json!({"inlineData": {
                                    "mimeType": doc.mime_type,
                                    "data": doc.data,
                                }}));
                            }
                            _ => {}
                        }
                    }
                    contents.push(json!({"role": "user", "parts": parts}));
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    for content in &message.content {
                        match content {
                            MessageContent::Text(text) => {
                                if !text.text.is_empty() {
                                    parts.push(json!({"text": text.text}));
                                }
                            }
                            MessageContent::ToolRequest(request) => {
                                if let Ok(call) = &request.tool_call {
                                    parts.push(json!({"functionCall": {
                                        "name": call.name,
                                        "args": call.arguments,
                                    }}));
                                }
                            }
                            MessageContent::Thinking(_) => {
                                tracing::debug!("dropping thinking part for gemini payload");
                            }
                            _ => {}
                        }
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                }
                Role::Tool => {
                    let mut parts = Vec::new();
                    for response in message.tool_responses() {
                        let (text, is_error) = flatten_tool_result(response);
                        let name = Self::tool_name_for_id(&messages[..position], &response.id)
                            .unwrap_or_else(|| response.id.clone());
                        let payload = if is_error {
                            json!({"error": text})
                        } else {
                            json!({"content": text})
                        };
                        parts.push(json!({"functionResponse": {
                            "name": name,
                            "response": payload,
                        }}));
                    }
                    contents.push(json!({"role": "user", "parts": parts}));
                }
            }
        }

        contents
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let vision = self.model.supports(Capability::Vision);
        let mut payload = json!({
            "contents": Self::messages_to_gemini_spec(messages, vision),
        });
        if !self.system_prompt.is_empty() {
            payload["systemInstruction"] = json!({"parts": [{"text": self.system_prompt}]});
        }
        if !self.tools.is_empty() {
            let declarations: Vec<Value> = self
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    })
                })
                .collect();
            payload["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        let mut generation_config = json!({});
        if let Some(temperature) = self.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(budget) = self.thinking_budget {
            generation_config["thinkingConfig"] = json!({"thinkingBudget": budget});
        }
        if generation_config.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            payload["generationConfig"] = generation_config;
        }
        payload
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.host.trim_end_matches('/'),
            self.model.id,
            self.api_key,
        );
        let model = self.model.clone();

        Box::pin(try_stream! {
            let response = client.post(&url).json(&payload).send().await?;

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
            let mut saw_tool_call = false;
            let mut finish: Option<StopReason> = None;
            let mut usage: Option<Usage> = None;

            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for sse in parser.push(&chunk) {
                    let data: Value = match serde_json::from_str(&sse.data) {
                        Ok(value) => value,
                        Err(_) => continue,
                    };

                    if let Some(meta) = data.get("usageMetadata") {
                        let input = meta["promptTokenCount"].as_i64();
                        let output = meta["candidatesTokenCount"].as_i64();
                        let cost = match (input, output) {
                            (Some(i), Some(o)) => Some(model.cost(i, o)),
                            _ => None,
                        };
                        usage = Some(Usage::new(input, output, cost));
                    }

                    let Some(candidate) = data["candidates"].get(0) else {
                        continue;
                    };
                    if let Some(parts) = candidate["content"]["parts"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                yield StreamEvent::TextDelta { text: text.to_string() };
                            }
                            if let Some(call) = part.get("functionCall") {
                                // Arguments arrive complete, and the API
                                // assigns no id; synthesize one.
                                saw_tool_call = true;
                                let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                                let name = call["name"].as_str().unwrap_or_default().to_string();
                                yield StreamEvent::ToolCallStart {
                                    id: id.clone(),
                                    name: name.clone(),
                                };
                                yield StreamEvent::ToolCallEnd {
                                    id,
                                    name,
                                    arguments: Ok(call["args"].clone()),
                                };
                            }
                        }
                    }
                    if let Some(reason) = candidate["finishReason"].as_str() {
                        finish = Some(match reason {
                            "MAX_TOKENS" => StopReason::MaxTokens,
                            _ if saw_tool_call => StopReason::ToolUse,
                            _ => StopReason::EndTurn,
                        });
                    }
                }
            }

            if let Some(usage) = usage {
                yield StreamEvent::UsageUpdate { usage };
            }
            yield StreamEvent::Stop {
                reason: finish.unwrap_or(StopReason::EndTurn),
            };
        })
    }
}
