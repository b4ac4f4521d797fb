//! Helpers shared across provider adapters: SSE decoding, streaming tool-call
//! accumulation, and the OpenAI wire format used by every compatible backend.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::errors::ToolError;
use crate::models::message::{Message, MessageContent, ToolResponse};
use crate::models::role::Role;
use crate::providers::base::StreamEvent;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder. Feed raw body chunks in, take complete events
/// out; partial events are buffered until their terminating blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut messages = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..boundary + 2).collect();
            let mut event = None;
            let mut data_lines = Vec::new();
            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if !data_lines.is_empty() {
                messages.push(SseMessage {
                    event,
                    data: data_lines.join("\n"),
                });
            }
        }
        messages
    }
}

#[derive(Debug)]
struct PartialToolCall {
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments until each call is complete.
///
/// Duplicate ids merge their argument deltas into a single call, arrival
/// order is preserved, and a JSON parse failure fails only the affected call.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: HashMap<String, PartialToolCall>,
    order: Vec<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a call. Returns a `ToolCallStart` event for new
    /// ids; a repeated id merges silently.
    pub fn start(&mut self, id: &str, name: &str) -> Option<StreamEvent> {
        if let Some(existing) = self.calls.get_mut(id) {
            if existing.name.is_empty() {
                existing.name = name.to_string();
            }
            return None;
        }
        self.order.push(id.to_string());
        self.calls.insert(
            id.to_string(),
            PartialToolCall {
                name: name.to_string(),
                arguments: String::new(),
            },
        );
        Some(StreamEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn push_args(&mut self, id: &str, delta: &str) -> Option<StreamEvent> {
        let call = self.calls.get_mut(id)?;
        call.arguments.push_str(delta);
        Some(StreamEvent::ToolCallArgsDelta {
            id: id.to_string(),
            partial_json: delta.to_string(),
        })
    }

    /// Finalize one call, parsing its accumulated argument JSON.
    pub fn end(&mut self, id: &str) -> Option<StreamEvent> {
        let call = self.calls.remove(id)?;
        self.order.retain(|o| o != id);
        Some(finish_call(id, call))
    }

    /// Finalize every remaining call in arrival order. Calls that never got
    /// a name are ghost entries and are dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| {
                let call = self.calls.remove(&id)?;
                if call.name.trim().is_empty() {
                    return None;
                }
                Some(finish_call(&id, call))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn finish_call(id: &str, call: PartialToolCall) -> StreamEvent {
    let arguments = if call.arguments.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(&call.arguments)
            .map_err(|e| ToolError::InvalidParameters(format!("{}: {}", call.name, e)))
    };
    StreamEvent::ToolCallEnd {
        id: id.to_string(),
        name: call.name,
        arguments,
    }
}

/// Flatten a tool result into plain text: structured content is serialized,
/// errors render as their message.
pub fn flatten_tool_result(response: &ToolResponse) -> (String, bool) {
    match &response.tool_result {
        Ok(contents) => {
            let text = contents
                .iter()
                .map(|c| match c.as_text() {
                    Some(t) => t.to_string(),
                    None => "[image content]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            (text, false)
        }
        Err(e) => (e.to_string(), true),
    }
}

/// Convert canonical messages to the OpenAI Chat Completions shape.
///
/// The system prompt travels separately; System-role history entries are
/// skipped here. Media parts are dropped for non-vision models, documents are
/// flattened to a text note, and thinking parts never go back over the wire —
/// each lossy conversion is logged at debug level.
pub fn messages_to_openai_spec(messages: &[Message], vision: bool) -> Vec<Value> {
    let mut output = Vec::new();

    for message in messages {
        match message.role {
            Role::System => continue,
            Role::User => {
                let mut parts: Vec<Value> = Vec::new();
                for content in &message.content {
                    match content {
                        MessageContent::Text(text) => {
                            parts.push(json!({"type": "text", "text": text.text}));
                        }
                        MessageContent::Image(image) => {
                            if vision {
                                let url =
                                    format!("data:{};base64,{}", image.mime_type, image.data);
                                parts.push(
                                    json!({"type": "image_url", "image_url": {"url": url}}),
                                );
                            } else {
                                tracing::debug!("dropping image part for non-vision model");
                            }
                        }
                        MessageContent::Document(doc) => {
                            tracing::debug!(name = %doc.name, "flattening document part to text");
                            parts.push(json!({
                                "type": "text",
                                "text": format!("[attached document: {}]", doc.name)
                            }));
                        }
                        MessageContent::ToolResponse(resp) => {
                            // Canonical form is authoritative; a tool result
                            // inside a user message is flattened to text.
                            let (text, _) = flatten_tool_result(resp);
                            parts.push(json!({
                                "type": "text",
                                "text": format!("[tool result {}]: {}", resp.id, text)
                            }));
                        }
                        _ => {}
                    }
                }
                if parts.len() == 1 && parts[0]["type"] == "text" {
                    output.push(json!({"role": "user", "content": parts[0]["text"]}));
                } else {
                    output.push(json!({"role": "user", "content": parts}));
                }
            }
            Role::Assistant => {
                let text = message.text();
                let mut tool_calls: Vec<Value> = Vec::new();
                for request in message.tool_requests() {
                    if let Ok(call) = &request.tool_call {
                        tool_calls.push(json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        }));
                    }
                }
                if !message.thinking_parts().is_empty() {
                    tracing::debug!("dropping thinking parts for openai-format payload");
                }

                let mut entry = json!({"role": "assistant"});
                let object = entry.as_object_mut().unwrap();
                if tool_calls.is_empty() {
                    object.insert("content".to_string(), json!(text));
                } else {
                    // Some backends reject empty assistant text next to tool
                    // calls; a single space keeps them all happy.
                    let content = if text.is_empty() { " ".to_string() } else { text };
                    object.insert("content".to_string(), json!(content));
                    object.insert("tool_calls".to_string(), json!(tool_calls));
                }
                output.push(entry);
            }
            Role::Tool => {
                for response in message.tool_responses() {
                    let (text, _) = flatten_tool_result(response);
                    output.push(json!({
                        "role": "tool",
                        "tool_call_id": response.id,
                        "content": text,
                    }));
                }
            }
        }
    }

    output
}

pub fn tools_to_openai_spec(tools: &[crate::models::tool::Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content::Content;
    use crate::models::tool::ToolCall;

    #[test]
    fn test_sse_parser_split_events() {
        let mut parser = SseParser::new();
        let chunk = b"event: message_start\ndata: {\"a\":1}\n\nevent: ping\ndata: {}\n\n";
        let messages = parser.push(chunk);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].event.as_deref(), Some("message_start"));
        assert_eq!(messages[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_sse_parser_partial_event_buffers() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"par").is_empty());
        let messages = parser.push(b"tial\":true}\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "{\"partial\":true}");
    }

    #[test]
    fn test_accumulator_merges_duplicate_ids() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.start("t1", "web_search").is_some());
        assert!(acc.start("t1", "web_search").is_none());
        acc.push_args("t1", "{\"query\":");
        acc.push_args("t1", "\"rust\"}");
        let events = acc.finish();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCallEnd { id, name, arguments } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "web_search");
                assert_eq!(arguments.as_ref().unwrap()["query"], "rust");
            }
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_parse_failure_fails_single_call() {
        let mut acc = ToolCallAccumulator::new();
        acc.start("bad", "broken");
        acc.push_args("bad", "{not json");
        acc.start("good", "fine");
        acc.push_args("good", "{}");
        let events = acc.finish();
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::ToolCallEnd { arguments, .. } => assert!(arguments.is_err()),
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
        match &events[1] {
            StreamEvent::ToolCallEnd { arguments, .. } => assert!(arguments.is_ok()),
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_drops_ghost_calls() {
        let mut acc = ToolCallAccumulator::new();
        acc.start("ghost", "");
        acc.start("real", "search");
        let events = acc.finish();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_accumulator_empty_args_default_to_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.start("t1", "noop");
        let events = acc.finish();
        match &events[0] {
            StreamEvent::ToolCallEnd { arguments, .. } => {
                assert_eq!(arguments.as_ref().unwrap(), &json!({}));
            }
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_spec_simple_exchange() {
        let messages = vec![
            Message::user().with_text("hello"),
            Message::assistant().with_text("hi there"),
        ];
        let spec = messages_to_openai_spec(&messages, false);
        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0]["role"], "user");
        assert_eq!(spec[0]["content"], "hello");
        assert_eq!(spec[1]["content"], "hi there");
    }

    #[test]
    fn test_openai_spec_tool_roundtrip_shape() {
        let messages = vec![
            Message::user().with_text("search for rust"),
            Message::assistant().with_tool_request(
                "t1",
                Ok(ToolCall::new("web_search", json!({"query": "rust"}))),
            ),
            Message::tool("t1", Ok(vec![Content::text("found it")])),
        ];
        let spec = messages_to_openai_spec(&messages, false);
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[1]["tool_calls"][0]["id"], "t1");
        // Empty assistant text next to tool calls becomes a single space
        assert_eq!(spec[1]["content"], " ");
        assert_eq!(spec[2]["role"], "tool");
        assert_eq!(spec[2]["tool_call_id"], "t1");
        assert_eq!(spec[2]["content"], "found it");
    }

    #[test]
    fn test_openai_spec_drops_images_without_vision() {
        let messages = vec![Message::user()
            .with_text("describe this")
            .with_content(MessageContent::image("QUJD", "image/png"))];
        let spec = messages_to_openai_spec(&messages, false);
        assert_eq!(spec[0]["content"], "describe this");

        let spec = messages_to_openai_spec(&messages, true);
        let parts = spec[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["type"], "image_url");
    }

    #[test]
    fn test_tools_to_openai_spec() {
        let tools = vec![crate::models::tool::Tool::new(
            "web_search",
            "Search the web",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )];
        let spec = tools_to_openai_spec(&tools);
        assert_eq!(spec[0]["function"]["name"], "web_search");
    }
}
