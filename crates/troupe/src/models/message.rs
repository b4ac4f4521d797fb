use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::content::{Content, DocumentContent, ImageContent, TextContent, ThinkingContent};
use super::role::Role;
use super::tool::ToolCall;
use crate::errors::ToolError;

/// A tool invocation emitted by the model. The call itself may have failed to
/// parse; the error is carried so the model sees a structured failure on the
/// next stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub tool_call: Result<ToolCall, ToolError>,
}

/// The result of a tool invocation, matched to its request by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub tool_result: Result<Vec<Content>, ToolError>,
}

impl ToolResponse {
    pub fn is_error(&self) -> bool {
        self.tool_result.is_err()
    }
}

/// Content passed inside a message: plain content, tool traffic, or thinking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Text(TextContent),
    Image(ImageContent),
    Document(DocumentContent),
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    Thinking(ThinkingContent),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>, T: Into<String>>(data: S, mime_type: T) -> Self {
        MessageContent::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
        })
    }

    pub fn document<S, T, N>(data: S, mime_type: T, name: N) -> Self
    where
        S: Into<String>,
        T: Into<String>,
        N: Into<String>,
    {
        MessageContent::Document(DocumentContent {
            data: data.into(),
            mime_type: mime_type.into(),
            name: name.into(),
        })
    }

    pub fn thinking<S: Into<String>>(thinking: S, signature: Option<String>) -> Self {
        MessageContent::Thinking(ThinkingContent {
            thinking: thinking.into(),
            signature,
        })
    }

    pub fn tool_request<S: Into<String>>(id: S, tool_call: Result<ToolCall, ToolError>) -> Self {
        MessageContent::ToolRequest(ToolRequest {
            id: id.into(),
            tool_call,
        })
    }

    pub fn tool_response<S: Into<String>>(
        id: S,
        tool_result: Result<Vec<Content>, ToolError>,
    ) -> Self {
        MessageContent::ToolResponse(ToolResponse {
            id: id.into(),
            tool_result,
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        match self {
            MessageContent::ToolRequest(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        match self {
            MessageContent::ToolResponse(resp) => Some(resp),
            _ => None,
        }
    }
}

/// A canonical message to or from an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
    /// Set on tool-role messages: the id of the request being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Message::new(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Message::new(Role::System)
    }

    /// Create a tool-role message answering the given request id.
    pub fn tool<S: Into<String>>(id: S, tool_result: Result<Vec<Content>, ToolError>) -> Self {
        let id = id.into();
        let mut message = Message::new(Role::Tool);
        message.tool_call_id = Some(id.clone());
        message.content.push(MessageContent::tool_response(id, tool_result));
        message
    }

    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    pub fn with_thinking<S: Into<String>>(self, thinking: S, signature: Option<String>) -> Self {
        self.with_content(MessageContent::thinking(thinking, signature))
    }

    pub fn with_tool_request<S: Into<String>>(
        self,
        id: S,
        tool_call: Result<ToolCall, ToolError>,
    ) -> Self {
        self.with_content(MessageContent::tool_request(id, tool_call))
    }

    /// Concatenated text of all Text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_request(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, MessageContent::ToolRequest(_)))
    }

    pub fn tool_requests(&self) -> Vec<&ToolRequest> {
        self.content
            .iter()
            .filter_map(MessageContent::as_tool_request)
            .collect()
    }

    pub fn tool_responses(&self) -> Vec<&ToolResponse> {
        self.content
            .iter()
            .filter_map(MessageContent::as_tool_response)
            .collect()
    }

    /// Thinking parts in emission order.
    pub fn thinking_parts(&self) -> Vec<&ThinkingContent> {
        self.content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Thinking(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builders() {
        let message = Message::user().with_text("ping");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.text(), "ping");
        assert!(!message.has_tool_request());
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let message = Message::tool("t1", Ok(vec![Content::text("done")]));
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("t1"));
        let responses = message.tool_responses();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].is_error());
    }

    #[test]
    fn test_tool_request_error_survives_roundtrip() {
        let message = Message::assistant().with_tool_request(
            "x1",
            Err(ToolError::InvalidParameters("bad json".to_string())),
        );
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
        assert!(back.tool_requests()[0].tool_call.is_err());
    }

    #[test]
    fn test_thinking_preserved_verbatim() {
        let message = Message::assistant()
            .with_thinking("step by step", Some("c2lnbmF0dXJl".to_string()))
            .with_text("answer")
            .with_tool_request("t1", Ok(ToolCall::new("web_search", json!({"query": "q"}))));
        let parts = message.thinking_parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].thinking, "step by step");
        assert_eq!(parts[0].signature.as_deref(), Some("c2lnbmF0dXJl"));
    }

    #[test]
    fn test_mixed_content_roundtrip() {
        let message = Message::user()
            .with_text("see attachment")
            .with_content(MessageContent::document("QUJD", "application/pdf", "spec.pdf"));
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
