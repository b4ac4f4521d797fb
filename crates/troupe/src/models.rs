//! The canonical data model passed around by the runtime.
//!
//! Several related formats meet here:
//! - anthropic messages/tools, sent to the Messages API
//! - openai-style messages/tools, sent to Chat Completions endpoints
//!   (OpenAI, Groq, DeepInfra, custom compatible providers)
//! - gemini contents/functionCalls, sent to generateContent
//! - the persisted conversation format on disk
//!
//! Vendor payloads are converted to and from these internal structs at the
//! adapter boundary; persistence and all cross-agent logic operate only on
//! the canonical form.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
