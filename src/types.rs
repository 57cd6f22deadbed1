//! Type definitions for the Gemini control
//!
//! Covers the configuration value types (generation config, safety
//! settings, chat history), the events pushed by the backend and the
//! messages exchanged with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// =============================================================================
// Method and Request Types
// =============================================================================

/// Parameters of one method call. Values are always strings; structured
/// arguments are JSON-encoded before they land here.
pub type Params = BTreeMap<String, String>;

/// Methods the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Init,
    Prompt,
    Chat,
    StreamChat,
    CountTokens,
    Info,
    ListModels,
    EmbedContent,
    BatchEmbedContents,
    CancelRequest,
    TextAndImage,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Init => "init",
            Method::Prompt => "prompt",
            Method::Chat => "chat",
            Method::StreamChat => "stream_chat",
            Method::CountTokens => "count_tokens",
            Method::Info => "info",
            Method::ListModels => "list_models",
            Method::EmbedContent => "embed_content",
            Method::BatchEmbedContents => "batch_embed_contents",
            Method::CancelRequest => "cancel_request",
            Method::TextAndImage => "text_and_image",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let method = match name {
            "init" => Method::Init,
            "prompt" => Method::Prompt,
            "chat" => Method::Chat,
            "stream_chat" => Method::StreamChat,
            "count_tokens" => Method::CountTokens,
            "info" => Method::Info,
            "list_models" => Method::ListModels,
            "embed_content" => Method::EmbedContent,
            "batch_embed_contents" => Method::BatchEmbedContents,
            "cancel_request" => Method::CancelRequest,
            "text_and_image" => Method::TextAndImage,
            _ => return None,
        };
        Some(method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Resolved,
    Failed,
    Cancelled,
}

/// Which pending requests a successful `cancel_request` fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    #[default]
    AllPending,
    MostRecent,
}

/// Diagnostic view of one in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInfo {
    pub id: Uuid,
    pub method: String,
    pub state: RequestState,
    pub issued_at: DateTime<Utc>,
}

// =============================================================================
// Event Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OnResponse,
    OnChatResponse,
    OnChunk,
    OnError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OnResponse => "on_response",
            EventKind::OnChatResponse => "on_chat_response",
            EventKind::OnChunk => "on_chunk",
            EventKind::OnError => "on_error",
        }
    }
}

/// A notification pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub kind: EventKind,
    pub data: String,
}

impl ControlEvent {
    pub fn new(kind: EventKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// True for the chunk that terminates a streaming chat.
    pub fn is_stream_done(&self) -> bool {
        self.kind == EventKind::OnChunk && self.data == STREAM_DONE_MARKER
    }
}

// =============================================================================
// Wire Messages
// =============================================================================

/// Messages sent from the control to its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Sync {
        attributes: BTreeMap<String, Option<String>>,
    },
    Invoke {
        id: Uuid,
        method: String,
        params: Params,
    },
}

/// Messages sent from the backend to the control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
    Result { id: Uuid, value: String },
    Failure { id: Uuid, message: String },
    Event { name: EventKind, data: String },
}

impl BackendMessage {
    pub fn event(kind: EventKind, data: impl Into<String>) -> Self {
        Self::Event {
            name: kind,
            data: data.into(),
        }
    }
}

// =============================================================================
// Safety Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    Harassment,
    HateSpeech,
    SexuallyExplicit,
    DangerousContent,
}

impl SafetyCategory {
    /// Name used by the Generative Language API.
    pub fn api_name(&self) -> &'static str {
        match self {
            SafetyCategory::Harassment => "HARM_CATEGORY_HARASSMENT",
            SafetyCategory::HateSpeech => "HARM_CATEGORY_HATE_SPEECH",
            SafetyCategory::SexuallyExplicit => "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            SafetyCategory::DangerousContent => "HARM_CATEGORY_DANGEROUS_CONTENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl SafetyThreshold {
    pub fn api_name(&self) -> &'static str {
        match self {
            SafetyThreshold::BlockNone => "BLOCK_NONE",
            SafetyThreshold::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            SafetyThreshold::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            SafetyThreshold::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: SafetyCategory,
    pub threshold: SafetyThreshold,
}

impl SafetySetting {
    pub fn new(category: SafetyCategory, threshold: SafetyThreshold) -> Self {
        Self {
            category,
            threshold,
        }
    }
}

// =============================================================================
// Generation Config Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

// =============================================================================
// Chat Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub parts: Vec<ChatPart>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(ChatRole::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::text(ChatRole::Model, text)
    }

    fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ChatPart { text: text.into() }],
        }
    }
}

// =============================================================================
// Control Options Types
// =============================================================================

/// Construction-time options for a [`crate::GeminiControl`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlOptions {
    pub api_key: Option<String>,
    pub prompt: Option<String>,
    pub value: Option<String>,
    pub model: Option<String>,
    pub show_response: Option<bool>,
    pub generation_config: Option<GenerationConfig>,
    pub safety_settings: Option<Vec<SafetySetting>>,
    pub system_prompt: Option<String>,
    /// Seconds before an unanswered request fails. `None` waits forever.
    pub invoke_timeout: Option<f64>,
    pub cancel_scope: Option<CancelScope>,
}

// =============================================================================
// Constants
// =============================================================================

pub const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Payload of the last `on_chunk` event of a streaming chat.
pub const STREAM_DONE_MARKER: &str = "[DONE]";

pub const STATUS_INITIALIZED: &str = "Gemini initialized successfully";
pub const STATUS_STREAM_STARTED: &str = "Streaming started";
pub const STATUS_CANCELLED: &str = "Request cancelled";
