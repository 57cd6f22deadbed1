//! Backend serving control method calls against the Generative Language API.

use crate::config::{
    ATTR_API_KEY, ATTR_GENERATION_CONFIG, ATTR_MODEL, ATTR_SAFETY_SETTINGS, ATTR_SYSTEM_PROMPT,
};
use crate::errors::{GeminiControlError, Result};
use crate::transport::BackendLink;
use crate::types::{
    BackendMessage, ChatMessage, ControlMessage, EventKind, Method, Params, SafetyCategory,
    SafetyThreshold, DEFAULT_EMBEDDING_MODEL, DEFAULT_MODEL, GEMINI_API_BASE_URL,
    GEMINI_API_KEY_ENV, STATUS_CANCELLED, STATUS_INITIALIZED, STATUS_STREAM_STARTED,
    STREAM_DONE_MARKER,
};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub base_url: Option<String>,
    /// Used when no key has been synced or set by `init`. Falls back to
    /// `GEMINI_API_KEY`; an empty string disables both.
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    pub timeout: Option<Duration>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            default_model: None,
            timeout: Some(Duration::from_secs(720)),
        }
    }
}

/// Attribute values synced from the control.
#[derive(Debug, Clone, Default)]
struct Settings {
    api_key: Option<String>,
    model: Option<String>,
    generation_config: Option<Value>,
    safety_settings: Option<Vec<Value>>,
    system_prompt: Option<String>,
}

pub struct GeminiBackend {
    base_url: Url,
    default_model: String,
    http_client: Client,
    fallback_key: Option<String>,
    settings: Mutex<Settings>,
    // keyed by the id of the invocation that started them
    inflight: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    streams: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl GeminiBackend {
    pub fn new(options: BackendOptions) -> Result<Self> {
        let mut base = options
            .base_url
            .unwrap_or_else(|| GEMINI_API_BASE_URL.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            GeminiControlError::configuration(format!("Invalid base URL {}: {}", base, e))
        })?;

        let mut builder = Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let fallback_key = options
            .api_key
            .or_else(|| std::env::var(GEMINI_API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            base_url,
            default_model: options
                .default_model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http_client: builder.build()?,
            fallback_key,
            settings: Mutex::new(Settings::default()),
            inflight: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(BackendOptions::default())
    }

    /// Processes control messages until the control side closes.
    ///
    /// Attribute syncs apply in order; each invocation runs on its own task
    /// and answers with a reply carrying the same id.
    pub async fn serve(self, mut link: BackendLink) {
        let backend = Arc::new(self);
        while let Some(message) = link.calls.recv().await {
            match message {
                ControlMessage::Sync { attributes } => backend.apply_sync(attributes).await,
                ControlMessage::Invoke { id, method, params } => {
                    // the task deregisters itself, so it must be registered first
                    let mut inflight = backend.inflight.lock().await;
                    let task = tokio::spawn(backend.clone().run_invoke(
                        id,
                        method,
                        params,
                        link.replies.clone(),
                    ));
                    inflight.insert(id, task);
                }
            }
        }
        log::debug!("Control closed, backend stopping");
    }

    async fn run_invoke(
        self: Arc<Self>,
        id: Uuid,
        method: String,
        params: Params,
        replies: mpsc::UnboundedSender<BackendMessage>,
    ) {
        let result = match Method::from_name(&method) {
            Some(m) => self.execute(id, m, &params, &replies).await,
            None => Err(GeminiControlError::validation(
                format!("Unknown method: {}", method),
                None,
            )),
        };
        let reply = match result {
            Ok(value) => BackendMessage::Result { id, value },
            Err(e) => {
                let message = failure_message(&e);
                log::warn!("{} failed: {}", method, message);
                push(&replies, EventKind::OnError, message.clone());
                BackendMessage::Failure { id, message }
            }
        };
        let _ = replies.send(reply);
        self.inflight.lock().await.remove(&id);
    }

    async fn apply_sync(&self, attributes: BTreeMap<String, Option<String>>) {
        let mut settings = self.settings.lock().await;
        for (name, value) in attributes {
            match name.as_str() {
                ATTR_API_KEY => settings.api_key = value.filter(|k| !k.trim().is_empty()),
                ATTR_MODEL => settings.model = value,
                ATTR_SYSTEM_PROMPT => settings.system_prompt = value,
                ATTR_GENERATION_CONFIG => {
                    settings.generation_config = value.and_then(|text| {
                        serde_json::from_str(&text)
                            .map_err(|e| log::warn!("Ignoring invalid generation_config: {}", e))
                            .ok()
                    })
                }
                ATTR_SAFETY_SETTINGS => {
                    settings.safety_settings = value.and_then(|text| {
                        serde_json::from_str::<Vec<Value>>(&text)
                            .map(|list| list.iter().map(api_safety_setting).collect())
                            .map_err(|e| log::warn!("Ignoring invalid safety_settings: {}", e))
                            .ok()
                    })
                }
                _ => {}
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        id: Uuid,
        method: Method,
        params: &Params,
        replies: &mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<String> {
        match method {
            Method::Init => {
                let key = required(params, "api_key")?;
                if key.trim().is_empty() {
                    return Err(GeminiControlError::validation(
                        "API key must not be empty",
                        Some("api_key"),
                    ));
                }
                self.settings.lock().await.api_key = Some(key.to_string());
                Ok(STATUS_INITIALIZED.to_string())
            }
            Method::Prompt => {
                let contents = vec![user_content(vec![json!({"text": required(params, "text")?})])];
                let text = self.generate(method, params, contents).await?;
                push(replies, EventKind::OnResponse, text.clone());
                Ok(text)
            }
            Method::TextAndImage => {
                let mut parts = vec![json!({"text": required(params, "text")?})];
                let images: Vec<Vec<u8>> = parse_param(params, "images")?;
                for image in &images {
                    parts.push(json!({
                        "inlineData": {
                            "mimeType": sniff_image_mime(image),
                            "data": base64_encode(image)
                        }
                    }));
                }
                let text = self.generate(method, params, vec![user_content(parts)]).await?;
                push(replies, EventKind::OnResponse, text.clone());
                Ok(text)
            }
            Method::Chat => {
                let chats: Vec<ChatMessage> = parse_param(params, "chats")?;
                let contents = chats
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let text = self.generate(method, params, contents).await?;
                push(replies, EventKind::OnChatResponse, text.clone());
                Ok(text)
            }
            Method::StreamChat => {
                let chats: Vec<ChatMessage> = parse_param(params, "chats")?;
                let model = self.model_for(params).await;
                let body = self.request_body(serde_json::to_value(chats)?).await;
                let api_key = self.api_key().await?;
                let url = self.endpoint(&format!(
                    "models/{}:streamGenerateContent?alt=sse",
                    model
                ))?;

                let backend = self.clone();
                let replies = replies.clone();
                let mut streams = self.streams.lock().await;
                let task = tokio::spawn(async move {
                    let outcome = backend.stream(url, &api_key, body, &replies).await;
                    // gone from the map means cancel_request already ended it
                    if backend.streams.lock().await.remove(&id).is_none() {
                        return;
                    }
                    match outcome {
                        Ok(()) => push(&replies, EventKind::OnChunk, STREAM_DONE_MARKER),
                        Err(e) => push(&replies, EventKind::OnError, failure_message(&e)),
                    }
                });
                streams.insert(id, task);
                Ok(STATUS_STREAM_STARTED.to_string())
            }
            Method::CountTokens => {
                let model = self.model_for(params).await;
                let body = json!({
                    "contents": [user_content(vec![json!({"text": required(params, "text")?})])]
                });
                let data = self
                    .post_json(&format!("models/{}:countTokens", model), &body)
                    .await?;
                data.get("totalTokens")
                    .and_then(|v| v.as_u64())
                    .map(|n| n.to_string())
                    .ok_or_else(|| {
                        GeminiControlError::malformed(method.as_str(), "missing totalTokens")
                    })
            }
            Method::Info => {
                let model = model_path(required(params, "model")?);
                Ok(self.get_json(&format!("models/{}", model)).await?.to_string())
            }
            Method::ListModels => {
                let data = self.get_json("models").await?;
                let models = data.get("models").cloned().unwrap_or_else(|| json!([]));
                Ok(models.to_string())
            }
            Method::EmbedContent => {
                let model = embedding_model(params);
                let body = json!({
                    "model": format!("models/{}", model),
                    "content": {"parts": [{"text": required(params, "text")?}]}
                });
                let data = self
                    .post_json(&format!("models/{}:embedContent", model), &body)
                    .await?;
                let values = data
                    .pointer("/embedding/values")
                    .cloned()
                    .ok_or_else(|| {
                        GeminiControlError::malformed(method.as_str(), "missing embedding values")
                    })?;
                Ok(json!({ "embedding": values }).to_string())
            }
            Method::BatchEmbedContents => {
                let model = embedding_model(params);
                let texts: Vec<String> = parse_param(params, "texts")?;
                let requests: Vec<Value> = texts
                    .iter()
                    .map(|text| {
                        json!({
                            "model": format!("models/{}", model),
                            "content": {"parts": [{"text": text}]}
                        })
                    })
                    .collect();
                let data = self
                    .post_json(
                        &format!("models/{}:batchEmbedContents", model),
                        &json!({ "requests": requests }),
                    )
                    .await?;
                let embeddings = data
                    .get("embeddings")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        GeminiControlError::malformed(method.as_str(), "missing embeddings")
                    })?
                    .iter()
                    .map(|e| e.get("values").cloned().unwrap_or_else(|| json!([])))
                    .collect::<Vec<Value>>();
                Ok(json!({ "embeddings": embeddings }).to_string())
            }
            Method::CancelRequest => {
                let targets: Option<Vec<Uuid>> = match params.get("ids") {
                    Some(_) => Some(parse_param(params, "ids")?),
                    None => None,
                };
                let requests = self.abort_requests(id, targets.as_deref(), replies).await;
                let streams = self.abort_streams(replies).await;
                log::debug!("Aborted {} request(s), {} stream(s)", requests, streams);
                Ok(STATUS_CANCELLED.to_string())
            }
        }
    }

    /// Aborts the listed invocations, or every other one when `targets` is
    /// `None`. In that case each aborted call is answered with a failure,
    /// since its caller was never told to stop waiting.
    async fn abort_requests(
        &self,
        own: Uuid,
        targets: Option<&[Uuid]>,
        replies: &mpsc::UnboundedSender<BackendMessage>,
    ) -> usize {
        let mut inflight = self.inflight.lock().await;
        let ids: Vec<Uuid> = match targets {
            Some(ids) => ids.to_vec(),
            None => inflight.keys().copied().collect(),
        };

        let mut aborted = 0;
        for target in ids.into_iter().filter(|target| *target != own) {
            let Some(handle) = inflight.remove(&target) else {
                continue;
            };
            handle.abort();
            aborted += 1;
            if targets.is_none() {
                let _ = replies.send(BackendMessage::Failure {
                    id: target,
                    message: STATUS_CANCELLED.to_string(),
                });
            }
        }
        aborted
    }

    /// Aborts running streams; each one still ends with the done marker.
    async fn abort_streams(&self, replies: &mpsc::UnboundedSender<BackendMessage>) -> usize {
        let mut streams = self.streams.lock().await;
        let count = streams.len();
        for (_, handle) in streams.drain() {
            handle.abort();
            push(replies, EventKind::OnChunk, STREAM_DONE_MARKER);
        }
        count
    }

    async fn api_key(&self) -> Result<String> {
        let settings = self.settings.lock().await;
        settings
            .api_key
            .clone()
            .or_else(|| self.fallback_key.clone())
            .ok_or_else(|| {
                GeminiControlError::configuration("No API key set; call init or set api_key")
            })
    }

    /// Explicit `model` param, then the synced model, then the default.
    async fn model_for(&self, params: &Params) -> String {
        if let Some(model) = params.get("model") {
            return model_path(model).to_string();
        }
        let settings = self.settings.lock().await;
        let model = settings.model.as_deref().unwrap_or(&self.default_model);
        model_path(model).to_string()
    }

    async fn request_body(&self, contents: Value) -> Value {
        let settings = self.settings.lock().await;
        let mut body = json!({ "contents": contents });

        if let Some(config) = &settings.generation_config {
            body["generationConfig"] = config.clone();
        }
        if let Some(safety) = &settings.safety_settings {
            body["safetySettings"] = json!(safety);
        }
        if let Some(system) = &settings.system_prompt {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }

    async fn generate(
        &self,
        method: Method,
        params: &Params,
        contents: Vec<Value>,
    ) -> Result<String> {
        let model = self.model_for(params).await;
        let body = self.request_body(Value::Array(contents)).await;
        let data = self
            .post_json(&format!("models/{}:generateContent", model), &body)
            .await?;

        if let Some(reason) = data
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Err(GeminiControlError::api_error(
                format!("Prompt blocked: {}", reason),
                400,
            ));
        }
        candidate_text(&data)
            .ok_or_else(|| GeminiControlError::malformed(method.as_str(), "no candidates returned"))
    }

    async fn stream(
        &self,
        url: Url,
        api_key: &str,
        body: Value,
        replies: &mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<()> {
        let response = self
            .http_client
            .post(url)
            .header(API_KEY_HEADER, api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut bytes_stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(bytes) = bytes_stream.next().await {
            buffer.extend_from_slice(&bytes?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                emit_sse_line(&String::from_utf8_lossy(&line), replies)?;
            }
        }
        if !buffer.is_empty() {
            emit_sse_line(&String::from_utf8_lossy(&buffer), replies)?;
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            GeminiControlError::configuration(format!("Invalid endpoint {}: {}", path, e))
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let api_key = self.api_key().await?;
        let response = self
            .http_client
            .post(self.endpoint(path)?)
            .header(API_KEY_HEADER, api_key)
            .json(body)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let api_key = self.api_key().await?;
        let response = self
            .http_client
            .get(self.endpoint(path)?)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

fn push(
    replies: &mpsc::UnboundedSender<BackendMessage>,
    kind: EventKind,
    data: impl Into<String>,
) {
    let _ = replies.send(BackendMessage::event(kind, data));
}

fn emit_sse_line(line: &str, replies: &mpsc::UnboundedSender<BackendMessage>) -> Result<()> {
    let trimmed = line.trim();
    let Some(data) = trimmed.strip_prefix("data:") else {
        return Ok(());
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(());
    }

    let parsed: Value = serde_json::from_str(data)?;
    if let Some(message) = parsed.pointer("/error/message").and_then(|m| m.as_str()) {
        return Err(GeminiControlError::api_error(message, 500));
    }
    if let Some(text) = candidate_text(&parsed).filter(|t| !t.is_empty()) {
        push(replies, EventKind::OnChunk, text);
    }
    Ok(())
}

/// Concatenated text parts of the first candidate.
fn candidate_text(data: &Value) -> Option<String> {
    let candidate = data.get("candidates")?.as_array()?.first()?;
    let parts = candidate
        .pointer("/content/parts")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    for part in &parts {
        if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
    }
    Some(text)
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(handle_http_error(status.as_u16(), &body))
}

fn handle_http_error(status: u16, body: &str) -> GeminiControlError {
    let error_msg = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|data| {
            data.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string());

    GeminiControlError::api_error(error_msg, status)
}

/// Text reported to the control; API errors pass their message through.
fn failure_message(error: &GeminiControlError) -> String {
    match error {
        GeminiControlError::Api { message, .. } => message.clone(),
        GeminiControlError::Validation { message, .. } => message.clone(),
        GeminiControlError::Configuration { message } => message.clone(),
        other => other.to_string(),
    }
}

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str> {
    params.get(name).map(String::as_str).ok_or_else(|| {
        GeminiControlError::validation(format!("Missing parameter: {}", name), Some(name))
    })
}

fn parse_param<T: serde::de::DeserializeOwned>(params: &Params, name: &str) -> Result<T> {
    serde_json::from_str(required(params, name)?).map_err(|e| {
        GeminiControlError::validation(format!("Invalid {}: {}", name, e), Some(name))
    })
}

fn user_content(parts: Vec<Value>) -> Value {
    json!({"role": "user", "parts": parts})
}

fn model_path(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

fn embedding_model(params: &Params) -> String {
    params
        .get("model")
        .map(|m| model_path(m).to_string())
        .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string())
}

/// Maps the control's snake_case safety values to the API enum names.
/// Values already in API form pass through.
fn api_safety_setting(setting: &Value) -> Value {
    let category = setting.get("category").cloned().unwrap_or(Value::Null);
    let threshold = setting.get("threshold").cloned().unwrap_or(Value::Null);

    let category = serde_json::from_value::<SafetyCategory>(category.clone())
        .map(|c| json!(c.api_name()))
        .unwrap_or(category);
    let threshold = serde_json::from_value::<SafetyThreshold>(threshold.clone())
        .map(|t| json!(t.api_name()))
        .unwrap_or(threshold);

    json!({"category": category, "threshold": threshold})
}

fn sniff_image_mime(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(data)
}
