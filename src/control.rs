//! GeminiControl - typed request facade over the invocation bridge.

use crate::backend::GeminiBackend;
use crate::bridge::InvocationBridge;
use crate::config::{AttrValue, ControlState};
use crate::errors::{GeminiControlError, Result};
use crate::events::{EventRegistry, HandlerResult};
use crate::transport::{ChannelTransport, Transport};
use crate::types::{
    BackendMessage, CancelScope, ChatMessage, ControlEvent, ControlMessage, ControlOptions,
    EventKind, Method, Params, PendingInfo,
};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct GeminiControl {
    state: Arc<Mutex<ControlState>>,
    events: Arc<EventRegistry>,
    bridge: Arc<InvocationBridge>,
    cancel_scope: CancelScope,
}

impl GeminiControl {
    pub fn new(options: ControlOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        let timeout = match options.invoke_timeout {
            Some(secs) => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) if !timeout.is_zero() => Some(timeout),
                _ => {
                    return Err(GeminiControlError::configuration(format!(
                        "invoke_timeout must be a positive number of seconds, got {}",
                        secs
                    )))
                }
            },
            None => None,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(ControlState::from_options(&options)?)),
            events: Arc::new(EventRegistry::new()),
            bridge: Arc::new(InvocationBridge::new(transport, timeout)),
            cancel_scope: options.cancel_scope.unwrap_or_default(),
        })
    }

    /// Wires a control to a [`GeminiBackend`] running on this runtime.
    pub async fn connect(options: ControlOptions, backend: GeminiBackend) -> Result<Arc<Self>> {
        let (transport, link, replies) = ChannelTransport::pair();
        let control = Arc::new(Self::new(options, Arc::new(transport))?);
        tokio::spawn(backend.serve(link));
        control.attach(replies);
        Ok(control)
    }

    /// Feeds inbound backend messages into [`Self::handle_message`] until the
    /// sender closes or the control is dropped.
    pub fn attach(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<BackendMessage>,
    ) -> JoinHandle<()> {
        let control: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(control) = control.upgrade() else {
                    break;
                };
                control.handle_message(message).await;
            }
            log::debug!("Backend message pump stopped");
        })
    }

    /// Single entry point for replies and pushed events.
    pub async fn handle_message(&self, message: BackendMessage) {
        match message {
            BackendMessage::Result { id, value } => {
                self.bridge.resolve(id, value).await;
            }
            BackendMessage::Failure { id, message } => {
                self.bridge.fail(id, message).await;
            }
            BackendMessage::Event { name, data } => {
                if matches!(name, EventKind::OnResponse | EventKind::OnChatResponse) {
                    self.state.lock().await.record_response(data.clone());
                }
                self.events.dispatch(ControlEvent::new(name, data));
            }
        }
    }

    // ---------------------------------------------------------------------
    // State
    // ---------------------------------------------------------------------

    /// Snapshot of the current configuration.
    pub async fn state(&self) -> ControlState {
        self.state.lock().await.clone()
    }

    /// Mutates the configuration. Nothing is sent until the next request or
    /// [`Self::update`].
    pub async fn update_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ControlState) -> R,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    pub async fn get_attr(&self, name: &str) -> Result<Option<AttrValue>> {
        self.state.lock().await.get_attr(name)
    }

    pub async fn set_attr(&self, name: &str, value: Option<AttrValue>) -> Result<()> {
        self.state.lock().await.set_attr(name, value)
    }

    pub async fn response(&self) -> Option<String> {
        self.state.lock().await.response().map(String::from)
    }

    /// Sends attributes changed since the last sync.
    pub async fn update(&self) -> Result<()> {
        // held across the send so a concurrent call cannot overtake the sync
        let mut state = self.state.lock().await;
        let attributes = state.take_dirty();
        if attributes.is_empty() {
            return Ok(());
        }
        log::debug!("Syncing {} attribute(s)", attributes.len());
        let names: Vec<String> = attributes.keys().cloned().collect();
        if let Err(e) = self
            .bridge
            .transport()
            .send(ControlMessage::Sync { attributes })
            .await
        {
            state.mark_unsynced(names.iter().map(String::as_str));
            return Err(e);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.events.set_handler(kind, handler);
    }

    pub fn on_response<F>(&self, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::OnResponse, handler);
    }

    pub fn on_chat_response<F>(&self, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::OnChatResponse, handler);
    }

    /// Streaming chunks; the last one satisfies [`ControlEvent::is_stream_done`].
    pub fn on_chunk<F>(&self, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::OnChunk, handler);
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::OnError, handler);
    }

    // ---------------------------------------------------------------------
    // Invocation
    // ---------------------------------------------------------------------

    /// Generic method call. Unsynced attributes are flushed first.
    pub async fn invoke(
        &self,
        method: &str,
        params: Params,
        wait_for_result: bool,
    ) -> Result<Option<String>> {
        self.update().await?;
        self.bridge.invoke(method, params, wait_for_result).await
    }

    pub async fn pending_requests(&self) -> Vec<PendingInfo> {
        self.bridge.pending().await
    }

    async fn call(&self, method: Method, params: Params) -> Result<String> {
        self.invoke(method.as_str(), params, true)
            .await?
            .ok_or_else(|| GeminiControlError::malformed(method.as_str(), "no result returned"))
    }

    pub async fn init(&self, api_key: &str) -> Result<String> {
        self.call(Method::Init, params([("api_key", api_key.to_string())]))
            .await
    }

    /// Single prompt. The backend also pushes `on_response`.
    pub async fn prompt(&self, text: &str, model: Option<&str>) -> Result<String> {
        let params = with_model(params([("text", text.to_string())]), model);
        self.call(Method::Prompt, params).await
    }

    /// Chat turn over the whole history. The backend also pushes
    /// `on_chat_response`.
    pub async fn chat(&self, chats: &[ChatMessage], model: Option<&str>) -> Result<String> {
        let params = with_model(params([("chats", serde_json::to_string(chats)?)]), model);
        self.call(Method::Chat, params).await
    }

    /// Starts a streaming chat and returns the backend's status string.
    /// Text arrives through `on_chunk`.
    pub async fn stream_chat(&self, chats: &[ChatMessage], model: Option<&str>) -> Result<String> {
        let params = with_model(params([("chats", serde_json::to_string(chats)?)]), model);
        self.call(Method::StreamChat, params).await
    }

    pub async fn count_tokens(&self, text: &str, model: Option<&str>) -> Result<String> {
        let params = with_model(params([("text", text.to_string())]), model);
        self.call(Method::CountTokens, params).await
    }

    /// Model metadata as JSON text.
    pub async fn info(&self, model: &str) -> Result<String> {
        self.call(Method::Info, params([("model", model.to_string())]))
            .await
    }

    /// JSON array of model descriptors.
    pub async fn list_models(&self) -> Result<String> {
        self.call(Method::ListModels, Params::new()).await
    }

    /// Embedding vector for `text`.
    ///
    /// Unlike every other operation this one decodes the backend payload and
    /// returns the `embedding` field rather than raw JSON text.
    pub async fn embed_content(&self, text: &str, model: Option<&str>) -> Result<Vec<f64>> {
        let method = Method::EmbedContent.as_str();
        let params = with_model(params([("text", text.to_string())]), model);
        let raw = self.call(Method::EmbedContent, params).await?;

        let data: Value = serde_json::from_str(&raw)
            .map_err(|e| GeminiControlError::malformed(method, format!("invalid JSON: {}", e)))?;
        let embedding = data
            .get("embedding")
            .cloned()
            .ok_or_else(|| GeminiControlError::malformed(method, "missing `embedding` field"))?;
        serde_json::from_value(embedding).map_err(|e| {
            GeminiControlError::malformed(method, format!("`embedding` is not a vector: {}", e))
        })
    }

    /// JSON text with an `embeddings` array, one vector per input, in order.
    pub async fn batch_embed_contents<S: AsRef<str>>(
        &self,
        texts: &[S],
        model: Option<&str>,
    ) -> Result<String> {
        let texts: Vec<&str> = texts.iter().map(AsRef::as_ref).collect();
        let params = with_model(params([("texts", serde_json::to_string(&texts)?)]), model);
        self.call(Method::BatchEmbedContents, params).await
    }

    /// Asks the backend to stop its in-flight generation. On success the
    /// requests pending before this call are failed with `Cancelled`
    /// according to [`ControlOptions::cancel_scope`].
    ///
    /// The ids of those requests travel with the call so the backend stops
    /// exactly their work; running streams are always stopped.
    pub async fn cancel_request(&self) -> Result<String> {
        let mark = self.bridge.watermark();
        let targets = self.bridge.cancel_targets(self.cancel_scope, Some(mark)).await;
        let status = self
            .call(
                Method::CancelRequest,
                params([("ids", serde_json::to_string(&targets)?)]),
            )
            .await?;

        let mut cancelled = 0;
        for id in targets {
            if self.bridge.cancel(id).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::debug!("Cancelled {} pending request(s)", cancelled);
        }
        Ok(status)
    }

    /// Multimodal prompt. Each image travels as a JSON array of its bytes.
    pub async fn text_and_image<B: AsRef<[u8]>>(
        &self,
        text: &str,
        images: &[B],
        model: Option<&str>,
    ) -> Result<String> {
        let images: Vec<&[u8]> = images.iter().map(AsRef::as_ref).collect();
        let params = with_model(
            params([
                ("text", text.to_string()),
                ("images", serde_json::to_string(&images)?),
            ]),
            model,
        );
        self.call(Method::TextAndImage, params).await
    }
}

impl std::fmt::Debug for GeminiControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiControl")
            .field("events", &self.events)
            .field("cancel_scope", &self.cancel_scope)
            .finish_non_exhaustive()
    }
}

fn params<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn with_model(mut params: Params, model: Option<&str>) -> Params {
    if let Some(model) = model.filter(|m| !m.is_empty()) {
        params.insert("model".to_string(), model.to_string());
    }
    params
}
