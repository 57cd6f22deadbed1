//! gemini-control - Rust control for the Google Gemini API
//!
//! A [`GeminiControl`] holds the configuration of a Gemini integration and
//! forwards typed requests to a backend that talks to the API. It supports:
//! - Attribute sync (API key, model, generation config, safety settings)
//! - Concurrent request correlation with per-request replies
//! - Pushed events (`on_response`, `on_chat_response`, `on_chunk`, `on_error`)
//! - Streaming chat and cancellation
//! - Token counting, model info, and embeddings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gemini_control::{ChatMessage, ControlOptions, GeminiBackend, GeminiControl};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let control = GeminiControl::connect(
//!         ControlOptions {
//!             api_key: std::env::var("GEMINI_API_KEY").ok(),
//!             ..Default::default()
//!         },
//!         GeminiBackend::with_defaults()?,
//!     )
//!     .await?;
//!
//!     control.on_chunk(|event| {
//!         if !event.is_stream_done() {
//!             print!("{}", event.data);
//!         }
//!         Ok(())
//!     });
//!
//!     let answer = control.prompt("Hello, Gemini!", None).await?;
//!     println!("Response: {}", answer);
//!
//!     control
//!         .stream_chat(&[ChatMessage::user("Tell me a story")], None)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod control;
pub mod errors;
pub mod events;
pub mod transport;
pub mod types;

pub use backend::{BackendOptions, GeminiBackend};
pub use bridge::InvocationBridge;
pub use config::{AttrValue, ControlState, JsonAttr};
pub use control::GeminiControl;
pub use errors::{GeminiControlError, Result};
pub use events::{EventHandler, EventRegistry, HandlerResult};
pub use transport::{BackendLink, ChannelTransport, Transport};
pub use types::*;
