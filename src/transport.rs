//! Transport between a control and its backend.

use crate::errors::{GeminiControlError, Result};
use crate::types::{BackendMessage, ControlMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound half of the host framework's messaging.
///
/// Replies and pushed events come back through
/// [`crate::GeminiControl::handle_message`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: ControlMessage) -> Result<()>;
}

/// In-process transport over unbounded tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

/// Backend end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct BackendLink {
    pub calls: mpsc::UnboundedReceiver<ControlMessage>,
    pub replies: mpsc::UnboundedSender<BackendMessage>,
}

impl ChannelTransport {
    /// Returns the transport, the backend's link, and the receiver the
    /// control should be attached to.
    pub fn pair() -> (Self, BackendLink, mpsc::UnboundedReceiver<BackendMessage>) {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        (
            Self { tx: call_tx },
            BackendLink {
                calls: call_rx,
                replies: reply_tx,
            },
            reply_rx,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| GeminiControlError::transport("backend channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_send_reaches_backend() {
        let (transport, mut link, _replies) = ChannelTransport::pair();
        let message = ControlMessage::Sync {
            attributes: BTreeMap::new(),
        };
        transport.send(message.clone()).await.unwrap();
        assert_eq!(link.calls.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_send_after_backend_dropped() {
        let (transport, link, _replies) = ChannelTransport::pair();
        drop(link);
        let err = transport
            .send(ControlMessage::Sync {
                attributes: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GeminiControlError::Transport { .. }));
    }
}
