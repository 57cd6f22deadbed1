//! Async invocation bridge.
//!
//! Every awaited call gets a correlation id and a slot in the pending table.
//! Replies resolve the slot with the same id, in whatever order they arrive.

use crate::errors::{GeminiControlError, Result};
use crate::transport::Transport;
use crate::types::{CancelScope, ControlMessage, Params, PendingInfo, RequestState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

enum Outcome {
    Resolved(String),
    Failed(String),
    Cancelled,
}

struct PendingRequest {
    method: String,
    state: RequestState,
    issued_at: DateTime<Utc>,
    seq: u64,
    reply: oneshot::Sender<Outcome>,
}

pub struct InvocationBridge {
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<HashMap<Uuid, PendingRequest>>>,
    timeout: Option<Duration>,
    next_seq: AtomicU64,
}

impl InvocationBridge {
    pub fn new(transport: Arc<dyn Transport>, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sends `method` to the backend.
    ///
    /// With `wait_for_result` the caller suspends until the correlated reply,
    /// a cancellation, or the configured timeout; otherwise the call returns
    /// `Ok(None)` as soon as the message is handed to the transport.
    pub async fn invoke(
        &self,
        method: &str,
        params: Params,
        wait_for_result: bool,
    ) -> Result<Option<String>> {
        let id = Uuid::new_v4();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        if !wait_for_result {
            self.transport
                .send(ControlMessage::Invoke {
                    id,
                    method: method.to_string(),
                    params,
                })
                .await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    state: RequestState::Pending,
                    issued_at: Utc::now(),
                    seq,
                    reply: tx,
                },
            );
        }

        let mut guard = PendingGuard {
            pending: self.pending.clone(),
            id,
            armed: true,
        };

        log::debug!("Invoking {} ({})", method, id);
        let message = ControlMessage::Invoke {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.transport.send(message).await {
            self.pending.lock().await.remove(&id);
            guard.armed = false;
            return Err(e);
        }

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    guard.armed = false;
                    log::warn!("{} ({}) timed out after {:?}", method, id, timeout);
                    return Err(GeminiControlError::Timeout {
                        method: method.to_string(),
                        timeout: timeout.as_secs_f64(),
                    });
                }
            },
            None => rx.await,
        };
        guard.armed = false;

        match outcome {
            Ok(Outcome::Resolved(value)) => Ok(Some(value)),
            Ok(Outcome::Failed(message)) => Err(GeminiControlError::invocation(method, message)),
            // a dropped sender means the bridge went away without an answer
            Ok(Outcome::Cancelled) | Err(_) => Err(GeminiControlError::cancelled(method)),
        }
    }

    /// Completes request `id` with a result. Returns false for unknown ids.
    pub async fn resolve(&self, id: Uuid, value: String) -> bool {
        self.complete(id, RequestState::Resolved, Outcome::Resolved(value))
            .await
    }

    /// Completes request `id` with a backend failure.
    pub async fn fail(&self, id: Uuid, message: String) -> bool {
        self.complete(id, RequestState::Failed, Outcome::Failed(message))
            .await
    }

    /// Cancels one request. No-op once it has been answered.
    pub async fn cancel(&self, id: Uuid) -> bool {
        self.complete(id, RequestState::Cancelled, Outcome::Cancelled)
            .await
    }

    /// Sequence number the next request will receive.
    pub fn watermark(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Pending requests a cancellation with `scope` applies to, oldest first.
    ///
    /// Only requests issued before `below` are considered when it is given.
    /// `MostRecent` picks the newest of those; `AllPending` takes them all.
    pub async fn cancel_targets(&self, scope: CancelScope, below: Option<u64>) -> Vec<Uuid> {
        let pending = self.pending.lock().await;
        let mut targets: Vec<(u64, Uuid)> = pending
            .iter()
            .filter(|(_, req)| below.map_or(true, |mark| req.seq < mark))
            .map(|(id, req)| (req.seq, *id))
            .collect();
        targets.sort_unstable();
        if scope == CancelScope::MostRecent {
            targets = targets.pop().into_iter().collect();
        }
        targets.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Snapshot of in-flight requests, oldest first.
    pub async fn pending(&self) -> Vec<PendingInfo> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<(u64, PendingInfo)> = pending
            .iter()
            .map(|(id, req)| {
                (
                    req.seq,
                    PendingInfo {
                        id: *id,
                        method: req.method.clone(),
                        state: req.state,
                        issued_at: req.issued_at,
                    },
                )
            })
            .collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    async fn complete(&self, id: Uuid, state: RequestState, outcome: Outcome) -> bool {
        let Some(mut req) = self.pending.lock().await.remove(&id) else {
            log::debug!("No pending request {}, reply ignored", id);
            return false;
        };
        req.state = state;
        log::debug!("{} ({}) -> {:?}", req.method, id, req.state);
        // the caller may have stopped waiting
        let _ = req.reply.send(outcome);
        true
    }
}

/// Drops the pending entry when the caller stops waiting early.
struct PendingGuard {
    pending: Arc<Mutex<HashMap<Uuid, PendingRequest>>>,
    id: Uuid,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.remove(&id);
            return;
        }
        let pending = self.pending.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BackendLink, ChannelTransport};
    use tokio_test::{assert_err, assert_ok};

    fn bridge(timeout: Option<Duration>) -> (Arc<InvocationBridge>, BackendLink) {
        let (transport, link, _replies) = ChannelTransport::pair();
        (
            Arc::new(InvocationBridge::new(Arc::new(transport), timeout)),
            link,
        )
    }

    async fn next_invoke(link: &mut BackendLink) -> (Uuid, String, Params) {
        match link.calls.recv().await {
            Some(ControlMessage::Invoke { id, method, params }) => (id, method, params),
            other => panic!("expected invoke, got {:?}", other),
        }
    }

    async fn cancel_scope(
        bridge: &InvocationBridge,
        scope: CancelScope,
        below: Option<u64>,
    ) -> usize {
        let targets = bridge.cancel_targets(scope, below).await;
        let mut cancelled = 0;
        for id in targets {
            if bridge.cancel(id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let (bridge, mut link) = bridge(None);
        let n = 8;

        let mut callers = Vec::new();
        for i in 0..n {
            let bridge = bridge.clone();
            callers.push(tokio::spawn(async move {
                let text = format!("q{}", i);
                let result = bridge
                    .invoke("prompt", params(&[("text", &text)]), true)
                    .await;
                (text, result)
            }));
        }

        let mut issued = Vec::new();
        for _ in 0..n {
            issued.push(next_invoke(&mut link).await);
        }
        assert_eq!(bridge.pending_count().await, n);

        for (id, _, params) in issued.into_iter().rev() {
            assert!(bridge.resolve(id, format!("answer to {}", params["text"])).await);
        }

        for caller in callers {
            let (text, result) = caller.await.unwrap();
            assert_eq!(result.unwrap(), Some(format!("answer to {}", text)));
        }
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_carries_backend_message() {
        let (bridge, mut link) = bridge(None);
        let caller = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("init", Params::new(), true).await })
        };

        let (id, method, _) = next_invoke(&mut link).await;
        assert_eq!(method, "init");
        bridge.fail(id, "invalid api key".to_string()).await;

        match caller.await.unwrap() {
            Err(GeminiControlError::Invocation { method, message }) => {
                assert_eq!(method, "init");
                assert_eq!(message, "invalid api key");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_and_after_resolution() {
        let (bridge, mut link) = bridge(None);
        let waiting = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("chat", Params::new(), true).await })
        };
        let answered = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("info", Params::new(), true).await })
        };

        let first = next_invoke(&mut link).await;
        let second = next_invoke(&mut link).await;
        let (answered_id, waiting_id) = if first.1 == "info" {
            (first.0, second.0)
        } else {
            (second.0, first.0)
        };

        assert!(bridge.resolve(answered_id, "{}".to_string()).await);
        assert!(!bridge.cancel(answered_id).await);
        assert_eq!(cancel_scope(&bridge, CancelScope::AllPending, None).await, 1);
        assert!(!bridge.resolve(waiting_id, "late".to_string()).await);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(answered.await.unwrap().unwrap(), Some("{}".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_most_recent_only() {
        let (bridge, mut link) = bridge(None);
        let older = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("chat", Params::new(), true).await })
        };
        let (older_id, _, _) = next_invoke(&mut link).await;
        let newer = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("prompt", Params::new(), true).await })
        };
        next_invoke(&mut link).await;

        assert_eq!(cancel_scope(&bridge, CancelScope::MostRecent, None).await, 1);
        assert!(newer.await.unwrap().unwrap_err().is_cancelled());

        bridge.resolve(older_id, "still here".to_string()).await;
        assert_eq!(older.await.unwrap().unwrap(), Some("still here".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_respects_watermark() {
        let (bridge, mut link) = bridge(None);
        let before = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("chat", Params::new(), true).await })
        };
        next_invoke(&mut link).await;
        let mark = bridge.watermark();
        let after = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke("chat", Params::new(), true).await })
        };
        let (after_id, _, _) = next_invoke(&mut link).await;

        assert_eq!(
            cancel_scope(&bridge, CancelScope::AllPending, Some(mark)).await,
            1
        );
        assert!(before.await.unwrap().unwrap_err().is_cancelled());
        bridge.resolve(after_id, "ok".to_string()).await;
        assert_ok!(after.await.unwrap());
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let (bridge, mut link) = bridge(None);
        let result = bridge.invoke("prompt", Params::new(), false).await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(bridge.pending_count().await, 0);

        let (id, method, _) = next_invoke(&mut link).await;
        assert_eq!(method, "prompt");
        assert!(!bridge.resolve(id, "ignored".to_string()).await);
    }

    #[tokio::test]
    async fn test_timeout_removes_request() {
        let (bridge, _link) = bridge(Some(Duration::from_millis(20)));
        let err = bridge.invoke("prompt", Params::new(), true).await.unwrap_err();
        assert!(matches!(err, GeminiControlError::Timeout { .. }));
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let (bridge, link) = bridge(None);
        drop(link);
        assert_err!(bridge.invoke("prompt", Params::new(), true).await);
        assert_eq!(bridge.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_pending_snapshot() {
        let (bridge, mut link) = bridge(None);
        for method in ["chat", "info"] {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.invoke(method, params(&[("model", "m")]), true).await });
            next_invoke(&mut link).await;
        }

        let snapshot = bridge.pending().await;
        let methods: Vec<&str> = snapshot.iter().map(|p| p.method.as_str()).collect();
        assert_eq!(methods, vec!["chat", "info"]);
        assert!(snapshot.iter().all(|p| p.state == RequestState::Pending));
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_entry() {
        let (bridge, mut link) = bridge(None);
        let call = bridge.invoke("prompt", Params::new(), true);
        let waited = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(waited.is_err());
        next_invoke(&mut link).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bridge.pending_count().await, 0);
        assert!(bridge.pending().await.is_empty());
    }
}
