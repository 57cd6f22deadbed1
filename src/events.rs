//! Event registry: one handler slot per event kind.

use crate::types::{ControlEvent, EventKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;
pub type EventHandler = Arc<dyn Fn(ControlEvent) -> HandlerResult + Send + Sync>;

/// Receives handler failures so they never reach the dispatcher.
pub type ErrorSink = Arc<dyn Fn(EventKind, String) + Send + Sync>;

enum Queued {
    Event(ControlEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Shared {
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
    error_sink: RwLock<Option<ErrorSink>>,
}

/// Maps each [`EventKind`] to at most one handler.
///
/// Dispatch only enqueues. A dispatcher task on the current tokio runtime
/// delivers events in arrival order to whichever handler is registered at
/// delivery time.
#[derive(Default)]
pub struct EventRegistry {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn set_handler<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ControlEvent) -> HandlerResult + Send + Sync + 'static,
    {
        write(&self.shared.handlers).insert(kind, Arc::new(handler));
    }

    pub fn clear_handler(&self, kind: EventKind) {
        write(&self.shared.handlers).remove(&kind);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        read(&self.shared.handlers).contains_key(&kind)
    }

    pub fn set_error_sink<F>(&self, sink: F)
    where
        F: Fn(EventKind, String) + Send + Sync + 'static,
    {
        *write(&self.shared.error_sink) = Some(Arc::new(sink));
    }

    /// Queues `event` for delivery and returns immediately.
    ///
    /// Outside a tokio runtime the event is delivered inline.
    pub fn dispatch(&self, event: ControlEvent) {
        let Some(tx) = self.sender() else {
            deliver(&self.shared, event);
            return;
        };
        if let Err(mpsc::error::SendError(Queued::Event(event))) = tx.send(Queued::Event(event)) {
            deliver(&self.shared, event);
        }
    }

    /// Waits until every event dispatched so far has been delivered.
    pub async fn flush(&self) {
        let Some(tx) = self.current_sender() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Queued::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn current_sender(&self) -> Option<mpsc::UnboundedSender<Queued>> {
        lock(&self.queue)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Queued>> {
        let mut queue = lock(&self.queue);
        if let Some(tx) = queue.as_ref().filter(|tx| !tx.is_closed()) {
            return Some(tx.clone());
        }

        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_dispatcher(self.shared.clone(), rx));
        *queue = Some(tx.clone());
        Some(tx)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&'static str> = read(&self.shared.handlers)
            .keys()
            .map(EventKind::as_str)
            .collect();
        kinds.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("handlers", &kinds)
            .finish()
    }
}

async fn run_dispatcher(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Queued>) {
    while let Some(item) = rx.recv().await {
        match item {
            Queued::Event(event) => deliver(&shared, event),
            Queued::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn deliver(shared: &Shared, event: ControlEvent) {
    let kind = event.kind;
    let handler = read(&shared.handlers).get(&kind).cloned();
    let Some(handler) = handler else {
        log::debug!("No handler for {}, event dropped", kind.as_str());
        return;
    };

    let message = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string()),
    };

    let sink = read(&shared.error_sink).clone();
    match sink {
        Some(sink) => sink(kind, message),
        None => log::error!("Handler for {} failed: {}", kind.as_str(), message),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
