use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::domain::{DocumentRecord, ReuseEvent};
use super::notifications::{DispatchError, NotificationDispatcher, NotificationRequest};

/// State changes published after they are committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum DocumentEvent {
    Uploaded(DocumentRecord),
    Approved(DocumentRecord),
    Rejected(DocumentRecord),
    Expired(DocumentRecord),
    Reused(ReuseEvent),
}

impl DocumentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentEvent::Uploaded(_) => "uploaded",
            DocumentEvent::Approved(_) => "approved",
            DocumentEvent::Rejected(_) => "rejected",
            DocumentEvent::Expired(_) => "expired",
            DocumentEvent::Reused(_) => "reused",
        }
    }
}

pub trait DocumentEventHandler: Send + Sync {
    fn handle(&self, event: &DocumentEvent) -> Result<(), EventError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("event handler failed: {0}")]
    Handler(String),
}

/// Explicit replacement for save-hook side effects: handlers are registered up front.
#[derive(Clone, Default)]
pub struct DocumentEventBus {
    handlers: Vec<Arc<dyn DocumentEventHandler>>,
}

impl DocumentEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, handler: Arc<dyn DocumentEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Delivers to every handler; failures are logged and never reach the publisher.
    pub fn publish(&self, event: DocumentEvent) -> usize {
        let mut failures = 0;
        for handler in &self.handlers {
            if let Err(err) = handler.handle(&event) {
                failures += 1;
                warn!(event = event.name(), error = %err, "document event handler failed");
            }
        }
        failures
    }
}

/// Sends review-cycle notifications: uploads to the company, verdicts to the freelancer.
pub struct TransitionNotifier<N> {
    dispatcher: Arc<N>,
}

impl<N> TransitionNotifier<N>
where
    N: NotificationDispatcher,
{
    pub fn new(dispatcher: Arc<N>) -> Self {
        Self { dispatcher }
    }
}

impl<N> DocumentEventHandler for TransitionNotifier<N>
where
    N: NotificationDispatcher,
{
    fn handle(&self, event: &DocumentEvent) -> Result<(), EventError> {
        let request = match event {
            DocumentEvent::Uploaded(record) => NotificationRequest::uploaded(record),
            DocumentEvent::Approved(record) => NotificationRequest::approved(record),
            DocumentEvent::Rejected(record) => NotificationRequest::rejected(record),
            // The sweeper notifies expirations itself, with dedupe.
            DocumentEvent::Expired(_) | DocumentEvent::Reused(_) => return Ok(()),
        };
        self.dispatcher.dispatch(request)?;
        Ok(())
    }
}
