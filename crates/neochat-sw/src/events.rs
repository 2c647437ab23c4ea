//! Worker events and the extendable-event mechanism.

use std::future::Future;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::warn;

use crate::notification::Notification;
use crate::request::{Request, Response};
use crate::ServiceWorkerError;

/// Events delivered to a worker version.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    /// A push message with its optional payload.
    Push(Option<Bytes>),
    NotificationClick(Notification),
    /// A structured message posted by a page.
    Message(JsonValue),
}

impl WorkerEvent {
    /// Event type name as the host would dispatch it.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick(_) => "notificationclick",
            WorkerEvent::Message(_) => "message",
        }
    }
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// The event needed no reply.
    Handled,
    /// A fetch answered by the worker.
    Respond(Response),
    /// A fetch the worker declined to intercept; the host handles it.
    Passthrough,
}

impl EventOutcome {
    pub fn response(self) -> Option<Response> {
        match self {
            EventOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }
}

/// An event whose lifetime can be extended by pending work.
///
/// Tasks registered through [`wait_until`](Self::wait_until) start running
/// immediately; [`settle`](Self::settle) waits for all of them.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: JoinSet<Result<(), ServiceWorkerError>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `task` completes.
    pub fn wait_until<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.pending.spawn(task);
    }

    /// Number of tasks not yet settled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every registered task. Returns the first failure, after all
    /// tasks have finished.
    pub async fn settle(mut self) -> Result<(), ServiceWorkerError> {
        let mut first_error = None;

        while let Some(joined) = self.pending.join_next().await {
            let result = joined.map_err(|e| ServiceWorkerError::TaskFailed(e.to_string()))?;
            if let Err(e) = result {
                warn!(error = %e, "Extended task failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Messages a page may post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Activate the waiting version now.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl ControlMessage {
    /// Recognise a posted message. Anything else yields `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        ControlMessage::deserialize(data).ok()
    }
}
