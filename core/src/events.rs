//! Per-host lifecycle events

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::NodeOutcome;

/// What happened on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Connecting,
    Connected,
    /// The operation started on the host
    Executing,
    /// Cumulative body bytes written so far
    Progress { written: u64, total: u64 },
    Verifying,
    /// Remote stdout of a finished command
    Output,
    Completed,
    Failed,
}

/// One event, tagged with the host string as requested
#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    pub host: String,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<NodeOutcome>,
}

impl NodeEvent {
    pub fn new(host: impl Into<String>, kind: EventKind) -> Self {
        Self {
            host: host.into(),
            kind,
            message: String::new(),
            outcome: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_outcome(mut self, outcome: NodeOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

type Callback = dyn Fn(&NodeEvent) + Send + Sync;

/// Where host tasks report events; invoked inline from the task
#[derive(Clone, Default)]
pub struct EventSink(Option<Arc<Callback>>);

impl EventSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(callback)))
    }

    /// Sink that drops every event
    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: NodeEvent) {
        if let Some(callback) = &self.0 {
            callback(&event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSink")
            .field(&self.0.as_ref().map(|_| "<callback>"))
            .finish()
    }
}
