//! Fan-out of session events to attached observers.
//!
//! Delivery is best effort: a sink whose channel is full is skipped for that
//! event, and a closed sink is dropped. Events for one session go out in the
//! order `publish` is called; nothing is ordered across sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::pending::PendingRequest;
use crate::transcript::SemanticMessage;

/// Events pushed to observers, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Messages {
        messages: Vec<SemanticMessage>,
    },
    /// The agent finished its turn and is waiting for input.
    Ready {
        turn_id: String,
    },
    LeaseTakenOver {
        holder: String,
        evicted: String,
    },
    PendingRequest {
        request: PendingRequest,
    },
    PendingRequestResolved {
        tool_use_id: String,
        /// `None` when it was resolved without a human decision (log or expiry).
        #[serde(skip_serializing_if = "Option::is_none")]
        approved: Option<bool>,
    },
    HeartbeatAck {
        holder: Option<String>,
        /// How often the client should heartbeat.
        heartbeat_secs: u64,
    },
    Error {
        message: String,
    },
    /// Pre-built payload forwarded untouched (developer injection).
    #[serde(untagged)]
    Raw(Value),
}

/// Messages observers send on their push channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Heartbeat {
        #[serde(default)]
        device_id: Option<String>,
    },
    SubmitAction {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        action: Option<String>,
    },
    CancelCurrent,
}

pub type EventSink = mpsc::Sender<SessionEvent>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    sinks: HashMap<String, Vec<(u64, EventSink)>>,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

/// Keeps a sink attached; dropping it detaches.
pub struct Subscription {
    registry: Arc<Mutex<Registry>>,
    session: String,
    id: u64,
}

impl Subscription {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = registry.sinks.get_mut(&self.session) {
            sinks.retain(|(id, _)| *id != self.id);
            if sinks.is_empty() {
                registry.sinks.remove(&self.session);
            }
        }
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, session: &str, sink: EventSink) -> Subscription {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .sinks
            .entry(session.to_string())
            .or_default()
            .push((id, sink));
        Subscription {
            registry: self.registry.clone(),
            session: session.to_string(),
            id,
        }
    }

    /// Send `event` to every sink of `session`; returns how many accepted it.
    pub fn publish(&self, session: &str, event: SessionEvent) -> usize {
        let mut registry = self.registry();
        let Some(sinks) = registry.sinks.get_mut(session) else {
            return 0;
        };

        let mut delivered = 0;
        sinks.retain(|(id, sink)| match sink.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(session, subscriber = id, "observer not ready; event skipped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self, session: &str) -> usize {
        self.registry().sinks.get(session).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.registry().sinks.clear();
    }
}
