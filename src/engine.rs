//! Session interaction engine.
//!
//! Owns every store the server needs (pending ledger, lease table, observer
//! registry, per-session tailers and delivery workers) behind one cloneable
//! handle. Stores are constructed here and cleared by [`Engine::shutdown`];
//! nothing is process-global, so tests build isolated engines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, EventSink, SessionEvent, Subscription};
use crate::config::ProjectConfig;
use crate::delivery::DeliveryQueue;
use crate::keys::{Action, ActionEncoder, EncodeError, KeyStep, NamedKey, Submission};
use crate::lease::{LeaseTable, Touch};
use crate::paths;
use crate::pending::{Claim, PendingLedger, PendingRequest};
use crate::tmux::{DeliveryError, ProcessControl};
use crate::transcript::{self, SemanticMessage};
use crate::watcher::{self, TailerHandle, TailerSettings, TailerSink};

/// Unconfirmed placeholders kept per session.
const MAX_PLACEHOLDERS: usize = 32;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("request '{tool_use_id}' belongs to session '{owner}', not '{session}'")]
    WrongSession {
        tool_use_id: String,
        session: String,
        owner: String,
    },
    #[error("invalid injected event: {0}")]
    InvalidInjection(serde_json::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("delivery failed: {0}")]
    Delivery(DeliveryError),
    #[error("no conversation log for session '{0}'")]
    LogNotFound(String),
    #[error(transparent)]
    Log(#[from] anyhow::Error),
}

impl From<DeliveryError> for EngineError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::SessionNotFound(session) => EngineError::SessionNotFound(session),
            other => EngineError::Delivery(other),
        }
    }
}

/// Result of resolving a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Another device (or the agent itself) got there first.
    AlreadyResolved,
}

impl ResolveOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolveOutcome::Resolved => "resolved",
            ResolveOutcome::AlreadyResolved => "already_resolved",
        }
    }
}

/// How a human answered a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    /// Approve and stop asking for this kind of call.
    ApproveAlways,
    Deny,
}

impl Decision {
    pub fn from_flags(approved: bool, always: bool) -> Self {
        match (approved, always) {
            (false, _) => Decision::Deny,
            (true, false) => Decision::Approve,
            (true, true) => Decision::ApproveAlways,
        }
    }

    pub fn approved(self) -> bool {
        self != Decision::Deny
    }

    fn permission_choice(self) -> &'static str {
        match self {
            Decision::Approve => "1",
            Decision::ApproveAlways => "2",
            Decision::Deny => "Escape",
        }
    }
}

/// What the developer injection endpoint did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injected {
    /// A `permission_request` went into the ledger.
    Recorded(String),
    /// Forwarded untouched to this many observers.
    Forwarded(usize),
}

#[derive(Debug, Deserialize)]
struct InjectedRequest {
    tool_use_id: String,
    #[serde(default)]
    session_id: Option<String>,
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tailer: TailerSettings,
    pub step_delay: Duration,
    pub pending_expiry: Duration,
    pub pending_sweep_interval: Duration,
    pub lease_ttl: Duration,
    /// Told to clients in every heartbeat ack.
    pub lease_heartbeat: Duration,
    pub lease_sweep_interval: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            tailer: TailerSettings {
                projects_dir: config.transcripts.projects_dir(),
                poll_interval: config.transcripts.poll_interval(),
                idle_debounce: config.transcripts.idle_debounce(),
            },
            step_delay: config.delivery.step_delay(),
            pending_expiry: Duration::from_secs(config.pending.expiry_secs),
            pending_sweep_interval: Duration::from_secs(config.pending.sweep_interval_secs.max(1)),
            lease_ttl: Duration::from_secs(config.lease.ttl_secs),
            lease_heartbeat: Duration::from_secs(config.lease.heartbeat_secs),
            lease_sweep_interval: Duration::from_secs(config.lease.sweep_interval_secs.max(1)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ProjectConfig::default())
    }
}

/// Everything an observer needs when it first attaches.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub messages: Vec<SemanticMessage>,
    /// Set when the agent is waiting for input.
    pub ready: Option<String>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: EngineSettings,
    encoder: ActionEncoder,
    ledger: PendingLedger,
    leases: LeaseTable,
    broadcaster: Broadcaster,
    delivery: DeliveryQueue,
    tailers: Mutex<HashMap<String, TailerHandle>>,
    placeholders: Mutex<HashMap<String, Vec<SemanticMessage>>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Engine {
    pub fn new(settings: EngineSettings, control: Arc<dyn ProcessControl>) -> Self {
        let inner = EngineInner {
            encoder: ActionEncoder::new(settings.step_delay),
            ledger: PendingLedger::new(settings.pending_expiry),
            leases: LeaseTable::new(settings.lease_ttl),
            broadcaster: Broadcaster::new(),
            delivery: DeliveryQueue::new(control),
            tailers: Mutex::new(HashMap::new()),
            placeholders: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(Vec::new()),
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn ledger(&self) -> &PendingLedger {
        &self.inner.ledger
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.inner.leases
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Store an approval request from the agent's hook and announce it.
    pub fn record_request(&self, request: PendingRequest) {
        let session = request.session_id.clone();
        info!(
            session = %session,
            tool_use_id = %request.tool_use_id,
            tool = %request.tool_name,
            "pending request recorded"
        );
        self.inner.ledger.record(request.clone());
        self.inner.ensure_tailer(&mut lock(&self.inner.tailers), &session);
        self.inner
            .broadcaster
            .publish(&session, SessionEvent::PendingRequest { request });
    }

    pub fn list_requests(&self, session: Option<&str>) -> Vec<PendingRequest> {
        self.inner.ledger.list(session)
    }

    /// Answer a pending request by pressing the matching permission key.
    ///
    /// Keys go to the session the request was recorded under; naming any
    /// other session is rejected and leaves the request pending. Returns once
    /// the keys are queued; it does not wait for the agent.
    pub async fn resolve_request(
        &self,
        tool_use_id: &str,
        session: &str,
        decision: Decision,
    ) -> Result<ResolveOutcome, EngineError> {
        if !self.inner.delivery.control().is_alive(session).await {
            return Err(EngineError::SessionNotFound(session.to_string()));
        }
        let request = match self.inner.ledger.claim(tool_use_id, session) {
            Claim::Won(request) => request,
            Claim::Missing => {
                debug!(session, tool_use_id, "pending request already resolved");
                return Ok(ResolveOutcome::AlreadyResolved);
            }
            Claim::OtherSession(owner) => {
                warn!(session, tool_use_id, owner = %owner, "resolve names the wrong session");
                return Err(EngineError::WrongSession {
                    tool_use_id: tool_use_id.to_string(),
                    session: session.to_string(),
                    owner,
                });
            }
        };

        let steps = self
            .inner
            .encoder
            .encode(Some(Action::Permission), Some(decision.permission_choice()))?;
        drop(self.inner.delivery.enqueue(&request.session_id, steps));

        info!(session, tool_use_id, ?decision, "pending request resolved");
        self.inner.broadcaster.publish(
            &request.session_id,
            SessionEvent::PendingRequestResolved {
                tool_use_id: request.tool_use_id.clone(),
                approved: Some(decision.approved()),
            },
        );
        self.inner.release_tailer(&request.session_id);
        Ok(ResolveOutcome::Resolved)
    }

    /// Encode and deliver an observer's submission.
    ///
    /// A plain message is echoed to observers as a pending placeholder once
    /// its keys are delivered, unless the log already confirmed it.
    pub async fn submit_action(
        &self,
        session: &str,
        submission: &Submission,
    ) -> Result<(), EngineError> {
        let steps = self.inner.encoder.encode_submission(submission)?;
        debug!(
            session,
            action = submission.action.as_deref().unwrap_or("message"),
            steps = steps.len(),
            "delivering submission"
        );

        // Registered before the keys go out so the confirming log line can
        // never arrive ahead of it.
        let placeholder = submission.typed_message().map(SemanticMessage::placeholder);
        if let Some(placeholder) = &placeholder {
            self.inner.hold_placeholder(session, placeholder.clone());
        }
        if let Err(e) = self.inner.delivery.deliver(session, steps).await {
            if let Some(placeholder) = &placeholder {
                self.inner.drop_placeholder(session, &placeholder.id);
            }
            return Err(e.into());
        }
        if let Some(placeholder) = placeholder {
            self.inner.publish_placeholder(session, placeholder);
        }
        Ok(())
    }

    /// Dismiss whatever prompt the agent is showing.
    pub async fn cancel_current(&self, session: &str) -> Result<(), EngineError> {
        self.inner
            .delivery
            .deliver(session, vec![KeyStep::Key(NamedKey::Escape)])
            .await?;
        Ok(())
    }

    /// Renew or take the session lease for `device`, announcing takeovers.
    pub fn heartbeat(&self, session: &str, device: &str) -> Touch {
        let touch = self.inner.leases.touch(session, device);
        if let Some(evicted) = &touch.evicted {
            info!(session, holder = device, evicted = %evicted, "session lease taken over");
            self.inner.broadcaster.publish(
                session,
                SessionEvent::LeaseTakenOver {
                    holder: device.to_string(),
                    evicted: evicted.clone(),
                },
            );
        }
        touch
    }

    pub fn lease_holder(&self, session: &str) -> Option<String> {
        self.inner.leases.holder(session)
    }

    /// Subscribe `sink` to `session`, starting its tailer if needed.
    ///
    /// Dropping the returned [`Attachment`] detaches; the tailer stops once
    /// the session has no observers and no pending requests.
    pub fn attach(&self, session: &str, device: Option<&str>, sink: EventSink) -> Attachment {
        let subscription = {
            let mut tailers = lock(&self.inner.tailers);
            self.inner.ensure_tailer(&mut tailers, session);
            self.inner.broadcaster.subscribe(session, sink)
        };
        if let Some(device) = device {
            self.heartbeat(session, device);
        }
        Attachment {
            subscription: Some(subscription),
            session: session.to_string(),
            engine: Arc::downgrade(&self.inner),
        }
    }

    /// Developer injection: a `permission_request` event is recorded as a
    /// pending request, anything else is pushed to observers untouched.
    pub fn inject(&self, session: &str, payload: Value) -> Result<Injected, EngineError> {
        if payload.get("type").and_then(Value::as_str) != Some("permission_request") {
            let delivered = self
                .inner
                .broadcaster
                .publish(session, SessionEvent::Raw(payload));
            return Ok(Injected::Forwarded(delivered));
        }

        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let injected: InjectedRequest =
            serde_json::from_value(data).map_err(EngineError::InvalidInjection)?;
        let mut request = PendingRequest::new(
            injected.tool_use_id,
            injected.session_id.unwrap_or_else(|| session.to_string()),
            injected.tool_name,
            injected.tool_input,
        );
        if let Some(received_at) = injected.received_at {
            request.received_at = received_at;
        }
        let key = request.tool_use_id.clone();
        self.record_request(request);
        Ok(Injected::Recorded(key))
    }

    /// Sessions with a live tailer.
    pub fn tailed_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = lock(&self.inner.tailers)
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        sessions
    }

    pub fn log_path(&self, session: &str) -> Result<PathBuf, EngineError> {
        paths::find_session_log(&self.inner.settings.tailer.projects_dir, session)
            .ok_or_else(|| EngineError::LogNotFound(session.to_string()))
    }

    /// Resolve the whole log now. A session without a log has no messages.
    pub async fn snapshot(&self, session: &str) -> Result<Snapshot, EngineError> {
        let projects_dir = self.inner.settings.tailer.projects_dir.clone();
        let session = session.to_string();
        let snapshot = tokio::task::spawn_blocking(move || -> anyhow::Result<Snapshot> {
            let Some(path) = paths::find_session_log(&projects_dir, &session) else {
                return Ok(Snapshot::default());
            };
            let entries = transcript::read_entries(&path)?;
            Ok(Snapshot {
                ready: transcript::ready_turn(&entries).map(str::to_string),
                messages: transcript::messages_from_entries(&entries),
            })
        })
        .await
        .map_err(|e| anyhow::anyhow!("log reader panicked: {e}"))??;
        Ok(snapshot)
    }

    pub async fn read_messages(&self, session: &str) -> Result<Vec<SemanticMessage>, EngineError> {
        Ok(self.snapshot(session).await?.messages)
    }

    pub async fn is_ready(&self, session: &str) -> Result<bool, EngineError> {
        Ok(self.snapshot(session).await?.ready.is_some())
    }

    /// Expire stale pending requests and leases as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.inner.sweep_pending(now);
        self.inner.sweep_leases(now);
    }

    /// Start the periodic ledger and lease sweeps.
    pub fn start_maintenance(&self) {
        let pending = spawn_periodic(
            Arc::downgrade(&self.inner),
            self.inner.settings.pending_sweep_interval,
            |inner| inner.sweep_pending(Utc::now()),
        );
        let leases = spawn_periodic(
            Arc::downgrade(&self.inner),
            self.inner.settings.lease_sweep_interval,
            |inner| inner.sweep_leases(Utc::now()),
        );
        lock(&self.inner.maintenance).extend([pending, leases]);
    }

    /// Stop background tasks and clear every store.
    pub fn shutdown(&self) {
        for task in lock(&self.inner.maintenance).drain(..) {
            task.abort();
        }
        for (_, tailer) in lock(&self.inner.tailers).drain() {
            tailer.stop();
        }
        self.inner.delivery.shutdown();
        self.inner.ledger.clear();
        self.inner.leases.clear();
        self.inner.broadcaster.clear();
        lock(&self.inner.placeholders).clear();
        info!("engine stopped");
    }

}

/// An observer's place in a session; dropping it detaches.
pub struct Attachment {
    subscription: Option<Subscription>,
    session: String,
    engine: Weak<EngineInner>,
}

impl Attachment {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn detach(self) {}
}

impl Drop for Attachment {
    fn drop(&mut self) {
        drop(self.subscription.take());
        if let Some(inner) = self.engine.upgrade() {
            inner.release_tailer(&self.session);
        }
    }
}

fn spawn_periodic(
    inner: Weak<EngineInner>,
    every: Duration,
    run: fn(&EngineInner),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            run(&inner);
        }
    })
}

impl EngineInner {
    /// Start `session`'s tailer unless one is running. Callers hold the
    /// tailers lock so a concurrent release cannot interleave.
    fn ensure_tailer(self: &Arc<Self>, tailers: &mut HashMap<String, TailerHandle>, session: &str) {
        if tailers.get(session).is_some_and(TailerHandle::is_running) {
            return;
        }
        let sink: Arc<dyn TailerSink> = Arc::new(EngineSink(Arc::downgrade(self)));
        let handle = watcher::spawn_tailer(session, self.settings.tailer.clone(), sink);
        tailers.insert(session.to_string(), handle);
    }

    /// Stop `session`'s tailer once no observer and no pending request needs it.
    fn release_tailer(&self, session: &str) {
        let mut tailers = lock(&self.tailers);
        if self.broadcaster.subscriber_count(session) > 0
            || !self.ledger.list(Some(session)).is_empty()
        {
            return;
        }
        if let Some(handle) = tailers.remove(session) {
            handle.stop();
            debug!(session, "tailer stopped; session unobserved");
        }
    }

    fn hold_placeholder(&self, session: &str, placeholder: SemanticMessage) {
        let mut placeholders = lock(&self.placeholders);
        let pending = placeholders.entry(session.to_string()).or_default();
        pending.push(placeholder);
        if pending.len() > MAX_PLACEHOLDERS {
            pending.remove(0);
        }
    }

    fn drop_placeholder(&self, session: &str, id: &str) {
        if let Some(pending) = lock(&self.placeholders).get_mut(session) {
            pending.retain(|p| p.id != id);
        }
    }

    /// Announce a held placeholder unless the log already confirmed it.
    fn publish_placeholder(&self, session: &str, placeholder: SemanticMessage) {
        let placeholders = lock(&self.placeholders);
        let unconfirmed = placeholders
            .get(session)
            .is_some_and(|pending| pending.iter().any(|p| p.id == placeholder.id));
        if !unconfirmed {
            debug!(session, "message confirmed before its placeholder went out");
            return;
        }
        self.broadcaster.publish(
            session,
            SessionEvent::Messages {
                messages: vec![placeholder],
            },
        );
    }

    fn sweep_pending(&self, now: DateTime<Utc>) {
        let mut sessions = Vec::new();
        for request in self.ledger.sweep(now) {
            debug!(
                session = %request.session_id,
                tool_use_id = %request.tool_use_id,
                "pending request expired"
            );
            self.broadcaster.publish(
                &request.session_id,
                SessionEvent::PendingRequestResolved {
                    tool_use_id: request.tool_use_id,
                    approved: None,
                },
            );
            sessions.push(request.session_id);
        }
        sessions.dedup();
        for session in sessions {
            self.release_tailer(&session);
        }
    }

    fn sweep_leases(&self, now: DateTime<Utc>) {
        for lease in self.leases.sweep(now) {
            debug!(session = %lease.session_id, device = %lease.device_id, "lease expired");
        }
    }

    fn publish_messages(&self, session: &str, mut messages: Vec<SemanticMessage>) {
        let mut resolved = Vec::new();
        {
            // Held until the batch is published so a placeholder cannot be
            // announced after the message that replaces it.
            let mut placeholders = lock(&self.placeholders);
            for message in &mut messages {
                if let Some(key) = message.tool_result_id() {
                    if self.ledger.resolve(key).is_some() {
                        debug!(session, tool_use_id = key, "pending request answered in log");
                        resolved.push(key.to_string());
                    }
                }

                if message.pending {
                    continue;
                }
                let Some(text) = message.user_text().map(str::to_string) else {
                    continue;
                };
                if let Some(pending) = placeholders.get_mut(session) {
                    if let Some(pos) = pending
                        .iter()
                        .position(|p| p.user_text() == Some(text.as_str()))
                    {
                        message.replaces = Some(pending.remove(pos).id);
                    }
                }
            }
            self.broadcaster
                .publish(session, SessionEvent::Messages { messages });
        }

        let reconciled = !resolved.is_empty();
        for tool_use_id in resolved {
            self.broadcaster.publish(
                session,
                SessionEvent::PendingRequestResolved {
                    tool_use_id,
                    approved: None,
                },
            );
        }
        if reconciled {
            self.release_tailer(session);
        }
    }
}

/// Tailer callback that does not keep the engine alive.
struct EngineSink(Weak<EngineInner>);

impl TailerSink for EngineSink {
    fn on_messages(&self, session: &str, messages: Vec<SemanticMessage>) {
        match self.0.upgrade() {
            Some(inner) => inner.publish_messages(session, messages),
            None => warn!(session, "engine gone; dropping tailed messages"),
        }
    }

    fn on_ready(&self, session: &str, turn_id: String) {
        if let Some(inner) = self.0.upgrade() {
            debug!(session, turn_id = %turn_id, "agent waiting for input");
            inner
                .broadcaster
                .publish(session, SessionEvent::Ready { turn_id });
        }
    }
}
