//! Ledger of out-of-band requests waiting for a human decision.
//!
//! The agent's permission hook posts a request keyed by the tool-use id it
//! is about to run. The key is the correlation between that request and the
//! eventual resolution: at most one entry exists per key, re-recording a key
//! overwrites it, and resolving removes it atomically so two devices racing
//! on the same key cannot both win. Unresolved entries expire after a fixed
//! window. State is in memory only and does not survive a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Default expiry for unresolved requests.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Correlation key: the tool-use id the request is about.
    pub tool_use_id: String,
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub received_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn new(
        tool_use_id: impl Into<String>,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: Value,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            received_at: Utc::now(),
        }
    }

    fn expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        (now - self.received_at)
            .to_std()
            .is_ok_and(|age| age >= expiry)
    }
}

/// Result of [`PendingLedger::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Won(PendingRequest),
    Missing,
    /// Recorded under another session; left in place.
    OtherSession(String),
}

#[derive(Debug, Clone)]
pub struct PendingLedger {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
    expiry: Duration,
}

impl Default for PendingLedger {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}

impl PendingLedger {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            expiry,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a request, replacing any earlier one with the same key.
    /// Returns the replaced request.
    pub fn record(&self, request: PendingRequest) -> Option<PendingRequest> {
        let previous = self
            .entries()
            .insert(request.tool_use_id.clone(), request);
        if let Some(previous) = &previous {
            debug!(tool_use_id = %previous.tool_use_id, "pending request overwritten");
        }
        previous
    }

    /// Remove and return the request for `key`.
    ///
    /// `None` means someone else resolved it first, it expired, or it was
    /// never recorded (for example before a restart).
    pub fn resolve(&self, key: &str) -> Option<PendingRequest> {
        self.entries().remove(key)
    }

    /// Remove the request for `key` only if it belongs to `session`.
    pub fn claim(&self, key: &str, session: &str) -> Claim {
        let mut entries = self.entries();
        match entries.get(key) {
            None => Claim::Missing,
            Some(request) if request.session_id != session => {
                Claim::OtherSession(request.session_id.clone())
            }
            Some(_) => entries.remove(key).map_or(Claim::Missing, Claim::Won),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// Pending requests, oldest first, optionally limited to one session.
    pub fn list(&self, session: Option<&str>) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self
            .entries()
            .values()
            .filter(|r| session.is_none_or(|s| r.session_id == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.tool_use_id.cmp(&b.tool_use_id))
        });
        requests
    }

    /// Drop requests older than the expiry window as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<PendingRequest> {
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .values()
            .filter(|r| r.expired(now, self.expiry))
            .map(|r| r.tool_use_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;

    fn request(key: &str, session: &str, tool: &str) -> PendingRequest {
        PendingRequest::new(key, session, tool, json!({"command": "ls"}))
    }

    #[test]
    fn record_then_list() {
        let ledger = PendingLedger::default();
        ledger.record(request("t1", "s1", "Bash"));
        ledger.record(request("t2", "s2", "Write"));

        assert_eq!(ledger.list(None).len(), 2);
        let s1 = ledger.list(Some("s1"));
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].tool_use_id, "t1");
    }

    #[test]
    fn rerecord_overwrites() {
        let ledger = PendingLedger::default();
        ledger.record(request("t1", "s1", "Bash"));
        let previous = ledger.record(request("t1", "s1", "Edit"));

        assert_eq!(previous.unwrap().tool_name, "Bash");
        let all = ledger.list(None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tool_name, "Edit");
    }

    #[test]
    fn resolve_removes_entry() {
        let ledger = PendingLedger::default();
        ledger.record(request("t1", "s1", "Bash"));
        assert_eq!(ledger.resolve("t1").unwrap().tool_name, "Bash");
        assert!(ledger.resolve("t1").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn claim_checks_the_owning_session() {
        let ledger = PendingLedger::default();
        ledger.record(request("t1", "s1", "Bash"));

        assert_eq!(ledger.claim("t1", "s2"), Claim::OtherSession("s1".to_string()));
        assert!(ledger.contains("t1"));
        assert!(matches!(ledger.claim("t1", "s1"), Claim::Won(r) if r.tool_name == "Bash"));
        assert_eq!(ledger.claim("t1", "s1"), Claim::Missing);
    }

    #[test]
    fn concurrent_resolve_has_single_winner() {
        let ledger = PendingLedger::default();
        ledger.record(request("t1", "s1", "Bash"));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.resolve("t1").is_some()
                })
            })
            .collect();
        let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
        assert!(!ledger.contains("t1"));
    }

    #[test]
    fn sweep_drops_only_expired() {
        let ledger = PendingLedger::new(Duration::from_secs(600));
        let now = Utc::now();
        let mut old = request("old", "s1", "Bash");
        old.received_at = now - chrono::Duration::seconds(601);
        ledger.record(old);
        ledger.record(request("fresh", "s1", "Bash"));

        let swept = ledger.sweep(now);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].tool_use_id, "old");
        assert!(ledger.contains("fresh"));
    }

    #[test]
    fn list_is_oldest_first() {
        let ledger = PendingLedger::default();
        let now = Utc::now();
        let mut newer = request("b", "s1", "Bash");
        newer.received_at = now;
        let mut older = request("a", "s1", "Bash");
        older.received_at = now - chrono::Duration::seconds(5);
        ledger.record(newer);
        ledger.record(older);

        let keys: Vec<_> = ledger.list(None).into_iter().map(|r| r.tool_use_id).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn received_at_serializes_as_millis() {
        let json = json!({
            "tool_use_id": "t1",
            "session_id": "s1",
            "tool_name": "Bash",
            "tool_input": {"command": "echo test"},
            "received_at": 1_700_000_000_000i64
        });
        let request: PendingRequest = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(request.received_at.timestamp(), 1_700_000_000);
        assert_eq!(serde_json::to_value(&request).unwrap(), json);
    }
}
