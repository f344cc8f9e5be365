//! Advisory per-session device leases.
//!
//! The lease only drives a "someone else took over" notice: it is last
//! writer wins, not a lock. A touch from a new device replaces the holder at
//! once and reports whom it displaced; the holder's heartbeat keeps the lease
//! from being swept as abandoned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Leases expire after this long without a touch.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceLease {
    pub session_id: String,
    pub device_id: String,
    pub renewed_at: DateTime<Utc>,
}

/// Result of [`LeaseTable::touch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch {
    /// The touching device did not hold the lease before this call.
    pub is_new_holder: bool,
    /// Previous holder displaced by this call.
    pub evicted: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LeaseTable {
    inner: Arc<Mutex<HashMap<String, DeviceLease>>>,
    ttl: Duration,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, DeviceLease>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn touch(&self, session: &str, device: &str) -> Touch {
        self.touch_at(session, device, Utc::now())
    }

    pub fn touch_at(&self, session: &str, device: &str, now: DateTime<Utc>) -> Touch {
        let previous = self.leases().insert(
            session.to_string(),
            DeviceLease {
                session_id: session.to_string(),
                device_id: device.to_string(),
                renewed_at: now,
            },
        );
        match previous {
            Some(lease) if lease.device_id == device => Touch {
                is_new_holder: false,
                evicted: None,
            },
            Some(lease) => Touch {
                is_new_holder: true,
                evicted: Some(lease.device_id),
            },
            None => Touch {
                is_new_holder: true,
                evicted: None,
            },
        }
    }

    pub fn holder(&self, session: &str) -> Option<String> {
        self.leases().get(session).map(|l| l.device_id.clone())
    }

    /// Remove leases not renewed within the TTL as of `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<DeviceLease> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.leases().retain(|_, lease| {
            let stale = (now - lease.renewed_at)
                .to_std()
                .is_ok_and(|age| age >= ttl);
            if stale {
                expired.push(lease.clone());
            }
            !stale
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.leases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.leases().clear();
    }
}
