//! Per-session keystroke delivery.
//!
//! Each session gets one worker task fed by an unbounded channel, so jobs for
//! a session run strictly in submission order and a multi-step job finishes
//! all of its steps before the next one starts. Sessions never wait on each
//! other. Once a job starts it runs to completion; there is no cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::keys::KeyStep;
use crate::tmux::{DeliveryError, ProcessControl};

type Outcome = Result<(), DeliveryError>;

struct Job {
    steps: Vec<KeyStep>,
    done: oneshot::Sender<Outcome>,
}

pub struct DeliveryQueue {
    control: Arc<dyn ProcessControl>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl DeliveryQueue {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn control(&self) -> &Arc<dyn ProcessControl> {
        &self.control
    }

    /// Queue `steps` for `session` and return a receiver for the outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, session: &str, steps: Vec<KeyStep>) -> oneshot::Receiver<Outcome> {
        let (done, outcome) = oneshot::channel();
        let mut job = Job { steps, done };

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = workers.get(session) {
            match tx.send(job) {
                Ok(()) => return outcome,
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(session.to_string(), self.control.clone(), rx));
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            let _ = job
                .done
                .send(Err(DeliveryError::WorkerGone(session.to_string())));
        }
        workers.insert(session.to_string(), tx);
        outcome
    }

    /// Queue `steps` and wait until every step has been delivered.
    pub async fn deliver(&self, session: &str, steps: Vec<KeyStep>) -> Outcome {
        self.enqueue(session, steps)
            .await
            .unwrap_or_else(|_| Err(DeliveryError::WorkerGone(session.to_string())))
    }

    /// Drop every worker; queued jobs still run, new ones start fresh workers.
    pub fn shutdown(&self) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

async fn run_worker(
    session: String,
    control: Arc<dyn ProcessControl>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    debug!(session = %session, "delivery worker started");
    while let Some(job) = jobs.recv().await {
        let outcome = run_steps(&session, control.as_ref(), &job.steps).await;
        if let Err(e) = &outcome {
            warn!(session = %session, error = %e, "keystroke delivery failed");
        }
        let _ = job.done.send(outcome);
    }
    debug!(session = %session, "delivery worker stopped");
}

async fn run_steps(session: &str, control: &dyn ProcessControl, steps: &[KeyStep]) -> Outcome {
    if !control.is_alive(session).await {
        return Err(DeliveryError::SessionNotFound(session.to_string()));
    }
    for step in steps {
        match step {
            KeyStep::Literal(text) => control.send_text(session, text).await?,
            KeyStep::Key(key) => control.send_key(session, *key).await?,
            KeyStep::Wait(pause) => tokio::time::sleep(*pause).await,
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::keys::NamedKey;
    use crate::tmux::{DeliveryError, ProcessControl};

    /// Records delivered keys as strings: literals verbatim, keys by name.
    #[derive(Default)]
    pub struct RecordingControl {
        pub dead: Mutex<HashSet<String>>,
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingControl {
        pub fn kill(&self, session: &str) {
            self.dead.lock().unwrap().insert(session.to_string());
        }

        pub fn sent_to(&self, session: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == session)
                .map(|(_, k)| k.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ProcessControl for RecordingControl {
        async fn is_alive(&self, session: &str) -> bool {
            !self.dead.lock().unwrap().contains(session)
        }

        async fn send_text(&self, session: &str, text: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((session.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_key(&self, session: &str, key: NamedKey) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((session.to_string(), key.tmux_name().to_string()));
            Ok(())
        }
    }
}
