//! Async driver for a session's [`LogTailer`].
//!
//! One task per watched session. Filesystem notifications (via `notify`) and
//! a poll tick both just wake the task through a [`Notify`], which coalesces
//! any number of wakeups into one, so a delta read is never started while
//! another one for the same session is in flight.
//!
//! Idle detection runs separately from per-line emission: every batch that
//! consumed bytes pushes back a quiet-window deadline, and only when the
//! deadline passes is the whole log re-read to decide whether the agent is
//! waiting for input.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::paths;
use crate::transcript::{self, LogTailer, SemanticMessage};

/// Receives what a session tailer produces.
pub trait TailerSink: Send + Sync {
    fn on_messages(&self, session: &str, messages: Vec<SemanticMessage>);
    fn on_ready(&self, session: &str, turn_id: String);
}

#[derive(Debug, Clone)]
pub struct TailerSettings {
    pub projects_dir: PathBuf,
    pub poll_interval: Duration,
    pub idle_debounce: Duration,
}

/// Handle to a running session tailer; dropping it does not stop the task.
pub struct TailerHandle {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TailerHandle {
    /// Ask the tailer to read the log now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Start tailing `session`'s log from its current end.
pub fn spawn_tailer(
    session: &str,
    settings: TailerSettings,
    sink: Arc<dyn TailerSink>,
) -> TailerHandle {
    let wake = Arc::new(Notify::new());
    let task = tokio::spawn(run_tailer(
        session.to_string(),
        settings,
        sink,
        wake.clone(),
    ));
    TailerHandle { wake, task }
}

struct SessionLog {
    path: PathBuf,
    tailer: LogTailer,
    _watcher: Option<RecommendedWatcher>,
}

async fn run_tailer(
    session: String,
    settings: TailerSettings,
    sink: Arc<dyn TailerSink>,
    wake: Arc<Notify>,
) {
    let mut log: Option<SessionLog> = None;
    let mut poll = tokio::time::interval(settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut idle_deadline: Option<Instant> = None;
    let mut last_ready: Option<String> = None;
    // History present when we attach is skipped; a log that only appears
    // later belongs to a fresh conversation and is read from the start.
    let mut attach_to_existing = true;

    loop {
        let deadline = idle_deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = wake.notified() => {}
            _ = poll.tick() => {}
            _ = tokio::time::sleep_until(deadline), if idle_deadline.is_some() => {
                idle_deadline = None;
                if let Some(current) = log.as_mut() {
                    let flushed = current.tailer.flush();
                    if !flushed.is_empty() {
                        sink.on_messages(&session, flushed);
                    }
                    check_ready(&session, &current.path, &mut last_ready, sink.as_ref()).await;
                }
                continue;
            }
        }

        if log.is_none() {
            let Some(path) = locate_log(&settings.projects_dir, &session).await else {
                attach_to_existing = false;
                continue;
            };
            info!(session = %session, log = %path.display(), "tailing conversation log");
            log = Some(if attach_to_existing {
                open_existing_log(&path, &wake, &mut last_ready).await
            } else {
                SessionLog {
                    tailer: LogTailer::new(&path),
                    _watcher: watch_directory(&path, wake.clone()),
                    path,
                }
            });
        }
        let Some(current) = log.take() else {
            continue;
        };

        let before = current.tailer.cursor();
        let (current, result) = poll_blocking(current).await;
        match result {
            Ok(messages) => {
                if current.tailer.cursor() != before {
                    idle_deadline = Some(Instant::now() + settings.idle_debounce);
                }
                if !messages.is_empty() {
                    sink.on_messages(&session, messages);
                }
            }
            Err(e) => warn!(session = %session, error = %e, "failed to read log delta"),
        }
        log = Some(current);
    }
}

/// Look for the session's log off the runtime; the search walks the
/// projects directory.
async fn locate_log(projects_dir: &Path, session: &str) -> Option<PathBuf> {
    let projects_dir = projects_dir.to_path_buf();
    let session = session.to_string();
    tokio::task::spawn_blocking(move || paths::find_session_log(&projects_dir, &session))
        .await
        .ok()
        .flatten()
}

/// Prime a tailer past the existing history and watch its directory.
async fn open_existing_log(
    path: &Path,
    wake: &Arc<Notify>,
    last_ready: &mut Option<String>,
) -> SessionLog {
    let mut tailer = LogTailer::new(path);
    let primed = tokio::task::spawn_blocking(move || {
        let primed = tailer.poll();
        (tailer, primed)
    })
    .await;
    let tailer = match primed {
        Ok((tailer, Ok(_history))) => tailer,
        Ok((tailer, Err(e))) => {
            warn!(log = %path.display(), error = %e, "failed to read existing history");
            tailer
        }
        Err(e) => {
            warn!(log = %path.display(), error = %e, "history reader panicked");
            LogTailer::new(path)
        }
    };

    // A turn that was already idle before we attached is not news.
    let entries_path = path.to_path_buf();
    if let Ok(Ok(entries)) =
        tokio::task::spawn_blocking(move || transcript::read_entries(&entries_path)).await
    {
        *last_ready = transcript::ready_turn(&entries).map(str::to_string);
    }

    SessionLog {
        path: path.to_path_buf(),
        tailer,
        _watcher: watch_directory(path, wake.clone()),
    }
}

fn watch_directory(path: &Path, wake: Arc<Notify>) -> Option<RecommendedWatcher> {
    let dir = path.parent()?;
    let target = path.to_path_buf();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|p| p == &target) {
                wake.notify_one();
            }
        }
    });
    match watcher {
        Ok(mut watcher) => match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "directory watch unavailable; polling only");
                None
            }
        },
        Err(e) => {
            debug!(error = %e, "file watcher unavailable; polling only");
            None
        }
    }
}

async fn poll_blocking(
    mut log: SessionLog,
) -> (SessionLog, anyhow::Result<Vec<SemanticMessage>>) {
    let cursor = log.tailer.cursor();
    let mut tailer = std::mem::replace(&mut log.tailer, LogTailer::with_cursor(&log.path, cursor));
    let joined = tokio::task::spawn_blocking(move || {
        let result = tailer.poll();
        (tailer, result)
    })
    .await;
    match joined {
        Ok((tailer, result)) => {
            log.tailer = tailer;
            (log, result)
        }
        // The replacement tailer resumes from the last good cursor.
        Err(e) => (log, Err(anyhow::anyhow!("log reader panicked: {e}"))),
    }
}

async fn check_ready(
    session: &str,
    path: &Path,
    last_ready: &mut Option<String>,
    sink: &dyn TailerSink,
) {
    let path = path.to_path_buf();
    let entries = match tokio::task::spawn_blocking(move || transcript::read_entries(&path)).await
    {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            warn!(session, error = %e, "idle check failed to read log");
            return;
        }
        Err(e) => {
            warn!(session, error = %e, "idle check panicked");
            return;
        }
    };

    let Some(turn_id) = transcript::ready_turn(&entries) else {
        return;
    };
    if last_ready.as_deref() == Some(turn_id) {
        return;
    }
    debug!(session, turn_id, "agent waiting for input");
    *last_ready = Some(turn_id.to_string());
    sink.on_ready(session, turn_id.to_string());
}
