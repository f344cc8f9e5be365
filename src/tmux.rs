//! Process control for agent sessions running inside tmux.
//!
//! The engine never talks to the agent directly: it checks that the tmux
//! session still exists and injects keystrokes with `send-keys`. Both
//! operations sit behind [`ProcessControl`] so tests can swap in a recorder.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::keys::NamedKey;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("tmux {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to run tmux: {0}")]
    Io(#[from] std::io::Error),
    #[error("delivery worker for session '{0}' stopped")]
    WorkerGone(String),
}

/// Controls the external agent process of a session.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Whether the session's process still exists.
    async fn is_alive(&self, session: &str) -> bool;

    /// Type `text` verbatim.
    async fn send_text(&self, session: &str, text: &str) -> Result<(), DeliveryError>;

    /// Press a named key.
    async fn send_key(&self, session: &str, key: NamedKey) -> Result<(), DeliveryError>;
}

/// [`ProcessControl`] backed by the tmux CLI.
#[derive(Debug, Clone, Default)]
pub struct TmuxControl {
    prefix: String,
}

impl TmuxControl {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// tmux target for a session id.
    ///
    /// tmux target parsing treats '.' and ':' as pane/window separators, so
    /// anything outside `[A-Za-z0-9_-]` is replaced.
    pub fn target(&self, session: &str) -> String {
        let sanitized: String = session
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}{sanitized}", self.prefix)
    }

    async fn send_keys(&self, session: &str, args: &[&str]) -> Result<(), DeliveryError> {
        let target = self.target(session);
        let output = Command::new("tmux")
            .args(["send-keys", "-t", target.as_str()])
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            if !self.is_alive(session).await {
                return Err(DeliveryError::SessionNotFound(session.to_string()));
            }
            return Err(DeliveryError::Command {
                command: "send-keys".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessControl for TmuxControl {
    async fn is_alive(&self, session: &str) -> bool {
        let target = self.target(session);
        Command::new("tmux")
            .args(["has-session", "-t", target.as_str()])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn send_text(&self, session: &str, text: &str) -> Result<(), DeliveryError> {
        if text.is_empty() {
            return Ok(());
        }
        // `-l` sends text literally so punctuation and words like "Enter"
        // are not interpreted as tmux key names.
        self.send_keys(session, &["-l", "--", text]).await?;
        debug!(session, chars = text.chars().count(), "sent literal text");
        Ok(())
    }

    async fn send_key(&self, session: &str, key: NamedKey) -> Result<(), DeliveryError> {
        self.send_keys(session, &[key.tmux_name()]).await?;
        debug!(session, key = key.tmux_name(), "sent key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_applies_prefix() {
        let control = TmuxControl::new("agent-");
        assert_eq!(control.target("abc123"), "agent-abc123");
    }

    #[test]
    fn target_sanitizes_separators() {
        let control = TmuxControl::default();
        assert_eq!(control.target("phase.1:main"), "phase-1-main");
        assert_eq!(
            control.target("0f8e2c1a-77b1-4d5e"),
            "0f8e2c1a-77b1-4d5e",
            "uuid-shaped ids pass through unchanged"
        );
    }

    #[test]
    fn trait_is_object_safe() {
        fn _accepts_dyn(_control: &dyn ProcessControl) {}
        _accepts_dyn(&TmuxControl::default());
    }

    #[test]
    fn session_not_found_message_names_session() {
        let err = DeliveryError::SessionNotFound("s1".to_string());
        assert_eq!(err.to_string(), "session 's1' not found");
    }
}
