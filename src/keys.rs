//! Semantic action → keystroke encoding.
//!
//! The agent's terminal UI has a fixed input grammar: numbered menu entries,
//! Tab reaches the Submit control of a question, Right reaches Submit in
//! multi-select mode, Escape dismisses a prompt. [`ActionEncoder`] maps a
//! semantic action plus optional text onto that grammar as an ordered list of
//! [`KeyStep`]s. It performs no I/O; delivery lives in [`crate::delivery`].
//!
//! The pause between multi-select keystrokes is a timing contract with the
//! external UI: each toggle must register before the next key arrives or it
//! is dropped. Keep it configurable, never remove it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pause between multi-select keystrokes.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

/// Keys sent by name rather than as literal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    Enter,
    Escape,
    Tab,
    Right,
}

impl NamedKey {
    /// Key name as tmux `send-keys` understands it.
    pub fn tmux_name(self) -> &'static str {
        match self {
            NamedKey::Enter => "Enter",
            NamedKey::Escape => "Escape",
            NamedKey::Tab => "Tab",
            NamedKey::Right => "Right",
        }
    }
}

/// One primitive input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStep {
    /// Text typed verbatim; never interpreted as key names.
    Literal(String),
    Key(NamedKey),
    Wait(Duration),
}

impl KeyStep {
    fn literal(text: impl Into<String>) -> Self {
        KeyStep::Literal(text.into())
    }
}

impl fmt::Display for KeyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStep::Literal(text) => write!(f, "{text:?}"),
            KeyStep::Key(key) => write!(f, "{{{}}}", key.tmux_name()),
            KeyStep::Wait(d) => write!(f, "wait({}ms)", d.as_millis()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Continue,
    Approve,
    Reject,
    Permission,
    Answer,
    AnswerMulti,
    Other,
    Message,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Continue => "continue",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Permission => "permission",
            Action::Answer => "answer",
            Action::AnswerMulti => "answer-multi",
            Action::Other => "other",
            Action::Message => "message",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Action::Continue),
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            "permission" => Ok(Action::Permission),
            "answer" => Ok(Action::Answer),
            "answer-multi" => Ok(Action::AnswerMulti),
            "other" => Ok(Action::Other),
            "message" => Ok(Action::Message),
            other => Err(EncodeError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("action '{action}' expects {expected}, got {text:?}")]
    InvalidPayload {
        action: Action,
        expected: &'static str,
        text: String,
    },
}

/// Raw submission as observers send it: free text and/or an action tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Submission {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            action: None,
        }
    }

    pub fn action(action: Action, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            action: Some(action.as_str().to_string()),
        }
    }

    /// Parsed action tag; an empty tag counts as none.
    pub fn parsed_action(&self) -> Result<Option<Action>, EncodeError> {
        match self.action.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(tag) => tag.parse().map(Some),
        }
    }

    /// Text that will be typed into the session as a new user message, if any.
    pub fn typed_message(&self) -> Option<&str> {
        match self.parsed_action() {
            Ok(None | Some(Action::Message)) => {
                self.text.as_deref().filter(|text| !text.is_empty())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionEncoder {
    step_delay: Duration,
}

impl Default for ActionEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_DELAY)
    }
}

impl ActionEncoder {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    pub fn step_delay(&self) -> Duration {
        self.step_delay
    }

    pub fn encode_submission(&self, submission: &Submission) -> Result<Vec<KeyStep>, EncodeError> {
        self.encode(submission.parsed_action()?, submission.text.as_deref())
    }

    /// Encode an action and its payload into keystrokes.
    pub fn encode(
        &self,
        action: Option<Action>,
        text: Option<&str>,
    ) -> Result<Vec<KeyStep>, EncodeError> {
        let text = text.unwrap_or("");
        let enter = KeyStep::Key(NamedKey::Enter);

        let steps = match action {
            None | Some(Action::Message) if text.is_empty() => vec![enter],
            None | Some(Action::Message) => vec![KeyStep::literal(text), enter],
            Some(Action::Continue) => vec![enter],
            Some(Action::Approve) => vec![KeyStep::literal("y"), enter],
            Some(Action::Reject) => vec![KeyStep::literal("n"), enter],
            Some(Action::Permission) if text == "Escape" => vec![KeyStep::Key(NamedKey::Escape)],
            Some(Action::Permission) => {
                let digit = option_number(Action::Permission, text)?;
                vec![KeyStep::literal(digit), enter]
            }
            Some(Action::Answer) => {
                let digit = option_number(Action::Answer, text)?;
                vec![KeyStep::literal(digit), KeyStep::Key(NamedKey::Tab), enter]
            }
            Some(Action::AnswerMulti) => self.encode_multi(text)?,
            Some(Action::Other) => {
                let invalid = || EncodeError::InvalidPayload {
                    action: Action::Other,
                    expected: "'<option count>:<text>'",
                    text: text.to_string(),
                };
                let (count, literal) = text.split_once(':').ok_or_else(invalid)?;
                let count: usize = count.trim().parse().map_err(|_| invalid())?;
                let other_option = count.checked_add(1).ok_or_else(invalid)?;
                vec![
                    KeyStep::literal(other_option.to_string()),
                    KeyStep::literal(literal),
                    KeyStep::Key(NamedKey::Tab),
                    enter,
                ]
            }
        };
        Ok(steps)
    }

    fn encode_multi(&self, text: &str) -> Result<Vec<KeyStep>, EncodeError> {
        let indices = text
            .split(',')
            .map(|index| option_number(Action::AnswerMulti, index.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut steps = Vec::with_capacity(indices.len() * 2 + 3);
        for index in indices {
            steps.push(KeyStep::literal(index));
            steps.push(KeyStep::Wait(self.step_delay));
        }
        steps.push(KeyStep::Key(NamedKey::Right));
        steps.push(KeyStep::Wait(self.step_delay));
        steps.push(KeyStep::Key(NamedKey::Enter));
        Ok(steps)
    }
}

/// Menu entries are selected by typing their number.
fn option_number(action: Action, text: &str) -> Result<String, EncodeError> {
    let trimmed = text.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        Ok(trimmed.to_string())
    } else {
        Err(EncodeError::InvalidPayload {
            action,
            expected: "an option number",
            text: text.to_string(),
        })
    }
}
