//! Conversation log parsing.
//!
//! The agent appends one JSON record per line to a per-session log. This
//! module turns those records into [`SemanticMessage`]s: decoding lives in
//! [`decode`], incremental delta reads in [`tailer`], and the one-shot
//! "everything resolved so far" read plus idle detection live here.

pub mod decode;
pub mod tailer;

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub use decode::{AgentTurn, ContentBlock, EntryKind, HumanContent, HumanText, LogEntry, decode_line};
pub use tailer::LogTailer;

/// Tool name the agent uses for structured multiple-choice questions.
pub const ASK_USER_QUESTION: &str = "AskUserQuestion";
/// Tool name the agent uses to request approval of a plan.
pub const EXIT_PLAN_MODE: &str = "ExitPlanMode";

/// Renderable unit derived from a log entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SemanticMessage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: MessageBody,
    /// Locally synthesized placeholder not yet confirmed by the log.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
    /// Placeholder id this confirmed message supersedes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    UserText {
        text: String,
    },
    AgentText {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Question {
        tool_use_id: String,
        index: usize,
        question: Question,
        answered: bool,
    },
    PlanApproval {
        tool_use_id: String,
        plan: String,
        answered: bool,
    },
    Hidden {
        text: String,
    },
}

/// One entry of an `AskUserQuestion` batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub multi_select: bool,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
struct QuestionBatch {
    #[serde(default)]
    questions: Vec<Question>,
}

impl SemanticMessage {
    fn from_entry(entry: &LogEntry, id: String, body: MessageBody) -> Self {
        Self {
            id,
            parent_id: entry.parent_id.clone(),
            timestamp: entry.timestamp,
            body,
            pending: false,
            replaces: None,
        }
    }

    /// Optimistic echo of input the log has not confirmed yet.
    pub fn placeholder(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            timestamp: Some(Utc::now()),
            body: MessageBody::UserText {
                text: text.to_string(),
            },
            pending: true,
            replaces: None,
        }
    }

    pub fn user_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::UserText { text } => Some(text),
            _ => None,
        }
    }

    pub fn tool_result_id(&self) -> Option<&str> {
        match &self.body {
            MessageBody::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        }
    }

    /// Whether this is a question or plan prompt the log shows as answered.
    pub fn is_answered(&self) -> bool {
        matches!(
            self.body,
            MessageBody::Question { answered: true, .. }
                | MessageBody::PlanApproval { answered: true, .. }
        )
    }
}

/// Derive the semantic messages for one resolved entry.
///
/// `answered` holds tool-use ids the log already has results for; question
/// and plan prompts whose id is in it are marked answered.
pub fn messages_from_entry(entry: &LogEntry, answered: &HashSet<String>) -> Vec<SemanticMessage> {
    if entry.id.is_empty() {
        return Vec::new();
    }

    match &entry.kind {
        EntryKind::Human(HumanContent::Text(text)) => {
            let body = match text {
                HumanText::Plain(text) => MessageBody::UserText { text: text.clone() },
                HumanText::Caveat(text) => MessageBody::Hidden { text: text.clone() },
                HumanText::SlashCommand { name, args } => MessageBody::UserText {
                    text: if args.is_empty() {
                        name.clone()
                    } else {
                        format!("{name} {args}")
                    },
                },
                HumanText::CommandOutput(text) => MessageBody::AgentText { text: text.clone() },
            };
            vec![SemanticMessage::from_entry(entry, entry.id.clone(), body)]
        }
        EntryKind::Human(HumanContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(MessageBody::UserText { text: text.clone() }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(MessageBody::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                }),
                ContentBlock::ToolUse { .. } | ContentBlock::Unknown => None,
            })
            .enumerate()
            .map(|(n, body)| SemanticMessage::from_entry(entry, block_id(&entry.id, n), body))
            .collect(),
        EntryKind::Agent(turn) => {
            let mut bodies = Vec::new();
            for block in &turn.blocks {
                match block {
                    ContentBlock::Text(text) if !text.trim().is_empty() => {
                        bodies.push((None, MessageBody::AgentText { text: text.clone() }));
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        bodies.extend(tool_use_bodies(id, name, input, answered));
                    }
                    _ => {}
                }
            }
            bodies
                .into_iter()
                .enumerate()
                .map(|(n, (id, body))| {
                    let id = id.unwrap_or_else(|| block_id(&entry.id, n));
                    SemanticMessage::from_entry(entry, id, body)
                })
                .collect()
        }
        EntryKind::Summary(text) => vec![SemanticMessage::from_entry(
            entry,
            entry.id.clone(),
            MessageBody::Hidden { text: text.clone() },
        )],
        EntryKind::Other => Vec::new(),
    }
}

fn block_id(entry_id: &str, n: usize) -> String {
    if n == 0 {
        entry_id.to_string()
    } else {
        format!("{entry_id}#{n}")
    }
}

/// Tool invocations become plain tool-use messages except for the two the
/// human must answer, which are expanded into prompt messages.
fn tool_use_bodies(
    id: &str,
    name: &str,
    input: &Value,
    answered: &HashSet<String>,
) -> Vec<(Option<String>, MessageBody)> {
    let is_answered = answered.contains(id);
    match name {
        ASK_USER_QUESTION => {
            let batch = QuestionBatch::deserialize(input).unwrap_or_else(|e| {
                warn!(tool_use_id = id, error = %e, "malformed question payload");
                QuestionBatch {
                    questions: Vec::new(),
                }
            });
            batch
                .questions
                .into_iter()
                .enumerate()
                .map(|(index, question)| {
                    (
                        Some(format!("{id}:{index}")),
                        MessageBody::Question {
                            tool_use_id: id.to_string(),
                            index,
                            question,
                            answered: is_answered,
                        },
                    )
                })
                .collect()
        }
        EXIT_PLAN_MODE => vec![(
            Some(format!("{id}:plan")),
            MessageBody::PlanApproval {
                tool_use_id: id.to_string(),
                plan: input
                    .get("plan")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                answered: is_answered,
            },
        )],
        _ => vec![(
            None,
            MessageBody::ToolUse {
                tool_use_id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            },
        )],
    }
}

/// Collapse superseded versions, keeping first-seen order.
///
/// A later version replaces an earlier one unless the earlier one is already
/// terminal and the later one is not.
pub fn resolve_entries(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut resolved: Vec<LogEntry> = Vec::with_capacity(entries.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        if entry.id.is_empty() {
            resolved.push(entry);
            continue;
        }
        match index.get(&entry.id) {
            Some(&slot) => {
                let existing = &resolved[slot];
                if existing.is_streaming() || !entry.is_streaming() {
                    resolved[slot] = entry;
                }
            }
            None => {
                index.insert(entry.id.clone(), resolved.len());
                resolved.push(entry);
            }
        }
    }
    resolved
}

/// Read and decode every well-formed line of the log, resolving superseded
/// versions. A missing file yields an empty list.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let contents = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read conversation log: {}", path.display()));
        }
    };

    let mut entries = Vec::new();
    for (lineno, line) in contents.split(|b| *b == b'\n').enumerate() {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_line(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                log = %path.display(),
                line = lineno + 1,
                error = %e,
                "skipping malformed log line"
            ),
        }
    }
    Ok(resolve_entries(entries))
}

/// Every message resolvable from the log right now.
pub fn read_all(path: &Path) -> Result<Vec<SemanticMessage>> {
    let entries = read_entries(path)?;
    Ok(messages_from_entries(&entries))
}

pub fn messages_from_entries(entries: &[LogEntry]) -> Vec<SemanticMessage> {
    let answered: HashSet<String> = entries
        .iter()
        .flat_map(|entry| entry.tool_result_ids().map(str::to_string))
        .collect();
    entries
        .iter()
        .flat_map(|entry| messages_from_entry(entry, &answered))
        .collect()
}

/// Id of the latest agent turn if it finished on plain text, i.e. the agent
/// is waiting for the human rather than for a tool.
pub fn ready_turn(entries: &[LogEntry]) -> Option<&str> {
    let last = entries.iter().rev().find(|entry| entry.agent_turn().is_some())?;
    let turn = last.agent_turn()?;
    if !turn.is_terminal() {
        return None;
    }
    match turn.blocks.last() {
        Some(ContentBlock::Text(_)) => Some(last.id.as_str()),
        _ => None,
    }
}
