//! Line decoding for the agent's structured conversation log.
//!
//! Each line is one JSON record. Decoding goes through tagged serde variants
//! so every record and content-block shape is enumerable; anything the agent
//! writes that we do not model lands in an explicit `Other`/`Unknown` variant
//! instead of being sniffed out of raw strings.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// One resolved physical record from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: EntryKind,
}

/// Entry kinds the engine distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// Human turn: free text or a list of blocks (tool results arrive here).
    Human(HumanContent),
    /// Agent turn, possibly still streaming.
    Agent(AgentTurn),
    /// Conversation summary line.
    Summary(String),
    /// Bookkeeping records (snapshots, system notes) with no rendering.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HumanContent {
    Text(HumanText),
    Blocks(Vec<ContentBlock>),
}

/// Classification of human-turn string content.
#[derive(Debug, Clone, PartialEq)]
pub enum HumanText {
    /// Ordinary typed input.
    Plain(String),
    /// `<local-command-caveat>` preamble the agent injects around local commands.
    Caveat(String),
    /// `<command-name>` wrapper recorded for slash commands.
    SlashCommand { name: String, args: String },
    /// `<local-command-stdout>` wrapper carrying the output of a local command.
    CommandOutput(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    /// Content blocks with thinking blocks already removed.
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl AgentTurn {
    /// A turn carrying a stop reason is finished and will not be rewritten.
    pub fn is_terminal(&self) -> bool {
        self.stop_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Unknown,
}

impl LogEntry {
    pub fn agent_turn(&self) -> Option<&AgentTurn> {
        match &self.kind {
            EntryKind::Agent(turn) => Some(turn),
            _ => None,
        }
    }

    /// True for agent turns that may still be superseded by a later version.
    pub fn is_streaming(&self) -> bool {
        self.agent_turn().is_some_and(|turn| !turn.is_terminal())
    }

    /// Tool-use ids this entry reports results for.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        let blocks: &[ContentBlock] = match &self.kind {
            EntryKind::Human(HumanContent::Blocks(blocks)) => blocks,
            _ => &[],
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, rename = "parentUuid")]
    parent_uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(flatten)]
    body: RawBody,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawBody {
    User {
        message: RawMessage,
    },
    Assistant {
        message: RawMessage,
    },
    Summary {
        #[serde(default)]
        summary: String,
        #[serde(default, rename = "leafUuid")]
        leaf_uuid: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawMessage {
    content: RawContent,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking,
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Decode a single log line.
///
/// Records without any identifier (neither `uuid` nor a summary leaf) are
/// still decoded; their id is empty and callers treat them as `Other`.
pub fn decode_line(line: &str) -> Result<LogEntry, serde_json::Error> {
    let raw: RawRecord = serde_json::from_str(line)?;
    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    let (id, kind) = match raw.body {
        RawBody::User { message } => {
            let content = match message.content {
                RawContent::Text(text) => HumanContent::Text(classify_human_text(&text)),
                RawContent::Blocks(blocks) => HumanContent::Blocks(convert_blocks(blocks)),
            };
            (raw.uuid.unwrap_or_default(), EntryKind::Human(content))
        }
        RawBody::Assistant { message } => {
            let blocks = match message.content {
                RawContent::Text(text) => vec![ContentBlock::Text(text)],
                RawContent::Blocks(blocks) => convert_blocks(blocks),
            };
            (
                raw.uuid.unwrap_or_default(),
                EntryKind::Agent(AgentTurn {
                    blocks,
                    stop_reason: message.stop_reason,
                }),
            )
        }
        RawBody::Summary { summary, leaf_uuid } => {
            let id = raw
                .uuid
                .or(leaf_uuid.map(|leaf| format!("summary:{leaf}")))
                .unwrap_or_default();
            (id, EntryKind::Summary(summary))
        }
        RawBody::Other => (raw.uuid.unwrap_or_default(), EntryKind::Other),
    };

    Ok(LogEntry {
        id,
        parent_id: raw.parent_uuid,
        timestamp,
        kind,
    })
}

fn convert_blocks(blocks: Vec<RawBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter_map(|block| match block {
            RawBlock::Text { text } => Some(ContentBlock::Text(text)),
            // Thinking payloads are opaque signatures; nothing to render.
            RawBlock::Thinking => None,
            RawBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse { id, name, input }),
            RawBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ContentBlock::ToolResult {
                tool_use_id,
                content: flatten_tool_result(&content),
                is_error: is_error.unwrap_or(false),
            }),
            RawBlock::Unknown => Some(ContentBlock::Unknown),
        })
        .collect()
}

/// Tool results are either a bare string or a list of `{type: text}` parts.
fn flatten_tool_result(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

const CAVEAT_TAG: &str = "<local-command-caveat>";
const COMMAND_NAME_TAG: &str = "<command-name>";
const STDOUT_TAG: &str = "<local-command-stdout>";

static COMMAND_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<command-name>(.*?)</command-name>").expect("command-name pattern is valid")
});
static COMMAND_ARGS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<command-args>(.*?)</command-args>").expect("command-args pattern is valid")
});
static WRAPPER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?local-command-(?:caveat|stdout)>").expect("wrapper tag pattern is valid")
});

/// Classify human-turn string content by its leading wrapper tag.
pub fn classify_human_text(text: &str) -> HumanText {
    let trimmed = text.trim_start();
    if trimmed.starts_with(CAVEAT_TAG) {
        HumanText::Caveat(strip_wrapper(trimmed))
    } else if trimmed.starts_with(COMMAND_NAME_TAG) {
        let capture = |re: &Regex| {
            re.captures(trimmed)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        };
        HumanText::SlashCommand {
            name: capture(&COMMAND_NAME_RE),
            args: capture(&COMMAND_ARGS_RE),
        }
    } else if trimmed.starts_with(STDOUT_TAG) {
        HumanText::CommandOutput(strip_wrapper(trimmed))
    } else {
        HumanText::Plain(text.to_string())
    }
}

fn strip_wrapper(text: &str) -> String {
    WRAPPER_TAG_RE.replace_all(text, "").trim().to_string()
}
