//! Message data model for context management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique message identifier, stable across serialize/restore
pub type MessageId = Uuid;

/// Conversational role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// Retention weight for a message
///
/// `System` is reserved for the system role; `Critical` is the ceiling
/// reachable by boosted non-system content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessagePriority {
    Ephemeral = 0,
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
    System = 200,
}

impl MessagePriority {
    /// Numeric score of this priority level
    pub fn score(&self) -> u32 {
        *self as u32
    }

    /// Snap a numeric score to the highest non-system level at or below it.
    ///
    /// Never returns `System`; that level is assigned only to system-role
    /// messages, preserving their absolute precedence.
    pub fn from_score(score: u32) -> Self {
        if score >= 100 {
            MessagePriority::Critical
        } else if score >= 75 {
            MessagePriority::High
        } else if score >= 50 {
            MessagePriority::Normal
        } else if score >= 25 {
            MessagePriority::Low
        } else {
            MessagePriority::Ephemeral
        }
    }
}

/// Image payload reference inside a content block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64-encoded payload
    Base64 { media_type: String, data: String },
    /// External reference; payload size unknown
    Url { url: String },
}

/// Recorded result of a tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_use_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// One block of structured message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
    ToolResult { result: ToolResultRecord },
}

/// Message content: plain text or an ordered block sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of all textual parts, tool results included
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::ToolResult { result } => Some(result.content.clone()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// A single message owned by exactly one memory tier at a time
///
/// Tier membership changes by move (remove + insert), never duplication.
/// Once `tokens` is set it is authoritative and never silently recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    /// Lazily computed token count; authoritative once cached
    pub tokens: Option<usize>,
    pub priority: MessagePriority,
    pub compressible: bool,
    /// Ids of the messages this one replaced as a summary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summarized_from: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ContextMessage {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        let priority = if role == MessageRole::System {
            MessagePriority::System
        } else {
            MessagePriority::Normal
        };
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tokens: None,
            priority,
            compressible: role != MessageRole::System,
            summarized_from: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Build a tool message wrapping a tool result record.
    ///
    /// The tool name is recorded under the `tool_name` metadata key so
    /// tool-aware compression can dispatch on it later.
    pub fn tool_result(result: ToolResultRecord) -> Self {
        let name = result.name.clone();
        let mut msg = Self::new(
            MessageRole::Tool,
            MessageContent::Blocks(vec![ContentBlock::ToolResult { result }]),
        );
        msg.metadata.insert("tool_name".to_string(), name);
        msg
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Cached token count, or 0 when not yet computed
    pub fn cached_tokens(&self) -> usize {
        self.tokens.unwrap_or(0)
    }

    /// Recorded tool name, present only for tool-result messages
    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get("tool_name").map(String::as_str)
    }
}
