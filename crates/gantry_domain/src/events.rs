//! Canonical event vocabulary shared by all agent backends.
//!
//! Adapters normalize whatever their backend emits into [`AgentEvent`];
//! everything downstream (persistence, the stream pipeline, the observer
//! bus) consumes only this shape.

use serde::{Deserialize, Serialize};

/// Token accounting reported by a backend for one turn.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

/// Error detail attached to failure events.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl EventError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Failed,
}

impl Default for ItemStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Delete,
    Update,
}

/// One file touched by an agent patch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub completed: bool,
}

/// Closed union of agent item payloads. Each variant carries its own
/// backend-assigned identifier; an empty id marks a synthetic item that is
/// exempt from idempotent-write suppression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentItem {
    #[serde(rename = "agent_message")]
    AgentMessage { id: String, text: String },
    #[serde(rename = "reasoning")]
    Reasoning { id: String, text: String },
    #[serde(rename = "command_execution")]
    CommandRun {
        id: String,
        #[serde(default)]
        command: String,
        #[serde(default)]
        aggregated_output: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        status: ItemStatus,
    },
    #[serde(rename = "file_change")]
    DiffChunk {
        id: String,
        #[serde(default)]
        changes: Vec<FileChange>,
        #[serde(default)]
        status: ItemStatus,
    },
    #[serde(rename = "mcp_tool_call")]
    ToolCall {
        id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        tool: String,
        #[serde(default)]
        status: ItemStatus,
    },
    #[serde(rename = "web_search")]
    WebSearch {
        id: String,
        #[serde(default)]
        query: String,
    },
    #[serde(rename = "todo_list")]
    TodoList { id: String, items: Vec<TodoItem> },
    #[serde(rename = "error")]
    Error { id: String, message: String },
}

impl AgentItem {
    pub fn id(&self) -> &str {
        match self {
            AgentItem::AgentMessage { id, .. }
            | AgentItem::Reasoning { id, .. }
            | AgentItem::CommandRun { id, .. }
            | AgentItem::DiffChunk { id, .. }
            | AgentItem::ToolCall { id, .. }
            | AgentItem::WebSearch { id, .. }
            | AgentItem::TodoList { id, .. }
            | AgentItem::Error { id, .. } => id,
        }
    }

    /// Replaces the backend-assigned identifier, keeping the payload intact.
    pub fn with_id(mut self, new_id: String) -> Self {
        match &mut self {
            AgentItem::AgentMessage { id, .. }
            | AgentItem::Reasoning { id, .. }
            | AgentItem::CommandRun { id, .. }
            | AgentItem::DiffChunk { id, .. }
            | AgentItem::ToolCall { id, .. }
            | AgentItem::WebSearch { id, .. }
            | AgentItem::TodoList { id, .. }
            | AgentItem::Error { id, .. } => *id = new_id,
        }
        self
    }

    /// Conversation entry type for persisted agent items. Matches the serde
    /// tag so stored payloads stay self-describing.
    pub fn entry_kind(&self) -> &'static str {
        match self {
            AgentItem::AgentMessage { .. } => "agent_message",
            AgentItem::Reasoning { .. } => "reasoning",
            AgentItem::CommandRun { .. } => "command_execution",
            AgentItem::DiffChunk { .. } => "file_change",
            AgentItem::ToolCall { .. } => "mcp_tool_call",
            AgentItem::WebSearch { .. } => "web_search",
            AgentItem::TodoList { .. } => "todo_list",
            AgentItem::Error { .. } => "error",
        }
    }
}

/// Event type. Known kinds form a closed set; anything else is carried
/// verbatim in `Other` so new backend event kinds survive normalization.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    SessionStarted,
    SessionError,
    TurnStarted,
    TurnCompleted,
    TurnFailed,
    ItemStarted,
    ItemUpdated,
    ItemCompleted,
    PlanUpdated,
    ToolStarted,
    ToolCompleted,
    DiffSummary,
    UsageUpdated,
    Custom,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SessionStarted => "session.started",
            EventKind::SessionError => "session.error",
            EventKind::TurnStarted => "turn.started",
            EventKind::TurnCompleted => "turn.completed",
            EventKind::TurnFailed => "turn.failed",
            EventKind::ItemStarted => "item.started",
            EventKind::ItemUpdated => "item.updated",
            EventKind::ItemCompleted => "item.completed",
            EventKind::PlanUpdated => "plan.updated",
            EventKind::ToolStarted => "tool.started",
            EventKind::ToolCompleted => "tool.completed",
            EventKind::DiffSummary => "diff.summary",
            EventKind::UsageUpdated => "usage.updated",
            EventKind::Custom => "custom",
            EventKind::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "session.started" => EventKind::SessionStarted,
            "session.error" => EventKind::SessionError,
            "turn.started" => EventKind::TurnStarted,
            "turn.completed" => EventKind::TurnCompleted,
            "turn.failed" => EventKind::TurnFailed,
            "item.started" => EventKind::ItemStarted,
            "item.updated" => EventKind::ItemUpdated,
            "item.completed" => EventKind::ItemCompleted,
            "plan.updated" => EventKind::PlanUpdated,
            "tool.started" => EventKind::ToolStarted,
            "tool.completed" => EventKind::ToolCompleted,
            "diff.summary" => EventKind::DiffSummary,
            "usage.updated" => EventKind::UsageUpdated,
            "custom" => EventKind::Custom,
            other => EventKind::Other(other.to_owned()),
        }
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        EventKind::parse(&raw)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// One normalized emission from an agent session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<AgentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub at_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AgentEvent {
    pub fn of_kind(kind: EventKind) -> Self {
        Self {
            kind,
            thread_id: None,
            prompt_id: None,
            item: None,
            usage: None,
            error: None,
            message: None,
            at_unix_ms: crate::time::now_unix_millis(),
            metadata: None,
        }
    }

    pub fn item_event(kind: EventKind, item: AgentItem) -> Self {
        let mut event = Self::of_kind(kind);
        event.item = Some(item);
        event
    }

    pub fn error_event(kind: EventKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut event = Self::of_kind(kind);
        event.error = Some(EventError::new(message.clone()));
        event.message = Some(message);
        event
    }
}
