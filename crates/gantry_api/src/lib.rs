//! External (wire) shapes for agent streaming and thread data, plus the
//! lossless mapping between those shapes and the canonical event taxonomy.
//!
//! Older adapters and the observer sink speak this flat camelCase format;
//! everything inside the orchestrator speaks `gantry_domain`. Conversions
//! here must not drop information: unknown event type strings pass through
//! verbatim in both directions, and every payload variant round-trips.

use gantry_domain::{
    AgentEvent, AgentItem, ChangeKind, ConversationEntry, EntryRole, EventError, EventKind,
    FileChange, InputSegment, ItemStatus, SystemEntryPayload, Thread, TodoItem, TokenUsage,
    UserEntryPayload,
};
use serde::{Deserialize, Serialize};

pub const WIRE_TYPE_STREAM_COMPLETE: &str = "stream.complete";
pub const WIRE_TYPE_STREAM_ERROR: &str = "stream.error";

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCommand {
    pub command: String,
    pub aggregated_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub status: ItemStatus,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFileDiff {
    pub path: String,
    pub kind: ChangeKind,
    pub status: ItemStatus,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireToolCall {
    pub server: String,
    pub tool: String,
    pub status: ItemStatus,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireWebSearch {
    pub query: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTodoItem {
    pub text: String,
    pub completed: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTodoList {
    pub items: Vec<WireTodoItem>,
}

/// Flat item shape used on the wire. Exactly one payload family is set for
/// items produced by [`item_to_wire`]; parsing inspects them in a fixed
/// order so hand-built items still resolve deterministically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireItem {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<WireCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_diffs: Vec<WireFileDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<WireWebSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_list: Option<WireTodoList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// One streamed event on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<WireItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub at_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Canonical kind → wire type string. The wire keeps the older spellings
/// for session lifecycle events.
pub fn kind_to_wire(kind: &EventKind) -> String {
    match kind {
        EventKind::SessionStarted => "thread.started".to_owned(),
        EventKind::SessionError => "error".to_owned(),
        other => other.as_str().to_owned(),
    }
}

/// Wire type string → canonical kind. Unrecognized strings survive as
/// [`EventKind::Other`].
pub fn kind_from_wire(raw: &str) -> EventKind {
    match raw {
        "thread.started" => EventKind::SessionStarted,
        "error" => EventKind::SessionError,
        other => EventKind::parse(other),
    }
}

pub fn usage_to_wire(usage: &TokenUsage) -> WireUsage {
    WireUsage {
        input_tokens: usage.input_tokens,
        cached_input_tokens: usage.cached_input_tokens,
        output_tokens: usage.output_tokens,
    }
}

pub fn usage_from_wire(usage: &WireUsage) -> TokenUsage {
    TokenUsage {
        input_tokens: usage.input_tokens,
        cached_input_tokens: usage.cached_input_tokens,
        output_tokens: usage.output_tokens,
    }
}

fn error_to_wire(error: &EventError) -> WireError {
    WireError {
        message: error.message.clone(),
        code: error.code.clone(),
    }
}

fn error_from_wire(error: &WireError) -> EventError {
    EventError {
        message: error.message.clone(),
        code: error.code.clone(),
    }
}

pub fn item_to_wire(item: &AgentItem) -> WireItem {
    match item {
        AgentItem::AgentMessage { id, text } => WireItem {
            id: id.clone(),
            item_type: "message".to_owned(),
            text: text.clone(),
            ..WireItem::default()
        },
        AgentItem::Reasoning { id, text } => WireItem {
            id: id.clone(),
            item_type: "reasoning".to_owned(),
            reasoning: text.clone(),
            ..WireItem::default()
        },
        AgentItem::CommandRun {
            id,
            command,
            aggregated_output,
            exit_code,
            status,
        } => WireItem {
            id: id.clone(),
            item_type: "command".to_owned(),
            command: Some(WireCommand {
                command: command.clone(),
                aggregated_output: aggregated_output.clone(),
                exit_code: *exit_code,
                status: *status,
            }),
            ..WireItem::default()
        },
        AgentItem::DiffChunk {
            id,
            changes,
            status,
        } => WireItem {
            id: id.clone(),
            item_type: "diff".to_owned(),
            file_diffs: changes
                .iter()
                .map(|change| WireFileDiff {
                    path: change.path.clone(),
                    kind: change.kind,
                    status: *status,
                })
                .collect(),
            status: Some(*status),
            ..WireItem::default()
        },
        AgentItem::ToolCall {
            id,
            server,
            tool,
            status,
        } => WireItem {
            id: id.clone(),
            item_type: "tool".to_owned(),
            tool_call: Some(WireToolCall {
                server: server.clone(),
                tool: tool.clone(),
                status: *status,
            }),
            ..WireItem::default()
        },
        AgentItem::WebSearch { id, query } => WireItem {
            id: id.clone(),
            item_type: "web_search".to_owned(),
            web_search: Some(WireWebSearch {
                query: query.clone(),
            }),
            ..WireItem::default()
        },
        AgentItem::TodoList { id, items } => WireItem {
            id: id.clone(),
            item_type: "todo_list".to_owned(),
            todo_list: Some(WireTodoList {
                items: items
                    .iter()
                    .map(|item| WireTodoItem {
                        text: item.text.clone(),
                        completed: item.completed,
                    })
                    .collect(),
            }),
            ..WireItem::default()
        },
        AgentItem::Error { id, message } => WireItem {
            id: id.clone(),
            item_type: "error".to_owned(),
            error: Some(WireError {
                message: message.clone(),
                code: None,
            }),
            ..WireItem::default()
        },
    }
}

pub fn item_from_wire(item: &WireItem) -> AgentItem {
    if let Some(command) = &item.command {
        return AgentItem::CommandRun {
            id: item.id.clone(),
            command: command.command.clone(),
            aggregated_output: command.aggregated_output.clone(),
            exit_code: command.exit_code,
            status: command.status,
        };
    }
    if !item.file_diffs.is_empty() || item.status.is_some() {
        let status = item
            .status
            .or_else(|| item.file_diffs.first().map(|diff| diff.status))
            .unwrap_or_default();
        return AgentItem::DiffChunk {
            id: item.id.clone(),
            changes: item
                .file_diffs
                .iter()
                .map(|diff| FileChange {
                    path: diff.path.clone(),
                    kind: diff.kind,
                })
                .collect(),
            status,
        };
    }
    if let Some(tool_call) = &item.tool_call {
        return AgentItem::ToolCall {
            id: item.id.clone(),
            server: tool_call.server.clone(),
            tool: tool_call.tool.clone(),
            status: tool_call.status,
        };
    }
    if let Some(web_search) = &item.web_search {
        return AgentItem::WebSearch {
            id: item.id.clone(),
            query: web_search.query.clone(),
        };
    }
    if let Some(todo_list) = &item.todo_list {
        return AgentItem::TodoList {
            id: item.id.clone(),
            items: todo_list
                .items
                .iter()
                .map(|item| TodoItem {
                    text: item.text.clone(),
                    completed: item.completed,
                })
                .collect(),
        };
    }
    if let Some(error) = &item.error {
        return AgentItem::Error {
            id: item.id.clone(),
            message: error.message.clone(),
        };
    }
    if !item.reasoning.is_empty() && item.text.is_empty() {
        return AgentItem::Reasoning {
            id: item.id.clone(),
            text: item.reasoning.clone(),
        };
    }
    AgentItem::AgentMessage {
        id: item.id.clone(),
        text: item.text.clone(),
    }
}

pub fn event_to_wire(event: &AgentEvent) -> WireEvent {
    WireEvent {
        event_type: kind_to_wire(&event.kind),
        thread_id: event.thread_id.clone(),
        prompt_id: event.prompt_id.clone(),
        item: event.item.as_ref().map(item_to_wire),
        usage: event.usage.as_ref().map(usage_to_wire),
        error: event.error.as_ref().map(error_to_wire),
        message: event.message.clone(),
        at_unix_ms: event.at_unix_ms,
        meta: event.metadata.clone(),
    }
}

pub fn event_from_wire(event: &WireEvent) -> AgentEvent {
    AgentEvent {
        kind: kind_from_wire(&event.event_type),
        thread_id: event.thread_id.clone(),
        prompt_id: event.prompt_id.clone(),
        item: event.item.as_ref().map(item_from_wire),
        usage: event.usage.as_ref().map(usage_from_wire),
        error: event.error.as_ref().map(error_from_wire),
        message: event.message.clone(),
        at_unix_ms: event.at_unix_ms,
        metadata: event.meta.clone(),
    }
}

/// Synthetic terminal event published to the observer sink after a stream's
/// wait resolves.
pub fn stream_outcome_event(error_message: Option<String>, status: Option<&str>) -> WireEvent {
    match error_message {
        Some(message) => WireEvent {
            event_type: WIRE_TYPE_STREAM_ERROR.to_owned(),
            error: Some(WireError {
                message,
                code: None,
            }),
            at_unix_ms: gantry_domain::time::now_unix_millis(),
            ..WireEvent::default()
        },
        None => WireEvent {
            event_type: WIRE_TYPE_STREAM_COMPLETE.to_owned(),
            message: status.map(str::to_owned),
            at_unix_ms: gantry_domain::time::now_unix_millis(),
            ..WireEvent::default()
        },
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummaryDto {
    pub added: i64,
    pub removed: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiffStatDto {
    pub path: String,
    pub added: i64,
    pub removed: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDto {
    pub id: i64,
    pub project_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub title: String,
    pub model: String,
    pub sandbox_mode: String,
    pub reasoning_level: String,
    pub status: String,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at_unix_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<DiffSummaryDto>,
}

pub fn thread_to_dto(thread: &Thread, diff_summary: Option<DiffSummaryDto>) -> ThreadDto {
    ThreadDto {
        id: thread.id,
        project_id: thread.project_id,
        external_id: thread.external_id.clone(),
        worktree_path: thread.worktree_path.clone(),
        branch_name: thread.branch_name.clone(),
        pr_url: thread.pr_url.clone(),
        title: thread.title.clone(),
        model: thread.model.clone(),
        sandbox_mode: thread.sandbox_mode.clone(),
        reasoning_level: thread.reasoning_level.clone(),
        status: thread.status.as_str().to_owned(),
        created_at_unix_ms: thread.created_at_unix_ms,
        updated_at_unix_ms: thread.updated_at_unix_ms,
        last_message_at_unix_ms: thread.last_message_at_unix_ms,
        diff_summary,
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSegmentDto {
    Text { text: String },
    Image { image_path: String },
}

fn segment_to_dto(segment: &InputSegment) -> InputSegmentDto {
    match segment {
        InputSegment::Text { text } => InputSegmentDto::Text { text: text.clone() },
        InputSegment::Image { image_path } => InputSegmentDto::Image {
            image_path: image_path.clone(),
        },
    }
}

/// One transcript entry shaped for an external timeline consumer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntryDto {
    pub id: String,
    pub role: String,
    pub created_at_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_unix_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<InputSegmentDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<WireItem>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

pub fn entry_to_dto(entry: &ConversationEntry) -> ConversationEntryDto {
    let mut dto = ConversationEntryDto {
        id: format!("entry-{}", entry.id),
        role: entry.role.as_str().to_owned(),
        created_at_unix_ms: entry.created_at_unix_ms,
        updated_at_unix_ms: Some(entry.updated_at_unix_ms),
        ..ConversationEntryDto::default()
    };

    match entry.role {
        EntryRole::User => {
            if let Some(payload) = &entry.payload
                && let Ok(payload) = serde_json::from_value::<UserEntryPayload>(payload.clone())
            {
                dto.text = payload.text;
                dto.segments = payload.segments.iter().map(segment_to_dto).collect();
            }
        }
        EntryRole::Agent => {
            let item = entry
                .payload
                .as_ref()
                .and_then(|payload| serde_json::from_value::<AgentItem>(payload.clone()).ok());
            match item {
                Some(item) => {
                    let mut wire = item_to_wire(&item);
                    if wire.id.is_empty() {
                        wire.id = dto.id.clone();
                    }
                    dto.item = Some(wire);
                }
                None => {
                    dto.item = Some(WireItem {
                        id: dto.id.clone(),
                        item_type: entry.entry_type.clone(),
                        ..WireItem::default()
                    });
                }
            }
        }
        EntryRole::System => {
            if let Some(payload) = &entry.payload
                && let Ok(payload) = serde_json::from_value::<SystemEntryPayload>(payload.clone())
            {
                dto.tone = payload.tone;
                dto.message = payload.message;
                dto.meta = payload.meta;
            }
        }
    }

    dto
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartedDto {
    pub stream_id: String,
    pub thread_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_external_id: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelDto {
    pub thread_id: i64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_domain::EventKind;

    fn sample_items() -> Vec<AgentItem> {
        vec![
            AgentItem::AgentMessage {
                id: "m1".to_owned(),
                text: "all done".to_owned(),
            },
            AgentItem::Reasoning {
                id: "r1".to_owned(),
                text: "thinking about it".to_owned(),
            },
            AgentItem::CommandRun {
                id: "c1".to_owned(),
                command: "cargo test".to_owned(),
                aggregated_output: "ok".to_owned(),
                exit_code: Some(0),
                status: ItemStatus::Completed,
            },
            AgentItem::DiffChunk {
                id: "d1".to_owned(),
                changes: vec![FileChange {
                    path: "src/lib.rs".to_owned(),
                    kind: ChangeKind::Update,
                }],
                status: ItemStatus::Completed,
            },
            AgentItem::DiffChunk {
                id: "d2".to_owned(),
                changes: Vec::new(),
                status: ItemStatus::Failed,
            },
            AgentItem::ToolCall {
                id: "t1".to_owned(),
                server: "docs".to_owned(),
                tool: "lookup".to_owned(),
                status: ItemStatus::InProgress,
            },
            AgentItem::WebSearch {
                id: "w1".to_owned(),
                query: "tokio select".to_owned(),
            },
            AgentItem::TodoList {
                id: "todo1".to_owned(),
                items: vec![TodoItem {
                    text: "write tests".to_owned(),
                    completed: false,
                }],
            },
            AgentItem::Error {
                id: "e1".to_owned(),
                message: "boom".to_owned(),
            },
        ]
    }

    #[test]
    fn every_item_variant_round_trips_through_the_wire() {
        for item in sample_items() {
            let wire = item_to_wire(&item);
            let back = item_from_wire(&wire);
            assert_eq!(back, item, "round trip failed for {wire:?}");
        }
    }

    #[test]
    fn events_round_trip_with_type_message_and_payload_intact() {
        for item in sample_items() {
            let mut event = AgentEvent::item_event(EventKind::ItemCompleted, item);
            event.thread_id = Some("thr_1".to_owned());
            event.message = Some("note".to_owned());
            let back = event_from_wire(&event_to_wire(&event));
            assert_eq!(back, event);
        }
    }

    #[test]
    fn session_lifecycle_kinds_use_legacy_wire_spellings() {
        assert_eq!(kind_to_wire(&EventKind::SessionStarted), "thread.started");
        assert_eq!(kind_to_wire(&EventKind::SessionError), "error");
        assert_eq!(kind_from_wire("thread.started"), EventKind::SessionStarted);
        assert_eq!(kind_from_wire("error"), EventKind::SessionError);
    }

    #[test]
    fn unknown_event_types_pass_through_both_directions() {
        let kind = kind_from_wire("backend.heartbeat");
        assert_eq!(kind, EventKind::Other("backend.heartbeat".to_owned()));
        assert_eq!(kind_to_wire(&kind), "backend.heartbeat");
    }

    #[test]
    fn usage_and_error_fields_survive_round_trips() {
        let mut event = AgentEvent::of_kind(EventKind::TurnCompleted);
        event.usage = Some(TokenUsage {
            input_tokens: 12,
            cached_input_tokens: 3,
            output_tokens: 40,
        });
        event.error = Some(EventError::new("partial failure"));
        let back = event_from_wire(&event_to_wire(&event));
        assert_eq!(back, event);
    }

    #[test]
    fn entry_to_dto_decodes_user_payloads() {
        let entry = ConversationEntry {
            id: 9,
            thread_id: 1,
            role: EntryRole::User,
            entry_type: "user_message".to_owned(),
            payload: serde_json::to_value(UserEntryPayload {
                text: "hello".to_owned(),
                segments: vec![InputSegment::Image {
                    image_path: "/tmp/p.png".to_owned(),
                }],
            })
            .ok(),
            created_at_unix_ms: 1,
            updated_at_unix_ms: 1,
        };
        let dto = entry_to_dto(&entry);
        assert_eq!(dto.id, "entry-9");
        assert_eq!(dto.text, "hello");
        assert_eq!(dto.segments.len(), 1);
    }

    #[test]
    fn entry_to_dto_falls_back_to_entry_type_for_bare_agent_rows() {
        let entry = ConversationEntry {
            id: 4,
            thread_id: 1,
            role: EntryRole::Agent,
            entry_type: "web_search".to_owned(),
            payload: None,
            created_at_unix_ms: 1,
            updated_at_unix_ms: 1,
        };
        let dto = entry_to_dto(&entry);
        let item = dto.item.expect("agent entries always carry an item");
        assert_eq!(item.item_type, "web_search");
        assert_eq!(item.id, "entry-4");
    }
}
