use serde::{Deserialize, Serialize};

pub const ENTRY_TYPE_USER_MESSAGE: &str = "user_message";
pub const ENTRY_TYPE_AGENT_MESSAGE: &str = "agent_message";
pub const ENTRY_TYPE_AGENT_REASONING: &str = "reasoning";
pub const ENTRY_TYPE_SYSTEM_MESSAGE: &str = "system_message";

/// Lifecycle state of a persisted thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Completed,
    Stopped,
    Failed,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Completed => "completed",
            ThreadStatus::Stopped => "stopped",
            ThreadStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ThreadStatus::Active),
            "completed" => Some(ThreadStatus::Completed),
            "stopped" => Some(ThreadStatus::Stopped),
            "failed" => Some(ThreadStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted conversation unit, bound to one project and one worktree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub project_id: i64,
    pub external_id: Option<String>,
    pub conversation_path: Option<String>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub title: String,
    pub model: String,
    pub sandbox_mode: String,
    pub reasoning_level: String,
    pub status: ThreadStatus,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
    pub last_message_at_unix_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Agent,
    System,
}

impl EntryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryRole::User => "user",
            EntryRole::Agent => "agent",
            EntryRole::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(EntryRole::User),
            "agent" => Some(EntryRole::Agent),
            "system" => Some(EntryRole::System),
            _ => None,
        }
    }
}

/// Append-only transcript row. Immutable once written; ordered by creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: i64,
    pub thread_id: i64,
    pub role: EntryRole,
    pub entry_type: String,
    pub payload: Option<serde_json::Value>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub path: String,
    pub display_name: Option<String>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// One piece of user input: inline text or a local image reference.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSegment {
    Text { text: String },
    Image { image_path: String },
}

/// Stored payload of a `user` conversation entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserEntryPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<InputSegment>,
}

/// Stored payload of a `system` conversation entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemEntryPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tone: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Options cached on the thread and applied to every turn.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadOptions {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub sandbox_mode: String,
    #[serde(default)]
    pub reasoning_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub skip_git_repo_check: bool,
}

/// Options for a single turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// A request to run one agent turn against a new or existing thread.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<InputSegment>,
    #[serde(default)]
    pub thread_options: ThreadOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_options: Option<TurnOptions>,
}

impl SendRequest {
    /// Flattened user-visible text: the trimmed input, or the text segments
    /// joined (image segments rendered as path markers).
    pub fn user_message_text(&self) -> String {
        let trimmed = self.input.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
        let mut parts = Vec::new();
        for segment in &self.segments {
            match segment {
                InputSegment::Text { text } => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_owned());
                    }
                }
                InputSegment::Image { image_path } => {
                    let trimmed = image_path.trim();
                    if !trimmed.is_empty() {
                        parts.push(format!("[image]{trimmed}"));
                    }
                }
            }
        }
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_status_round_trips_through_strings() {
        for status in [
            ThreadStatus::Active,
            ThreadStatus::Completed,
            ThreadStatus::Stopped,
            ThreadStatus::Failed,
        ] {
            assert_eq!(ThreadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ThreadStatus::parse("archived"), None);
    }

    #[test]
    fn user_message_text_prefers_input_over_segments() {
        let req = SendRequest {
            input: "  fix the bug  ".to_owned(),
            segments: vec![InputSegment::Text {
                text: "ignored".to_owned(),
            }],
            ..SendRequest::default()
        };
        assert_eq!(req.user_message_text(), "fix the bug");
    }

    #[test]
    fn user_message_text_renders_image_segments_as_markers() {
        let req = SendRequest {
            segments: vec![
                InputSegment::Text {
                    text: "see screenshot".to_owned(),
                },
                InputSegment::Image {
                    image_path: "/tmp/shot.png".to_owned(),
                },
            ],
            ..SendRequest::default()
        };
        assert_eq!(req.user_message_text(), "see screenshot\n\n[image]/tmp/shot.png");
    }
}
