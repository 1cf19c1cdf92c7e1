mod events;
pub use events::{
    AgentEvent, AgentItem, ChangeKind, EventError, EventKind, FileChange, ItemStatus, TodoItem,
    TokenUsage,
};

mod prompt;
pub use prompt::{
    Capability, CapabilitySet, Prompt, PromptAuthor, PromptSegment, SegmentKind,
};

mod thread;
pub use thread::{
    ConversationEntry, EntryRole, InputSegment, Project, SendRequest, SystemEntryPayload, Thread,
    ThreadOptions, ThreadStatus, TurnOptions, UserEntryPayload, ENTRY_TYPE_AGENT_MESSAGE,
    ENTRY_TYPE_AGENT_REASONING, ENTRY_TYPE_SYSTEM_MESSAGE, ENTRY_TYPE_USER_MESSAGE,
};

pub mod naming;
pub use naming::{
    branch_for_thread, derive_thread_title, fallback_branch_for_thread, parse_thread_id_from_dir,
    sanitize_slug, worktree_dir_suffix, THREAD_TITLE_MAX_WORDS, UNTITLED_THREAD_TITLE,
};

pub mod paths;
pub mod time;
