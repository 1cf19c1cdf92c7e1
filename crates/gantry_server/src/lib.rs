mod api;
mod bus;
mod persistence;
mod pr;
mod reclaim;
mod service;
mod stream;

pub use api::AgentApi;
pub use bus::{file_change_topic, stream_topic, BusMessage, EventBus};
pub use persistence::StreamRecorder;
pub use pr::{build_create_pr_instruction, extract_pr_url, extract_pr_url_from_event};
pub use service::{AgentService, CancelOutcome};
pub use stream::{StreamError, StreamHandle};
