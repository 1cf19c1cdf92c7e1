//! Declarative agent registry configuration.
//!
//! `agents.json` lists the backends available to the orchestrator:
//!
//! ```json
//! { "agents": [
//!   { "id": "codex", "backend": "codex", "model": "gpt-5.1-codex" },
//!   { "id": "mycli", "backend": "cli", "cmd": "my-agent", "args": ["--json"],
//!     "env": { "MY_TOKEN": "$MY_TOKEN" } }
//! ] }
//! ```
//!
//! A missing or malformed file yields an empty registry rather than a
//! startup failure.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::adapters::{CliAdapter, CodexAdapter};
use crate::connector::AgentAdapter;
use gantry_domain::CapabilitySet;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cli,
    Codex,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentsFile {
    #[serde(default)]
    agents: Vec<AgentEntry>,
}

/// Reads agent entries from disk. Entries without an id are dropped.
pub fn load_agent_entries(path: &Path) -> Vec<AgentEntry> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "failed to read agents config");
            return Vec::new();
        }
    };
    let parsed: AgentsFile = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "malformed agents config");
            return Vec::new();
        }
    };
    let mut entries: Vec<AgentEntry> = parsed
        .agents
        .into_iter()
        .filter(|entry| !entry.id.trim().is_empty())
        .map(|mut entry| {
            for value in entry.env.values_mut() {
                *value = expand_env(value);
            }
            entry
        })
        .collect();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    entries
}

/// Builds the adapter described by one registry entry.
pub fn build_adapter(entry: &AgentEntry) -> Arc<dyn AgentAdapter> {
    match entry.backend {
        BackendKind::Cli => Arc::new(CliAdapter {
            identifier: entry.id.clone(),
            cmd: entry.cmd.clone(),
            args: entry.args.clone(),
            env: entry.env.clone(),
            base_capabilities: CapabilitySet::new(),
        }),
        BackendKind::Codex => Arc::new(CodexAdapter::from_env().with_model(entry.model.clone())),
    }
}

/// Expands `$VAR` and `${VAR}` references against the process environment.
/// Unset variables expand to the empty string.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            let _ = chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next == '_' || next.is_ascii_alphanumeric() {
                name.push(next);
                let _ = chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            let _ = chars.next();
        }
        if name.is_empty() {
            out.push('$');
            if braced {
                out.push('{');
            }
            continue;
        }
        if let Ok(resolved) = std::env::var(&name) {
            out.push_str(&resolved);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_returns_empty_for_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(load_agent_entries(&tmp.path().join("agents.json")).is_empty());
    }

    #[test]
    fn load_returns_empty_for_malformed_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agents.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(load_agent_entries(&path).is_empty());
    }

    #[test]
    fn load_sorts_entries_and_drops_blank_ids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("agents.json");
        std::fs::write(
            &path,
            r#"{"agents":[
                {"id":"zeta","backend":"cli","cmd":"zeta-agent"},
                {"id":"","backend":"cli","cmd":"ignored"},
                {"id":"codex","backend":"codex","model":"gpt-5.1-codex"}
            ]}"#,
        )
        .expect("write");
        let entries = load_agent_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "codex");
        assert_eq!(entries[1].id, "zeta");
        assert_eq!(entries[0].backend, BackendKind::Codex);
    }

    #[test]
    fn expand_env_resolves_plain_and_braced_names() {
        // Unique name to avoid clashing with the ambient environment.
        unsafe {
            std::env::set_var("GANTRY_REGISTRY_TEST_VAR", "token123");
        }
        assert_eq!(expand_env("$GANTRY_REGISTRY_TEST_VAR"), "token123");
        assert_eq!(expand_env("x-${GANTRY_REGISTRY_TEST_VAR}-y"), "x-token123-y");
        assert_eq!(expand_env("no refs"), "no refs");
        assert_eq!(expand_env("$GANTRY_REGISTRY_TEST_UNSET"), "");
        unsafe {
            std::env::remove_var("GANTRY_REGISTRY_TEST_VAR");
        }
    }

    #[test]
    fn build_adapter_uses_entry_identity() {
        let entry = AgentEntry {
            id: "mycli".to_owned(),
            name: String::new(),
            backend: BackendKind::Cli,
            cmd: "my-agent".to_owned(),
            args: vec!["--json".to_owned()],
            env: HashMap::new(),
            model: None,
        };
        let adapter = build_adapter(&entry);
        assert_eq!(adapter.id(), "mycli");
    }
}
