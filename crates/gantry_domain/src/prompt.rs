use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptAuthor {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Text,
    Code,
    Markdown,
    ImageLocal,
    AttachmentRef,
}

/// One structured portion of a prompt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PromptSegment {
    pub kind: SegmentKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl PromptSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Text,
            text: text.into(),
            path: None,
            lang: None,
        }
    }

    pub fn local_image(path: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::ImageLocal,
            text: String::new(),
            path: Some(path.into()),
            lang: None,
        }
    }
}

/// The logical payload submitted to a session for one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub author: PromptAuthor,
    pub segments: Vec<PromptSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Prompt {
    pub fn user(segments: Vec<PromptSegment>) -> Self {
        Self {
            author: PromptAuthor::User,
            segments,
            metadata: None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref()?.get(key)
    }
}

/// Feature toggles an adapter (and its sessions) advertises.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    SupportsImages,
    SupportsReasoningLevel,
    SupportsSandbox,
    EmitsDiffs,
    SupportsAttachments,
    SupportsCustomSchemas,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet(std::collections::BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        let _ = self.0.insert(capability);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_reports_membership() {
        let caps: CapabilitySet =
            [Capability::SupportsImages, Capability::EmitsDiffs].into_iter().collect();
        assert!(caps.has(Capability::SupportsImages));
        assert!(!caps.has(Capability::SupportsSandbox));
    }

    #[test]
    fn prompt_metadata_lookup_reads_strings() {
        let mut prompt = Prompt::user(vec![PromptSegment::text("hi")]);
        prompt.metadata = Some(serde_json::json!({"model": "gpt-5.1-codex"}));
        assert_eq!(prompt.metadata_str("model"), Some("gpt-5.1-codex"));
        assert_eq!(prompt.metadata_str("missing"), None);
    }
}
