use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// The semantic body of an `item.completed` event.
///
/// Upstream transcripts are structurally typed with optional fields; here the
/// shapes are tagged variants. Anything that does not match a known shape is
/// preserved verbatim in [`ItemPayload::Unknown`] so that re-serialisation is
/// lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemPayload {
    Reasoning {
        #[serde(default)]
        text: String,
        /// Set when the text is a model-produced summary rather than the raw
        /// chain of thought.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summarized: Option<bool>,
    },
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    UserMessage {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        name: String,
        /// Raw argument string as reported upstream. Tool-call arguments
        /// arrive as a *string* containing JSON (or a patch body), not as an
        /// already-parsed object, and are kept that way.
        #[serde(default)]
        arguments: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
    },
    FileChange {
        changes: Vec<FileChange>,
    },
    #[serde(untagged)]
    Unknown(Value),
}

impl ItemPayload {
    /// Wrap this item in the payload object expected by an envelope.
    pub fn into_payload(self) -> Value {
        serde_json::json!({ "item": self })
    }

    /// The tag this item serialises under, or `"unknown"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            ItemPayload::Reasoning { .. } => "reasoning",
            ItemPayload::AgentMessage { .. } => "agent_message",
            ItemPayload::UserMessage { .. } => "user_message",
            ItemPayload::ToolCall { .. } => "tool_call",
            ItemPayload::ToolResult { .. } => "tool_result",
            ItemPayload::FileChange { .. } => "file_change",
            ItemPayload::Unknown(_) => "unknown",
        }
    }
}

/// One path touched by a file-change item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileChangeKind {
    Add,
    Delete,
    Update,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn tagged_variants_round_trip() {
        let item = ItemPayload::ToolCall {
            name: "apply_patch".to_string(),
            arguments: "{}".to_string(),
            call_id: Some("call_1".to_string()),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "tool_call");
        let back: ItemPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn unknown_shapes_are_preserved() {
        let original = json!({"type": "screenshot", "png": "…", "width": 80});
        let item: ItemPayload = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(item, ItemPayload::Unknown(original.clone()));
        assert_eq!(serde_json::to_value(&item).unwrap(), original);
    }

    #[test]
    fn file_change_kinds_sort_and_display() {
        let mut kinds = std::collections::BTreeSet::new();
        kinds.insert(FileChangeKind::Update);
        kinds.insert(FileChangeKind::Add);
        let rendered: Vec<String> = kinds.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["add".to_string(), "update".to_string()]);
    }
}
