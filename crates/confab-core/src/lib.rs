use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod passes;

/// Owner value written by the serving process before a user is known.
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Interim text streamed into `content` while a tool call resolves.
pub const TOOL_CALL_PLACEHOLDER: &str = "(tool call in progress…)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_null_as_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_files: Option<Vec<Value>>,
    #[serde(
        default,
        rename = "_original_parts",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_parts: Option<Value>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Message {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_deref().map_or(false, |calls| !calls.is_empty())
    }

    /// A non-empty `_original_parts` blob marks the message as authored by
    /// an alternate backend format.
    pub fn has_backend_passthrough(&self) -> bool {
        match &self.original_parts {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(entries)) => !entries.is_empty(),
            Some(Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        }
    }

    pub fn has_generated_files(&self) -> bool {
        self.generated_files
            .as_deref()
            .map_or(false, |files| !files.is_empty())
    }

    pub fn generated_file_names(&self) -> Vec<&str> {
        self.generated_files
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .collect()
    }
}

/// A persisted conversation; the id is the store key, not a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Conversation {
    pub fn has_named_owner(&self) -> bool {
        self.username
            .as_deref()
            .map_or(false, |name| !name.is_empty() && name != ANONYMOUS_OWNER)
    }
}

/// Deserialize a `content` field that can be missing or null into an empty
/// String
fn deserialize_null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
            tool_calls: None,
            generated_files: None,
            original_parts: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn roles_use_snake_case_wire_names() {
        let value = serde_json::to_value(Role::Function).expect("serialize role");
        assert_eq!(value, json!("function"));
        let parsed: Role = serde_json::from_value(json!("assistant")).expect("parse role");
        assert_eq!(parsed, Role::Assistant);
    }

    #[test]
    fn absent_and_empty_tool_calls_stay_distinguishable() {
        let absent: Message =
            serde_json::from_value(json!({"role": "assistant", "content": "hi"}))
                .expect("parse message");
        assert_eq!(absent.tool_calls, None);

        let empty: Message = serde_json::from_value(
            json!({"role": "assistant", "content": "hi", "tool_calls": []}),
        )
        .expect("parse message");
        assert_eq!(empty.tool_calls, Some(Vec::new()));

        let back = serde_json::to_value(&absent).expect("serialize message");
        assert!(back.get("tool_calls").is_none());
        let back = serde_json::to_value(&empty).expect("serialize message");
        assert_eq!(back.get("tool_calls"), Some(&json!([])));
    }

    #[test]
    fn null_content_reads_as_empty_string() {
        let parsed: Message =
            serde_json::from_value(json!({"role": "assistant", "content": null}))
                .expect("parse message");
        assert_eq!(parsed.content, "");
    }

    #[test]
    fn unknown_message_fields_round_trip() {
        let raw = json!({
            "role": "user",
            "content": "hello",
            "client_build": "2024.11.3",
            "latency_ms": 412
        });
        let parsed: Message = serde_json::from_value(raw.clone()).expect("parse message");
        assert_eq!(parsed.extra.get("client_build"), Some(&json!("2024.11.3")));
        let back = serde_json::to_value(&parsed).expect("serialize message");
        assert_eq!(back, raw);
    }

    #[test]
    fn backend_passthrough_requires_non_empty_blob() {
        let mut msg = message(Role::Assistant, "text");
        assert!(!msg.has_backend_passthrough());

        msg.original_parts = Some(json!([]));
        assert!(!msg.has_backend_passthrough());
        msg.original_parts = Some(json!({}));
        assert!(!msg.has_backend_passthrough());
        msg.original_parts = Some(json!(""));
        assert!(!msg.has_backend_passthrough());

        msg.original_parts = Some(json!([{"type": "text", "text": "raw"}]));
        assert!(msg.has_backend_passthrough());
    }

    #[test]
    fn generated_file_names_skips_non_strings() {
        let mut msg = message(Role::Assistant, "done");
        msg.generated_files = Some(vec![json!("report.xlsx"), json!(7), json!("chart.png")]);
        assert_eq!(msg.generated_file_names(), vec!["report.xlsx", "chart.png"]);
    }

    #[test]
    fn named_owner_excludes_sentinels() {
        let mut conversation = Conversation {
            title: None,
            username: None,
            model: None,
            created_at: None,
            updated_at: None,
            messages: Vec::new(),
            extra: BTreeMap::new(),
        };
        assert!(!conversation.has_named_owner());
        conversation.username = Some(String::new());
        assert!(!conversation.has_named_owner());
        conversation.username = Some(ANONYMOUS_OWNER.to_string());
        assert!(!conversation.has_named_owner());
        conversation.username = Some("alice".to_string());
        assert!(conversation.has_named_owner());
    }
}
