//! On-disk conversation schema and the upgrade path for older documents.
//!
//! Every saved file carries `schema_version`. Documents written before the field
//! existed are version 0: they may use `name` instead of `title`, omit message ids,
//! and store epoch-second timestamps.

use chrono::{ DateTime, Utc };
use serde::Serialize;
use serde_json::{ Map, Value };

use super::StoreError;
use crate::models::chat::{ derive_title, new_id, Conversation, Message };

pub const SCHEMA_VERSION: u64 = 1;
pub const VERSION_KEY: &str = "schema_version";

#[derive(Serialize)]
pub struct StoredConversation<'a> {
    pub schema_version: u64,
    #[serde(flatten)]
    pub conversation: &'a Conversation,
}

impl<'a> StoredConversation<'a> {
    pub fn new(conversation: &'a Conversation) -> Self {
        Self { schema_version: SCHEMA_VERSION, conversation }
    }
}

/// Values used when an old document lacks its own id or timestamp.
pub struct Fallback<'a> {
    pub id: &'a str,
    pub timestamp: DateTime<Utc>,
}

fn malformed(msg: &str) -> StoreError {
    StoreError::Json(<serde_json::Error as serde::de::Error>::custom(msg))
}

fn epoch_to_rfc3339(n: &serde_json::Number) -> Option<Value> {
    let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
    // millisecond timestamps from browser clients
    let secs = if raw.abs() > 100_000_000_000 { raw / 1000 } else { raw };
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| Value::String(dt.to_rfc3339()))
}

fn upgrade_message(msg: &mut Value) {
    let Some(obj) = msg.as_object_mut() else {
        return;
    };
    match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(Value::Number(n)) => {
            let id = n.to_string();
            obj.insert("id".into(), Value::String(id));
        }
        _ => {
            obj.insert("id".into(), Value::String(new_id()));
        }
    }
    if let Some(Value::String(role)) = obj.get_mut("role") {
        *role = role.to_lowercase();
    }
    match obj.get("timestamp") {
        Some(Value::Number(n)) => {
            match epoch_to_rfc3339(n) {
                Some(ts) => {
                    obj.insert("timestamp".into(), ts);
                }
                None => {
                    obj.remove("timestamp");
                }
            }
        }
        Some(Value::Null) => {
            obj.remove("timestamp");
        }
        _ => {}
    }
}

fn upgrade_v0(obj: &mut Map<String, Value>, fallback: &Fallback) {
    match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => {
            obj.insert("id".into(), Value::String(fallback.id.to_string()));
        }
    }

    let messages = obj.entry("messages").or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = messages {
        items.iter_mut().for_each(upgrade_message);
    }

    if !matches!(obj.get("title"), Some(Value::String(_))) {
        let title = match obj.remove("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            _ => {
                let parsed = obj
                    .get("messages")
                    .cloned()
                    .and_then(|m| serde_json::from_value::<Vec<Message>>(m).ok())
                    .unwrap_or_default();
                derive_title(&parsed)
            }
        };
        obj.insert("title".into(), Value::String(title));
    }

    let timestamp = match obj.get("timestamp") {
        Some(Value::String(s)) => Some(Value::String(s.clone())),
        Some(Value::Number(n)) => epoch_to_rfc3339(n),
        _ => None,
    };
    obj.insert(
        "timestamp".into(),
        timestamp.unwrap_or_else(|| Value::String(fallback.timestamp.to_rfc3339()))
    );
}

/// Brings a raw document up to the current schema. The version marker is stripped.
pub fn migrate(mut value: Value, fallback: &Fallback) -> Result<Value, StoreError> {
    let obj = value.as_object_mut().ok_or_else(|| malformed("conversation is not a JSON object"))?;

    let version = match obj.get(VERSION_KEY) {
        None => 0,
        Some(v) => v.as_u64().ok_or_else(|| malformed("schema_version is not an integer"))?,
    };
    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }
    if version == 0 {
        upgrade_v0(obj, fallback);
    }
    obj.remove(VERSION_KEY);
    Ok(value)
}

pub fn decode(value: Value, fallback: &Fallback) -> Result<Conversation, StoreError> {
    let current = migrate(value, fallback)?;
    Ok(serde_json::from_value(current)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;
    use serde_json::json;

    fn fallback() -> Fallback<'static> {
        Fallback { id: "from-file", timestamp: Utc::now() }
    }

    #[test]
    fn upgrades_version_zero_documents() {
        let old = json!({
            "name": "Renamed chat",
            "messages": [
                {"role": "User", "content": "hello", "timestamp": 1_700_000_000},
                {"id": 7, "role": "assistant", "content": "hi"}
            ]
        });
        let conv = decode(old, &fallback()).unwrap();
        assert_eq!(conv.id, "from-file");
        assert_eq!(conv.title, "Renamed chat");
        assert_eq!(conv.messages[0].role, Role::User);
        assert!(!conv.messages[0].id.is_empty());
        assert_eq!(conv.messages[0].timestamp.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(conv.messages[1].id, "7");
    }

    #[test]
    fn derives_missing_title() {
        let old = json!({"id": "a", "messages": [{"role": "user", "content": "Plan a trip"}]});
        assert_eq!(decode(old, &fallback()).unwrap().title, "Plan a trip");
    }

    #[test]
    fn current_documents_pass_through() {
        let conv = Conversation::new("abc");
        let doc = serde_json::to_value(StoredConversation::new(&conv)).unwrap();
        assert_eq!(doc[VERSION_KEY], json!(SCHEMA_VERSION));
        assert_eq!(decode(doc, &fallback()).unwrap(), conv);
    }

    #[test]
    fn rejects_newer_versions() {
        let doc = json!({"schema_version": SCHEMA_VERSION + 1, "id": "a"});
        assert!(matches!(migrate(doc, &fallback()), Err(StoreError::UnsupportedVersion(_))));
    }
}
