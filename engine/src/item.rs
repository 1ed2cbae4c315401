//! Item model for synchronizable records.

use crate::{classifier::ContentType, LocalId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation the engine assigned to an item during one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    /// Rest state, nothing decided yet
    #[default]
    None,
    Add,
    Replace,
    Delete,
    /// Left for the conflict resolution policy
    Conflict,
}

impl SyncOp {
    /// Whether the operation is a terminal decision for this pass.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncOp::None)
    }
}

impl std::fmt::Display for SyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOp::None => write!(f, "none"),
            SyncOp::Add => write!(f, "add"),
            SyncOp::Replace => write!(f, "replace"),
            SyncOp::Delete => write!(f, "delete"),
            SyncOp::Conflict => write!(f, "conflict"),
        }
    }
}

/// One synchronizable record.
///
/// Fields are kept sorted by name so comparisons and fingerprints are
/// independent of the order a backend produced them in. The item refers to
/// its classifier only through [`ContentType`]; the classifier itself lives
/// in the session's registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Identifier assigned by the local backend
    pub local_id: Option<LocalId>,
    /// Identifier assigned by the remote peer
    pub remote_id: Option<RemoteId>,
    /// Content type key used to look up the classifier
    pub content_type: ContentType,
    /// Field values, used only for comparison and merge
    pub fields: Map<String, Value>,
    /// Last modification time reported by the backend (milliseconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<Timestamp>,
    /// Outcome assigned by the engine for this pass
    #[serde(default)]
    operation: SyncOp,
}

impl Item {
    /// Create an item from a backend field snapshot.
    pub fn new(content_type: ContentType, fields: Map<String, Value>) -> Self {
        Self {
            local_id: None,
            remote_id: None,
            content_type,
            fields,
            modified_at: None,
            operation: SyncOp::None,
        }
    }

    /// Create an item from a JSON object. Non-object values produce an
    /// item without fields.
    pub fn from_json(content_type: ContentType, value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::new(content_type, fields),
            _ => Self::new(content_type, Map::new()),
        }
    }

    /// Builder-style method to set the local ID.
    pub fn with_local_id(mut self, id: impl Into<LocalId>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    /// Builder-style method to set the remote ID.
    pub fn with_remote_id(mut self, id: impl Into<RemoteId>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    /// Builder-style method to set the modification time.
    pub fn with_modified_at(mut self, timestamp: Timestamp) -> Self {
        self.modified_at = Some(timestamp);
        self
    }

    pub fn operation(&self) -> SyncOp {
        self.operation
    }

    pub fn set_operation(&mut self, op: SyncOp) {
        self.operation = op;
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field value, returning the previous one.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(name.into(), value)
    }

    /// Remove a field, returning its value.
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Overwrite the content with another item's content, keeping this
    /// item's identity.
    ///
    /// Used when a remote update is applied onto a local shell record.
    pub fn replace_data_from(&mut self, other: &Item) {
        self.fields = other.fields.clone();
        self.modified_at = other.modified_at;
    }

    /// Human readable identity for logs and reports.
    pub fn display_id(&self) -> String {
        match (&self.local_id, &self.remote_id) {
            (Some(local), Some(remote)) => format!("{}<->{}", local, remote),
            (Some(local), None) => local.clone(),
            (None, Some(remote)) => format!("remote:{}", remote),
            (None, None) => "<unassigned>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact(name: &str) -> Item {
        Item::from_json(ContentType::Contact, json!({"FN": name, "TEL": "555"}))
    }

    #[test]
    fn create_item() {
        let item = contact("Alice").with_local_id("l-1").with_modified_at(1000);

        assert_eq!(item.local_id.as_deref(), Some("l-1"));
        assert_eq!(item.remote_id, None);
        assert_eq!(item.field("FN"), Some(&json!("Alice")));
        assert_eq!(item.modified_at, Some(1000));
        assert_eq!(item.operation(), SyncOp::None);
    }

    #[test]
    fn non_object_json_has_no_fields() {
        let item = Item::from_json(ContentType::Memo, json!("plain text"));
        assert_eq!(item.fields().count(), 0);
    }

    #[test]
    fn fields_are_name_ordered() {
        let item = Item::from_json(ContentType::Task, json!({"b": 1, "a": 2, "c": 3}));
        let names: Vec<_> = item.fields().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn replace_data_keeps_identity() {
        let mut local = contact("Alice").with_local_id("l-1").with_remote_id("r-1");
        local.set_operation(SyncOp::Replace);
        let remote = contact("Alice Smith")
            .with_remote_id("r-9")
            .with_modified_at(2000);

        local.replace_data_from(&remote);

        assert_eq!(local.local_id.as_deref(), Some("l-1"));
        assert_eq!(local.remote_id.as_deref(), Some("r-1"));
        assert_eq!(local.field("FN"), Some(&json!("Alice Smith")));
        assert_eq!(local.modified_at, Some(2000));
        assert_eq!(local.operation(), SyncOp::Replace);
    }

    #[test]
    fn set_and_remove_field() {
        let mut item = contact("Alice");
        assert_eq!(item.set_field("TEL", json!("556")), Some(json!("555")));
        assert_eq!(item.remove_field("TEL"), Some(json!("556")));
        assert!(item.field("TEL").is_none());
    }

    #[test]
    fn display_id_variants() {
        assert_eq!(contact("a").display_id(), "<unassigned>");
        assert_eq!(contact("a").with_local_id("l").display_id(), "l");
        assert_eq!(contact("a").with_remote_id("r").display_id(), "remote:r");
        assert_eq!(
            contact("a").with_local_id("l").with_remote_id("r").display_id(),
            "l<->r"
        );
    }

    #[test]
    fn sync_op_terminal() {
        assert!(!SyncOp::None.is_terminal());
        assert!(SyncOp::Conflict.is_terminal());
        assert_eq!(SyncOp::Replace.to_string(), "replace");
    }

    #[test]
    fn serialization_roundtrip() {
        let item = contact("Alice").with_local_id("l-1").with_modified_at(5);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"localId\":\"l-1\""));
        assert!(json.contains("\"contentType\":\"contact\""));

        let parsed: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(item, parsed);
    }
}
