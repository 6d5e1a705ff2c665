use std::cmp::Ordering;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{domain::ConversationId, error::StoreError};

pub type Fields = Map<String, Value>;

pub const CONVERSATIONS: &str = "chats";
pub const USERS: &str = "users";

/// Collection holding the message log of one conversation.
pub fn messages_collection(conversation_id: &ConversationId) -> String {
    format!("{CONVERSATIONS}/{}/messages", conversation_id.0)
}

/// One stored record: a store-assigned id plus its JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.fields, path)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|err| {
            StoreError::invalid_argument(format!("malformed document {}: {err}", self.id))
        })
    }
}

/// Resolve a dotted field path (`typing.alice`) against a field map.
pub fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = fields.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's monotonic clock (epoch millis) at write time.
    ServerTimestamp,
    /// Removes the field. The only way this crate expresses absence on write.
    Delete,
}

/// Ordered set of field writes keyed by dotted path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    entries: Vec<(String, FieldValue)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .push((path.into(), FieldValue::Value(value.into())));
        self
    }

    pub fn server_timestamp(mut self, path: impl Into<String>) -> Self {
        self.entries.push((path.into(), FieldValue::ServerTimestamp));
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.entries.push((path.into(), FieldValue::Delete));
        self
    }

    pub fn entries(&self) -> &[(String, FieldValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn value_of(&self, path: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .rev()
            .find(|(entry_path, _)| entry_path == path)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    ArrayContains { field: String, value: Value },
    Equals { field: String, value: Value },
}

impl Filter {
    fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::ArrayContains { field, value } => lookup(fields, field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            Filter::Equals { field, value } => lookup(fields, field) == Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_array_contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::ArrayContains {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|filter| filter.matches(fields))
    }

    /// Filter and order documents already listed in store (insertion) order.
    ///
    /// Documents missing the ordering field are excluded, and the sort is
    /// stable so equal keys keep store order.
    pub fn apply(&self, documents: Vec<Document>) -> Vec<Document> {
        let mut selected: Vec<Document> = documents
            .into_iter()
            .filter(|doc| self.matches(&doc.fields))
            .collect();
        if let Some((field, direction)) = &self.order_by {
            selected.retain(|doc| doc.get(field).is_some_and(|value| !value.is_null()));
            selected.sort_by(|a, b| {
                let ordering = compare_values(a.get(field), b.get(field));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        selected
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => type_rank(x).cmp(&type_rank(y)),
    }
}

/// One push from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Query(Vec<Document>),
    Document(Option<Document>),
    Error(StoreError),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, value: Value) -> Document {
        let Value::Object(fields) = value else {
            panic!("fixture must be an object");
        };
        Document::new(id, fields)
    }

    #[test]
    fn resolves_dotted_paths() {
        let d = doc("c1", json!({ "typing": { "alice": 12 } }));
        assert_eq!(d.get("typing.alice"), Some(&json!(12)));
        assert_eq!(d.get("typing.bob"), None);
        assert_eq!(d.get("missing.alice"), None);
    }

    #[test]
    fn array_contains_filter_selects_members() {
        let query = Query::collection(CONVERSATIONS).where_array_contains("members", "alice");
        let docs = vec![
            doc("c1", json!({ "members": ["alice", "bob"] })),
            doc("c2", json!({ "members": ["carol", "bob"] })),
            doc("c3", json!({ "members": "alice" })),
        ];
        let selected = query.apply(docs);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "c1");
    }

    #[test]
    fn ordering_is_stable_for_equal_keys() {
        let query = Query::collection("m").order_by("createdAt", Direction::Ascending);
        let docs = vec![
            doc("late", json!({ "createdAt": 30 })),
            doc("tie-a", json!({ "createdAt": 10 })),
            doc("tie-b", json!({ "createdAt": 10 })),
            doc("pending", json!({ "createdAt": null })),
        ];
        let ids: Vec<String> = query.apply(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["tie-a", "tie-b", "late"]);
    }

    #[test]
    fn later_patch_entries_win_lookup() {
        let patch = Patch::new().set("status", "sent").set("status", "read");
        assert_eq!(patch.value_of("status"), Some(&FieldValue::Value(json!("read"))));
        assert_eq!(patch.value_of("missing"), None);
    }
}
