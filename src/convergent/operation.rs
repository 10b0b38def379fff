//! Document operations and the changes that carry them

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::horizon::{DeviceId, Horizon, SeqNum};

/// Identifies one change globally.
pub type ChangeId = Uuid;

/// Identifies an item within a document.
pub type ItemId = String;

/// A value stored in a field or set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// Primitive edits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    AddItem {
        item_id: ItemId,
        item_type: String,
    },
    /// Removes the item as far as the author had seen it. Edits the author
    /// had not seen keep it alive.
    RemoveItem { item_id: ItemId },
    /// Latest write wins.
    SetField {
        item_id: ItemId,
        field: String,
        value: Value,
    },
    AddToSet {
        item_id: ItemId,
        set_name: String,
        element: Value,
    },
    /// Cancels exactly the adds listed in `observed_adds`.
    RemoveFromSet {
        item_id: ItemId,
        set_name: String,
        element: Value,
        observed_adds: Vec<ChangeId>,
    },
}

impl Operation {
    pub fn item_id(&self) -> &ItemId {
        match self {
            Operation::AddItem { item_id, .. }
            | Operation::RemoveItem { item_id }
            | Operation::SetField { item_id, .. }
            | Operation::AddToSet { item_id, .. }
            | Operation::RemoveFromSet { item_id, .. } => item_id,
        }
    }
}

/// One operation with the metadata needed to order and merge it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub author: DeviceId,
    pub seq: SeqNum,
    /// Milliseconds; strictly greater than every change the author had seen.
    pub timestamp: u64,
    /// What the author had seen when making this change.
    pub horizon: Horizon,
    pub op: Operation,
}

impl Change {
    pub fn had_seen(&self, other: &Change) -> bool {
        self.horizon.has_seen(&other.author, other.seq)
    }

    /// Total order used for latest-wins resolution.
    pub fn order_key(&self) -> (u64, &str, SeqNum) {
        (self.timestamp, self.author.as_str(), self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_json_is_plain() {
        assert_eq!(serde_json::to_string(&Value::Int(1)).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Value>("\"x\"").unwrap(), Value::string("x"));
        assert_eq!(serde_json::from_str::<Value>("null").unwrap(), Value::Null);
    }

    #[test]
    fn test_operation_is_tagged() {
        let op = Operation::SetField {
            item_id: "root".into(),
            field: "x".into(),
            value: Value::Int(1),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "set_field");
        assert_eq!(op.item_id(), "root");
    }
}
