// Application data records
//
// Opaque records the application asks the node to keep and fan out to the
// mesh. They live for the long retention window.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: String,
    /// Application-defined category, e.g. "post" or "parity"
    #[serde(default)]
    pub kind: Option<String>,
    pub body: Value,
    pub timestamp: u64,
}

impl DataRecord {
    /// Build a record from application input, filling in a missing id or
    /// timestamp.
    pub fn from_input(input: Value, now: u64) -> Self {
        let id = input
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("data-{}", uuid::Uuid::new_v4()));
        let kind = input
            .get("kind")
            .or_else(|| input.get("category"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let timestamp = input
            .get("timestamp")
            .and_then(Value::as_u64)
            .unwrap_or(now);

        Self {
            id,
            kind,
            body: input,
            timestamp,
        }
    }
}

impl Record for DataRecord {
    const COLLECTION: &'static str = "data";

    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        self.kind
            .iter()
            .map(|kind| ("kind", kind.clone()))
            .collect()
    }
}
