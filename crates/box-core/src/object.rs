//! Stored objects — the unit of queue persistence.
//!
//! An object is immutable once written. On disk it is a JSON document with
//! the payload bytes base64-encoded; in memory the payload is raw bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key that tags Location Service records with their schema.
pub const SCHEMA_KEY: &str = "schema";

/// A stored opaque payload with metadata, addressed by UUID within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: Uuid,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub node_id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<BTreeMap<String, String>>,
}

impl StoredObject {
    /// Build a fresh object stamped with a new id and the current time.
    pub fn new(
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
        node_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_type: content_type.into(),
            data: data.into(),
            created_at: Utc::now(),
            node_id,
            user_id,
            user_metadata: None,
        }
    }

    /// Tag the object with a schema, creating the metadata map if needed.
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.user_metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(SCHEMA_KEY.to_owned(), schema.to_owned());
        self
    }

    /// The schema tag, if any.
    pub fn schema(&self) -> Option<&str> {
        self.user_metadata
            .as_ref()
            .and_then(|m| m.get(SCHEMA_KEY))
            .map(String::as_str)
    }
}

/// A handle to a stored object: enough to find it again without reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: Uuid,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_bytes_and_metadata() {
        let mut obj = StoredObject::new(
            "application/octet-stream",
            vec![0u8, 1, 2, 255, 254],
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        obj.user_metadata = Some(BTreeMap::from([
            ("schema".to_owned(), "box.location-service.v1".to_owned()),
            ("origin".to_owned(), "test".to_owned()),
        ]));

        let json = serde_json::to_string(&obj).unwrap();
        let back: StoredObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn data_is_base64_on_disk() {
        let obj = StoredObject::new("text/plain", b"Hello".to_vec(), Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["data"], "SGVsbG8=");
    }

    #[test]
    fn empty_payload_round_trips() {
        let obj = StoredObject::new("text/plain", Vec::new(), Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_string(&obj).unwrap();
        let back: StoredObject = serde_json::from_str(&json).unwrap();
        assert!(back.data.is_empty());
    }

    #[test]
    fn absent_metadata_is_omitted() {
        let obj = StoredObject::new("text/plain", b"x".to_vec(), Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_string(&obj).unwrap();
        assert!(!json.contains("user_metadata"));
    }

    #[test]
    fn schema_tagging() {
        let obj = StoredObject::new("application/json", b"{}".to_vec(), Uuid::new_v4(), Uuid::new_v4())
            .with_schema("box.location-service.v1");
        assert_eq!(obj.schema(), Some("box.location-service.v1"));
    }

    #[test]
    fn created_at_serialises_as_iso8601() {
        let obj = StoredObject::new("text/plain", b"x".to_vec(), Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(&obj).unwrap();
        let stamp = json["created_at"].as_str().unwrap();
        assert!(stamp.contains('T'), "expected ISO 8601, got {stamp}");
    }
}
