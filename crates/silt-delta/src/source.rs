//! Field enumeration for records under delta capture.
//!
//! The store never introspects a host's session type. Instead the host
//! implements [`SessionState`], which exposes exactly what delta capture
//! needs: the record's identity, its live field keys, a per-field encoder,
//! and the header metadata. [`InMemorySession`] is a bundled implementation
//! over JSON values, useful on its own and throughout the tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{DeltaError, Result};

/// A field serialized for change detection and persistence.
#[derive(Debug, Clone)]
pub struct EncodedField {
    /// Tag describing the payload's type (e.g. `json/object`).
    pub type_tag: String,
    /// Serialized payload.
    pub bytes: Vec<u8>,
}

/// View of a live session record for delta capture.
///
/// Implementations must tolerate `encode_field` failing for individual
/// fields: capture skips such fields and persists the rest of the record.
pub trait SessionState {
    /// Immutable record key.
    fn id(&self) -> &str;

    /// Keys of all fields currently present.
    fn field_keys(&self) -> Vec<String>;

    /// Serialize one field.
    fn encode_field(&self, key: &str) -> Result<EncodedField>;

    /// When the record was created.
    fn created_at(&self) -> DateTime<Utc>;

    /// Last completed access.
    fn last_accessed_at(&self) -> DateTime<Utc>;

    /// Access currently in progress.
    fn this_accessed_at(&self) -> DateTime<Utc>;

    /// Idle seconds after which the record expires.
    fn max_idle_secs(&self) -> i64;

    /// Number of requests observed against the record.
    fn request_count(&self) -> u32 {
        0
    }

    /// Whether the record is newly created.
    fn is_new(&self) -> bool {
        false
    }

    /// Whether the record is still valid.
    fn is_valid(&self) -> bool {
        true
    }

    /// Authenticated principal, if any.
    fn principal(&self) -> Option<String> {
        None
    }
}

/// Default idle expiry for [`InMemorySession`]: 30 minutes.
pub const DEFAULT_MAX_IDLE_SECS: i64 = 30 * 60;

/// A session record held entirely in memory, with JSON-encoded fields.
#[derive(Debug, Clone)]
pub struct InMemorySession {
    id: String,
    fields: BTreeMap<String, Value>,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    this_accessed_at: DateTime<Utc>,
    max_idle_secs: i64,
    request_count: u32,
    is_new: bool,
    is_valid: bool,
    principal: Option<String>,
}

impl InMemorySession {
    /// Create an empty session.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            created_at: now,
            last_accessed_at: now,
            this_accessed_at: now,
            max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            request_count: 0,
            is_new: true,
            is_valid: true,
            principal: None,
        }
    }

    /// Set the idle expiry.
    pub fn with_max_idle_secs(mut self, secs: i64) -> Self {
        self.max_idle_secs = secs;
        self
    }

    /// Set the authenticated principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Store a field, serializing the value to JSON.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| DeltaError::FieldEncode {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.fields.insert(key, value);
        Ok(())
    }

    /// Remove a field. Returns the previous value, if any.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Read a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Record an access: bumps the activity timestamps and request count.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_accessed_at = self.this_accessed_at;
        self.this_accessed_at = now;
        self.request_count += 1;
        self.is_new = false;
    }

    /// Invalidate the session.
    pub fn invalidate(&mut self) {
        self.is_valid = false;
    }
}

impl SessionState for InMemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn field_keys(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn encode_field(&self, key: &str) -> Result<EncodedField> {
        let value = self.fields.get(key).ok_or_else(|| DeltaError::FieldEncode {
            key: key.to_string(),
            reason: "no such field".to_string(),
        })?;
        let bytes = serde_json::to_vec(value).map_err(|e| DeltaError::FieldEncode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(EncodedField {
            type_tag: json_type_tag(value).to_string(),
            bytes,
        })
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_accessed_at
    }

    fn this_accessed_at(&self) -> DateTime<Utc> {
        self.this_accessed_at
    }

    fn max_idle_secs(&self) -> i64 {
        self.max_idle_secs
    }

    fn request_count(&self) -> u32 {
        self.request_count
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn principal(&self) -> Option<String> {
        self.principal.clone()
    }
}

fn json_type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "json/null",
        Value::Bool(_) => "json/bool",
        Value::Number(_) => "json/number",
        Value::String(_) => "json/string",
        Value::Array(_) => "json/array",
        Value::Object(_) => "json/object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_encode() {
        let mut session = InMemorySession::new("s-1");
        session.insert("cart", vec!["item-1", "item-2"]).unwrap();

        let keys = session.field_keys();
        assert_eq!(keys, vec!["cart".to_string()]);

        let encoded = session.encode_field("cart").unwrap();
        assert_eq!(encoded.type_tag, "json/array");
        assert_eq!(encoded.bytes, br#"["item-1","item-2"]"#);
    }

    #[test]
    fn test_encode_missing_field() {
        let session = InMemorySession::new("s-1");
        let err = session.encode_field("absent").unwrap_err();
        assert!(matches!(err, DeltaError::FieldEncode { key, .. } if key == "absent"));
    }

    #[test]
    fn test_remove() {
        let mut session = InMemorySession::new("s-1");
        session.insert("flag", true).unwrap();
        assert!(session.remove("flag").is_some());
        assert!(session.field_keys().is_empty());
        assert!(session.remove("flag").is_none());
    }

    #[test]
    fn test_touch_advances_activity() {
        let mut session = InMemorySession::new("s-1");
        assert!(session.is_new());
        let before = session.this_accessed_at();
        session.touch();
        assert_eq!(session.request_count(), 1);
        assert!(!session.is_new());
        assert_eq!(session.last_accessed_at(), before);
    }

    #[test]
    fn test_type_tags() {
        let mut session = InMemorySession::new("s-1");
        session.insert("n", 42u32).unwrap();
        session.insert("s", "text").unwrap();
        assert_eq!(session.encode_field("n").unwrap().type_tag, "json/number");
        assert_eq!(session.encode_field("s").unwrap().type_tag, "json/string");
    }
}
