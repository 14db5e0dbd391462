//! Record of a single session field and metadata about its serialized form.

use serde::{Deserialize, Serialize};

use crate::source::EncodedField;

/// What one field looked like the last time it was observed.
///
/// Change detection compares length and checksum, never the payload bytes:
/// `data` may be wiped once a record is cached to bound resident memory, and
/// checksum/length remain authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    /// Field key.
    pub key: String,

    /// How many times this field has been observed changed, starting at 1.
    pub update_count: u32,

    /// Length of the serialized payload in bytes.
    pub data_len: usize,

    /// Lowercase-hex CRC32 of the serialized payload.
    pub checksum: String,

    /// Encoder-supplied tag describing the payload's type.
    pub type_tag: String,

    /// Serialized payload. `None` once wiped for caching.
    pub data: Option<Vec<u8>>,
}

impl FieldRecord {
    /// Build a record from a freshly encoded field.
    pub fn from_encoded(key: impl Into<String>, update_count: u32, encoded: EncodedField) -> Self {
        let checksum = checksum(&encoded.bytes);
        Self {
            key: key.into(),
            update_count,
            data_len: encoded.bytes.len(),
            checksum,
            type_tag: encoded.type_tag,
            data: Some(encoded.bytes),
        }
    }

    /// Whether `encoded` represents a different value than this record.
    pub fn differs_from(&self, encoded_len: usize, encoded_checksum: &str) -> bool {
        self.data_len != encoded_len || self.checksum != encoded_checksum
    }
}

/// CRC32 of the serialized payload, rendered as lowercase hex.
pub(crate) fn checksum(data: &[u8]) -> String {
    format!("{:x}", crc32fast::hash(data))
}
