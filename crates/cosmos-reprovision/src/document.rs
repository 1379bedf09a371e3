//! Schemaless document representation and sanitization.
//!
//! Documents are kept as an insertion-ordered JSON object so that arbitrary
//! content round-trips unchanged, while still allowing named fields to be
//! removed before a document is written somewhere else.

use serde_json::{Map, Value};

/// A document as read from, or written to, a container.
pub type Document = Map<String, Value>;

/// Fields the store injects into every document. They describe the
/// document's place in its origin container and are rejected or
/// meaningless anywhere else.
pub const SYSTEM_PROPERTIES: [&str; 5] = ["_rid", "_self", "_etag", "_attachments", "_ts"];

/// Remove every store-injected field from `doc`, preserving the order of
/// the remaining fields. Returns how many fields were removed.
pub fn strip_system_properties(doc: &mut Document) -> usize {
    let mut removed = 0;
    for field in SYSTEM_PROPERTIES {
        if doc.shift_remove(field).is_some() {
            removed += 1;
        }
    }
    removed
}

/// The document's `id`, when it has a string one.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get("id").and_then(Value::as_str)
}

/// Resolve a partition-key path such as `/address/city` against `doc`.
///
/// Returns `None` when any segment along the path is missing or the
/// intermediate value is not an object.
pub fn partition_key_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.trim_start_matches('/').split('/');
    let first = segments.next().filter(|s| !s.is_empty())?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Render the partition-key request header value for `doc`.
///
/// The store expects a JSON array holding the key value; a document
/// without the key is addressed with the "undefined" key `[{}]`.
pub fn partition_key_header(doc: &Document, path: &str) -> String {
    match partition_key_value(doc, path) {
        Some(value) => Value::Array(vec![value.clone()]).to_string(),
        None => "[{}]".to_string(),
    }
}
