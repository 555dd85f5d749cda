//! Affinity key extraction from request and response messages.
//!
//! Messages expose their fields through [`AffinityMessage`], one field name at
//! a time. [`resolve_affinity_key`] walks a dot-separated path such as
//! `session.name` over that accessor and returns the scalar at its end. The
//! resolver knows nothing about the encoding: protobuf types, JSON values or
//! hand-written structs can all implement the trait.

use std::borrow::Cow;

use tracing::warn;

use crate::error::ResolveError;

/// Value of a single field looked up by name.
pub enum FieldValue<'a> {
    /// A nested message that path traversal can descend into.
    Message(&'a dyn AffinityMessage),
    /// A scalar rendered as a string; only valid at the end of a path.
    Scalar(Cow<'a, str>),
}

impl std::fmt::Debug for FieldValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Message(_) => f.write_str("Message(..)"),
            FieldValue::Scalar(value) => f.debug_tuple("Scalar").field(value).finish(),
        }
    }
}

/// Schema-aware field accessor for a message type.
pub trait AffinityMessage: Send + Sync {
    /// Looks up one field by name. `None` means the field does not exist or is unset.
    fn resolve_field(&self, name: &str) -> Option<FieldValue<'_>>;
}

/// Walks `path` over `message` and returns the scalar it ends at.
pub fn resolve_affinity_key(
    message: &dyn AffinityMessage,
    path: &str,
) -> Result<String, ResolveError> {
    if path.is_empty() {
        return Err(ResolveError::EmptyPath);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let last = segments.len() - 1;
    let mut current = message;
    for (depth, segment) in segments.iter().enumerate() {
        let not_found = || ResolveError::FieldNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
            depth,
        };
        match current.resolve_field(segment) {
            Some(FieldValue::Message(next)) if depth < last => current = next,
            Some(FieldValue::Message(_)) => {
                return Err(ResolveError::NotAScalar {
                    path: path.to_string(),
                })
            }
            Some(FieldValue::Scalar(value)) if depth == last => return Ok(value.into_owned()),
            Some(FieldValue::Scalar(_)) | None => return Err(not_found()),
        }
    }
    Err(ResolveError::EmptyPath)
}

/// Lenient form of [`resolve_affinity_key`] used on the call path.
///
/// Failures are logged and yield `None`, so the call proceeds without affinity.
/// An empty resolved value also yields `None`.
pub fn affinity_key_from_message(message: &dyn AffinityMessage, path: &str) -> Option<String> {
    match resolve_affinity_key(message, path) {
        Ok(key) if !key.is_empty() => Some(key),
        Ok(_) => None,
        Err(e) => {
            warn!(affinity_key = path, error = %e, "cannot find affinity value in message");
            None
        }
    }
}

impl AffinityMessage for serde_json::Value {
    fn resolve_field(&self, name: &str) -> Option<FieldValue<'_>> {
        let value = match self {
            serde_json::Value::Object(object) => object.get(name)?,
            serde_json::Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
            _ => return None,
        };
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(FieldValue::Scalar(Cow::Borrowed(s))),
            serde_json::Value::Number(n) => Some(FieldValue::Scalar(Cow::Owned(n.to_string()))),
            serde_json::Value::Bool(b) => Some(FieldValue::Scalar(Cow::Owned(b.to_string()))),
            nested => Some(FieldValue::Message(nested)),
        }
    }
}
