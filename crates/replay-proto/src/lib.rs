// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared data model for the replay runtime.
//!
//! * [`OperationDescriptor`] / [`RequestKey`] identify one logical query execution.
//! * [`ExecutionResult`] and its entry types mirror the GraphQL incremental-delivery
//!   payloads (`pending` / `incremental` / `completed`).
//! * [`DeliveryEvent`] is the flattened, path-addressed output of the reducer.
//! * [`TransportEvent`] is the closed vocabulary carried by the handoff stream
//!   between the origin (server render) and consumer (hydration) environments.
//!
//! Two id spaces live here and must not be mixed: pending-part ids
//! ([`PendingEntry::id`]) are opaque strings scoped to one response stream, while
//! [`TransferId`] routes handoff progress for one watched request.

mod canonical;
pub mod wire;

pub use canonical::canonical_json;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// JSON object with deterministic (sorted) key order.
pub type JsonObject = Map<String, Value>;

/// Extension key carrying the terminal flag on every [`DeliveryEvent`].
pub const IS_FINAL: &str = "is_final";

/// One step from the response root towards a subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Position inside a list.
    Index(usize),
    /// Field name (or alias) inside an object.
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

/// Ordered path from the response root.
pub type ResponsePath = Vec<PathSegment>;

/// Render a path as `a.b.0.c` for logs and error messages.
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Everything needed to (re-)issue a GraphQL request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Persisted operation id, when the server knows the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Operation name.
    pub name: String,
    /// Document text, when sent inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Operation variables.
    #[serde(default)]
    pub variables: JsonObject,
}

impl OperationDescriptor {
    /// Descriptor with only a name; add id/text/variables with the builders.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            text: None,
            variables: JsonObject::new(),
        }
    }

    /// Set the persisted id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the document text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Replace all variables.
    pub fn with_variables(mut self, variables: JsonObject) -> Self {
        self.variables = variables;
        self
    }

    /// Set a single variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Stable identifier: persisted id, else BLAKE3 of the document text, else the name.
    pub fn identifier(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        if let Some(text) = &self.text {
            return hex::encode(blake3::hash(text.as_bytes()).as_bytes());
        }
        self.name.clone()
    }

    /// Key shared by every execution of this operation with these variables.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.identifier(), &self.variables)
    }

    /// JSON body POSTed to the GraphQL endpoint: `{id, query, variables}`.
    pub fn request_body(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "query": self.text,
            "variables": self.variables,
        })
    }
}

/// Deterministic identity of one logical request: `identifier:canonical(variables)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Derive a key. Variable key order never affects the result.
    pub fn new(identifier: &str, variables: &JsonObject) -> Self {
        let vars = canonical_json(&Value::Object(variables.clone()));
        Self(format!("{identifier}:{vars}"))
    }

    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing id for handoff progress of one watched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

// Keeps `"data": null` distinguishable from a missing `data` key.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// One GraphQL execution result, initial or subsequent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Initial data (present, possibly `null`, only on initial results).
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Request-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    /// Whether more results follow. Absent means `false`.
    #[serde(default)]
    pub has_next: bool,
    /// Parts announced by this result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingEntry>,
    /// Patches for previously announced parts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incremental: Vec<IncrementalEntry>,
    /// Parts finished by this result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed: Vec<CompletedEntry>,
    /// Legacy continuation path (continuations carry both `path` and `label`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ResponsePath>,
    /// Legacy continuation label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Top-level extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonObject>,
}

impl ExecutionResult {
    /// Initial results carry `data`/`errors` and are not continuations.
    pub fn is_initial(&self) -> bool {
        (self.data.is_some() || self.errors.is_some())
            && !(self.path.is_some() && self.label.is_some())
    }
}

/// Announcement of a deferred fragment or streamed list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Opaque id, unique within one response stream.
    pub id: String,
    /// Where the part's data will land.
    pub path: ResponsePath,
    /// Operation-defined label of the `@defer`/`@stream` selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Patch for one pending part: `data` for fragments, `items` for streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalEntry {
    /// Pending part id.
    pub id: String,
    /// Object fields to merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// List items to append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    /// Path below the part's path where `data` applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<ResponsePath>,
    /// Field errors raised while producing this patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
}

/// Completion notice for one pending part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEntry {
    /// Pending part id.
    pub id: String,
    /// Errors that aborted the part, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
}

/// Flattened, path-addressed update produced by the reducer.
///
/// `extensions` always holds the source message's extensions plus [`IS_FINAL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// The initial payload.
    Root {
        /// Initial data tree.
        data: Value,
        /// Request-level errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<Value>>,
        /// Extensions + `is_final`.
        extensions: JsonObject,
    },
    /// Settled value of a deferred fragment, or `data: null` when a streamed list ends.
    Patch {
        /// Accumulated fragment data, `null` for finished streams.
        data: Value,
        /// Path of the pending part.
        path: ResponsePath,
        /// Label of the pending part.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Errors attached to the completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<Value>>,
        /// Extensions + `is_final`.
        extensions: JsonObject,
    },
    /// One item appended to a streamed list.
    Item {
        /// The item.
        data: Value,
        /// List path followed by the item index.
        path: ResponsePath,
        /// Label of the pending part.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Extensions + `is_final`.
        extensions: JsonObject,
    },
}

impl DeliveryEvent {
    /// Payload of the event.
    pub fn data(&self) -> &Value {
        match self {
            Self::Root { data, .. } | Self::Patch { data, .. } | Self::Item { data, .. } => data,
        }
    }

    /// Path addressed by the event (`None` for the root payload).
    pub fn path(&self) -> Option<&[PathSegment]> {
        match self {
            Self::Root { .. } => None,
            Self::Patch { path, .. } | Self::Item { path, .. } => Some(path),
        }
    }

    /// Label of the deferred/streamed selection.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Root { .. } => None,
            Self::Patch { label, .. } | Self::Item { label, .. } => label.as_deref(),
        }
    }

    /// Extensions including `is_final`.
    pub fn extensions(&self) -> &JsonObject {
        match self {
            Self::Root { extensions, .. }
            | Self::Patch { extensions, .. }
            | Self::Item { extensions, .. } => extensions,
        }
    }

    /// True iff the source message declared `hasNext: false`.
    pub fn is_final(&self) -> bool {
        self.extensions()
            .get(IS_FINAL)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// GraphQL-response-shaped JSON (`data`, `errors?`, `path?`, `label?`, `extensions`).
    pub fn to_response(&self) -> Value {
        let mut out = JsonObject::new();
        out.insert("data".into(), self.data().clone());
        let errors = match self {
            Self::Root { errors, .. } | Self::Patch { errors, .. } => errors.clone(),
            Self::Item { .. } => None,
        };
        if let Some(errors) = errors {
            out.insert("errors".into(), Value::Array(errors));
        }
        if let Some(path) = self.path() {
            out.insert(
                "path".into(),
                serde_json::to_value(path).unwrap_or(Value::Null),
            );
        }
        if let Some(label) = self.label() {
            out.insert("label".into(), Value::String(label.to_string()));
        }
        out.insert(
            "extensions".into(),
            Value::Object(self.extensions().clone()),
        );
        Value::Object(out)
    }
}

/// Serializable error carried by replay channels and the handoff stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{name}] {message}")]
pub struct ErrorPayload {
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g. "E_TRANSPORT").
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Optional machine-readable details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    /// Build a payload from its parts.
    pub fn new(code: u32, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Fetch failed or the body could not be read.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(1, "E_TRANSPORT", message)
    }

    /// Server answered with a non-2xx status.
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::new(2, "E_HTTP_STATUS", format!("unexpected status {status}"))
            .with_details(serde_json::json!({ "status": status, "body": body.into() }))
    }

    /// A delimited payload was not valid JSON.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(3, "E_PARSE", message)
    }

    /// Declared and actual response shapes disagree.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::new(4, "E_SHAPE", message)
    }

    /// The request was cancelled.
    pub fn aborted() -> Self {
        Self::new(5, "E_ABORTED", "request aborted")
    }

    /// The handoff ended before the request finished; it was re-issued.
    pub fn handoff_abandoned(key: &RequestKey) -> Self {
        Self::new(
            6,
            "E_HANDOFF_ABANDONED",
            format!("handoff closed before {key} finished; request re-issued"),
        )
    }
}

/// Terminal-or-not progress of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// A reducer event.
    Next(DeliveryEvent),
    /// Terminal failure.
    Error(ErrorPayload),
    /// Terminal success.
    Complete,
}

/// Events multiplexed on the handoff stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportEvent {
    /// The origin began (or deduplicated onto) a request.
    Started {
        /// Routing id for the following progress events.
        id: TransferId,
        /// Enough to rebuild the request on the consumer.
        operation: OperationDescriptor,
    },
    /// One reducer event for a started request.
    Next {
        /// Routing id.
        id: TransferId,
        /// The event.
        data: DeliveryEvent,
    },
    /// The request failed on the origin.
    Error {
        /// Routing id.
        id: TransferId,
        /// Failure.
        error: ErrorPayload,
    },
    /// The request finished on the origin.
    Complete {
        /// Routing id.
        id: TransferId,
    },
    /// Out-of-band value unrelated to any request.
    Value {
        /// Value slot id.
        id: String,
        /// The value.
        value: Value,
    },
}

impl TransportEvent {
    /// Wrap request progress for the wire.
    pub fn progress(id: TransferId, progress: Progress) -> Self {
        match progress {
            Progress::Next(data) => Self::Next { id, data },
            Progress::Error(error) => Self::Error { id, error },
            Progress::Complete => Self::Complete { id },
        }
    }

    /// Split a progress variant back out; `None` for `started`/`value`.
    pub fn into_progress(self) -> Option<(TransferId, Progress)> {
        match self {
            Self::Next { id, data } => Some((id, Progress::Next(data))),
            Self::Error { id, error } => Some((id, Progress::Error(error))),
            Self::Complete { id } => Some((id, Progress::Complete)),
            Self::Started { .. } | Self::Value { .. } => None,
        }
    }

    /// Canonical `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Next { .. } => "next",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::Value { .. } => "value",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_key_ignores_variable_order() {
        let a: JsonObject = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":1}}"#).unwrap();
        let b: JsonObject = serde_json::from_str(r#"{"a":{"x":1,"y":2},"b":1}"#).unwrap();
        assert_eq!(RequestKey::new("q", &a), RequestKey::new("q", &b));
        assert_eq!(
            RequestKey::new("q", &a).as_str(),
            r#"q:{"a":{"x":1,"y":2},"b":1}"#
        );
    }

    #[test]
    fn identifier_prefers_persisted_id_then_content_hash() {
        let op = OperationDescriptor::new("Q").with_text("query Q { a }");
        let hashed = op.identifier();
        assert_eq!(hashed.len(), 64);
        assert_eq!(op.clone().with_id("abc").identifier(), "abc");
        assert_eq!(OperationDescriptor::new("Q").identifier(), "Q");
        assert_ne!(
            OperationDescriptor::new("Q").with_text("query Q { b }").identifier(),
            hashed
        );
    }

    #[test]
    fn initial_detection_keeps_null_data() {
        let r: ExecutionResult = serde_json::from_value(json!({"data": null, "hasNext": true})).unwrap();
        assert!(r.is_initial());
        assert_eq!(r.data, Some(Value::Null));

        let r: ExecutionResult =
            serde_json::from_value(json!({"hasNext": false, "incremental": []})).unwrap();
        assert!(!r.is_initial());

        let legacy: ExecutionResult = serde_json::from_value(
            json!({"data": {"a": 1}, "path": ["x"], "label": "L", "hasNext": true}),
        )
        .unwrap();
        assert!(!legacy.is_initial());
    }

    #[test]
    fn path_segments_deserialize_mixed() {
        let p: ResponsePath = serde_json::from_value(json!(["posts", 3, "author"])).unwrap();
        assert_eq!(
            p,
            vec![
                PathSegment::from("posts"),
                PathSegment::from(3),
                PathSegment::from("author")
            ]
        );
        assert_eq!(display_path(&p), "posts.3.author");
    }

    #[test]
    fn transport_event_uses_type_tag() {
        let ev = TransportEvent::Complete { id: TransferId(7) };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "complete", "id": 7})
        );
        let back: TransportEvent =
            serde_json::from_value(json!({"type": "value", "id": "v1", "value": [1, 2]})).unwrap();
        assert_eq!(back.type_name(), "value");
        assert!(back.into_progress().is_none());
    }

    #[test]
    fn response_shape_includes_path_and_final_flag() {
        let mut ext = JsonObject::new();
        ext.insert(IS_FINAL.into(), Value::Bool(true));
        let ev = DeliveryEvent::Patch {
            data: json!({"name": "Alice"}),
            path: vec!["user".into()],
            label: None,
            errors: None,
            extensions: ext,
        };
        assert!(ev.is_final());
        assert_eq!(
            ev.to_response(),
            json!({"data": {"name": "Alice"}, "path": ["user"], "extensions": {"is_final": true}})
        );
    }
}
