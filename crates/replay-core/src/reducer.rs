// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Incremental delivery reducer.
//!
//! Folds the GraphQL incremental result sequence of one response stream into
//! flat, path-addressed [`DeliveryEvent`]s:
//!
//! * an initial result replaces the tree and yields `Root`
//! * `pending` entries register parts before the same result's patches run
//! * `items` patches append to the list at the part's path, one `Item` each
//! * `data` patches merge into the part's accumulator and the live tree
//! * `completed` entries yield `Patch` (accumulated data, or `null` for lists)
//!
//! Every event carries the source result's extensions plus `is_final`.

use std::collections::HashMap;

use replay_proto::{
    display_path, CompletedEntry, DeliveryEvent, ExecutionResult, IncrementalEntry, JsonObject,
    PathSegment, ResponsePath, IS_FINAL,
};
use serde_json::Value;
use tracing::debug;

use crate::tree::{ResponseTree, TreeError};

/// Fatal reducer failures. The stream cannot continue after one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReducerError {
    /// A patch addressed a location the tree does not have.
    #[error("patch for part {id} cannot be applied: {source}")]
    Tree {
        /// Pending part id.
        id: String,
        /// Navigation failure.
        #[source]
        source: TreeError,
    },
    /// Declared and actual response shapes disagree.
    #[error("part {id}: expected {expected} at {path}")]
    Shape {
        /// Pending part id.
        id: String,
        /// "a list" or "an object".
        expected: &'static str,
        /// Offending location.
        path: String,
    },
}

/// An outstanding deferred fragment or streamed list.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPart {
    /// Where the part lands in the tree.
    pub path: ResponsePath,
    /// Selection label.
    pub label: Option<String>,
    /// Fields merged so far.
    pub data: Value,
    /// Errors reported by patches and the completion.
    pub errors: Vec<Value>,
}

/// Per-stream reducer state. Build one per response stream.
#[derive(Debug, Default)]
pub struct IncrementalReducer {
    pending_parts: HashMap<String, PendingPart>,
    data_tree: ResponseTree,
}

impl IncrementalReducer {
    /// Fresh reducer with an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// The document assembled so far.
    pub fn tree(&self) -> &ResponseTree {
        &self.data_tree
    }

    /// Parts announced but not yet completed.
    pub fn pending_len(&self) -> usize {
        self.pending_parts.len()
    }

    /// Reduce one batch of results, in arrival order, calling `emit` per event.
    ///
    /// Events emitted before an error stay emitted.
    pub fn on_next<F>(&mut self, results: &[ExecutionResult], mut emit: F) -> Result<(), ReducerError>
    where
        F: FnMut(DeliveryEvent),
    {
        for result in results {
            let extensions = final_extensions(result);
            let initial = result.is_initial();

            if initial {
                let data = result.data.clone().unwrap_or(Value::Null);
                self.data_tree = ResponseTree::new(data.clone());
                emit(DeliveryEvent::Root {
                    data,
                    errors: result.errors.clone(),
                    extensions: extensions.clone(),
                });
            }

            for pending in &result.pending {
                self.pending_parts.insert(
                    pending.id.clone(),
                    PendingPart {
                        path: pending.path.clone(),
                        label: pending.label.clone(),
                        data: Value::Object(JsonObject::new()),
                        errors: Vec::new(),
                    },
                );
            }

            if initial {
                continue;
            }
            for entry in &result.incremental {
                self.apply_incremental(entry, &extensions, &mut emit)?;
            }
            for completed in &result.completed {
                self.apply_completed(completed, &extensions, &mut emit);
            }
        }
        Ok(())
    }

    /// Convenience form of [`on_next`](Self::on_next) collecting the events.
    pub fn reduce(&mut self, results: &[ExecutionResult]) -> Result<Vec<DeliveryEvent>, ReducerError> {
        let mut out = Vec::new();
        self.on_next(results, |event| out.push(event))?;
        Ok(out)
    }

    fn apply_incremental<F>(
        &mut self,
        entry: &IncrementalEntry,
        extensions: &JsonObject,
        emit: &mut F,
    ) -> Result<(), ReducerError>
    where
        F: FnMut(DeliveryEvent),
    {
        let Some(part) = self.pending_parts.get_mut(&entry.id) else {
            debug!(id = %entry.id, "ignoring patch for unknown part");
            return Ok(());
        };
        if let Some(errors) = &entry.errors {
            part.errors.extend(errors.iter().cloned());
        }

        if let Some(data) = &entry.data {
            let patch = data.as_object().ok_or_else(|| ReducerError::Shape {
                id: entry.id.clone(),
                expected: "an object",
                path: display_path(&part.path),
            })?;
            let sub_path = entry.sub_path.as_deref().unwrap_or_default();
            let mut target = part.path.clone();
            target.extend_from_slice(sub_path);

            self.data_tree
                .merge_object(&target, patch)
                .map_err(|source| tree_error(&entry.id, source))?;

            let local = descend_or_create(&mut part.data, sub_path);
            if let Value::Object(fields) = local {
                for (key, value) in patch {
                    fields.insert(key.clone(), value.clone());
                }
            }
        } else if let Some(items) = &entry.items {
            if !self.data_tree.is_list(&part.path) {
                return Err(match self.data_tree.get(&part.path) {
                    Err(source) => tree_error(&entry.id, source),
                    Ok(_) => ReducerError::Shape {
                        id: entry.id.clone(),
                        expected: "a list",
                        path: display_path(&part.path),
                    },
                });
            }
            for item in items {
                let index = self
                    .data_tree
                    .push_item(&part.path, item.clone())
                    .map_err(|source| tree_error(&entry.id, source))?;
                let mut path = part.path.clone();
                path.push(PathSegment::Index(index));
                emit(DeliveryEvent::Item {
                    data: item.clone(),
                    path,
                    label: part.label.clone(),
                    extensions: extensions.clone(),
                });
            }
        }
        Ok(())
    }

    fn apply_completed<F>(&mut self, completed: &CompletedEntry, extensions: &JsonObject, emit: &mut F)
    where
        F: FnMut(DeliveryEvent),
    {
        let Some(mut part) = self.pending_parts.remove(&completed.id) else {
            debug!(id = %completed.id, "ignoring completion for unknown part");
            return;
        };
        if let Some(errors) = &completed.errors {
            part.errors.extend(errors.iter().cloned());
        }
        // Items of a finished list were already emitted one by one.
        let data = if self.data_tree.is_list(&part.path) {
            Value::Null
        } else {
            part.data
        };
        emit(DeliveryEvent::Patch {
            data,
            path: part.path,
            label: part.label,
            errors: (!part.errors.is_empty()).then_some(part.errors),
            extensions: extensions.clone(),
        });
    }
}

fn final_extensions(result: &ExecutionResult) -> JsonObject {
    let mut extensions = result.extensions.clone().unwrap_or_default();
    extensions.insert(IS_FINAL.to_string(), Value::Bool(!result.has_next));
    extensions
}

fn tree_error(id: &str, source: TreeError) -> ReducerError {
    match source {
        TreeError::ExpectedList { path } => ReducerError::Shape {
            id: id.to_string(),
            expected: "a list",
            path,
        },
        source => ReducerError::Tree {
            id: id.to_string(),
            source,
        },
    }
}

// Accumulators mirror the tree's shape below the part's path.
fn descend_or_create<'a>(mut node: &'a mut Value, path: &[PathSegment]) -> &'a mut Value {
    for segment in path {
        node = match segment {
            PathSegment::Key(key) => {
                if !node.is_object() {
                    *node = Value::Object(JsonObject::new());
                }
                match node {
                    Value::Object(fields) => fields
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(JsonObject::new())),
                    other => other,
                }
            }
            PathSegment::Index(index) => {
                if !node.is_array() {
                    *node = Value::Array(Vec::new());
                }
                match node {
                    Value::Array(items) => {
                        if items.len() <= *index {
                            items.resize(*index + 1, Value::Null);
                        }
                        let slot = &mut items[*index];
                        if slot.is_null() {
                            *slot = Value::Object(JsonObject::new());
                        }
                        slot
                    }
                    other => other,
                }
            }
        };
    }
    node
}
