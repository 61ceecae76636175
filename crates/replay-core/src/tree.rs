// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Path-addressed JSON document assembled from incremental patches.

use replay_proto::{display_path, JsonObject, PathSegment};
use serde_json::Value;

/// Navigation failures. Each carries the path prefix where the walk stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// An object has no field for the next key.
    #[error("no field at {path}")]
    MissingSegment {
        /// Path up to and including the missing key.
        path: String,
    },
    /// A list was required (index step, or a stream target).
    #[error("expected a list at {path}")]
    ExpectedList {
        /// Path of the offending node.
        path: String,
    },
    /// An object was required (key step, or a merge target).
    #[error("expected an object at {path}")]
    ExpectedObject {
        /// Path of the offending node.
        path: String,
    },
    /// An index step went past the end of a list.
    #[error("index {index} out of bounds at {path}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Path of the list.
        path: String,
    },
}

/// The single document being assembled for one response stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseTree {
    root: Value,
}

impl ResponseTree {
    /// Tree rooted at `root` (the initial result's `data`).
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Current document.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Consume the tree, returning the document.
    pub fn into_inner(self) -> Value {
        self.root
    }

    /// Node at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Result<&Value, TreeError> {
        let mut node = &self.root;
        for (depth, segment) in path.iter().enumerate() {
            let here = &path[..depth];
            node = match segment {
                PathSegment::Key(key) => node
                    .as_object()
                    .ok_or_else(|| expected_object(here))?
                    .get(key)
                    .ok_or_else(|| missing(&path[..=depth]))?,
                PathSegment::Index(index) => {
                    let list = node.as_array().ok_or_else(|| expected_list(here))?;
                    list.get(*index)
                        .ok_or_else(|| out_of_bounds(*index, here))?
                }
            };
        }
        Ok(node)
    }

    /// Mutable node at `path`.
    pub fn get_mut(&mut self, path: &[PathSegment]) -> Result<&mut Value, TreeError> {
        let mut node = &mut self.root;
        for (depth, segment) in path.iter().enumerate() {
            let here = &path[..depth];
            node = match segment {
                PathSegment::Key(key) => node
                    .as_object_mut()
                    .ok_or_else(|| expected_object(here))?
                    .get_mut(key)
                    .ok_or_else(|| missing(&path[..=depth]))?,
                PathSegment::Index(index) => {
                    let list = node.as_array_mut().ok_or_else(|| expected_list(here))?;
                    list.get_mut(*index)
                        .ok_or_else(|| out_of_bounds(*index, here))?
                }
            };
        }
        Ok(node)
    }

    /// True when `path` resolves to a list.
    pub fn is_list(&self, path: &[PathSegment]) -> bool {
        matches!(self.get(path), Ok(Value::Array(_)))
    }

    /// Shallow key union of `patch` into the object at `path`.
    pub fn merge_object(&mut self, path: &[PathSegment], patch: &JsonObject) -> Result<(), TreeError> {
        let target = self
            .get_mut(path)?
            .as_object_mut()
            .ok_or_else(|| expected_object(path))?;
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Append to the list at `path`, returning the new item's index.
    pub fn push_item(&mut self, path: &[PathSegment], item: Value) -> Result<usize, TreeError> {
        let list = self
            .get_mut(path)?
            .as_array_mut()
            .ok_or_else(|| expected_list(path))?;
        list.push(item);
        Ok(list.len() - 1)
    }
}

fn missing(path: &[PathSegment]) -> TreeError {
    TreeError::MissingSegment {
        path: display_path(path),
    }
}

fn expected_list(path: &[PathSegment]) -> TreeError {
    TreeError::ExpectedList {
        path: display_path(path),
    }
}

fn expected_object(path: &[PathSegment]) -> TreeError {
    TreeError::ExpectedObject {
        path: display_path(path),
    }
}

fn out_of_bounds(index: usize, path: &[PathSegment]) -> TreeError {
    TreeError::IndexOutOfBounds {
        index,
        path: display_path(path),
    }
}
