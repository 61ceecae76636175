// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Configuration for the replay runtime.
//!
//! [`ConfigService`] (de)serializes JSON values and delegates raw blob
//! storage to a [`ConfigStore`]: [`FsConfigStore`] in the platform config
//! directory, or [`MemoryConfigStore`] for tests and embedding.

pub mod config;
mod fs;

pub use config::{ConfigError, ConfigService, ConfigStore, MemoryConfigStore};
pub use fs::FsConfigStore;
