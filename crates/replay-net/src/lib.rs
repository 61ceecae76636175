// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replay network: issues GraphQL requests, reassembles incremental
//! responses into a request's replay channel, and pumps the handoff between
//! the origin (server render) and consumer (client hydration) environments.
//!
//! ```no_run
//! # async fn demo() {
//! use std::sync::Arc;
//! use replay_core::{RequestRegistry, Role};
//! use replay_net::{NetworkConfig, ReplayNetwork};
//! use replay_proto::OperationDescriptor;
//!
//! let registry = Arc::new(RequestRegistry::new(Role::Consumer));
//! let network = ReplayNetwork::with_reqwest(NetworkConfig::default(), registry);
//! let (events, terminal) = network
//!     .execute(&OperationDescriptor::new("Feed").with_text("{ feed @stream { id } }"), None)
//!     .drain()
//!     .await;
//! # let _ = (events, terminal);
//! # }
//! ```
#![forbid(unsafe_code)]

pub mod abort;
pub mod config;
pub mod fetch;
pub mod handoff;
mod network;

pub use abort::{AbortController, AbortSignal};
pub use config::{NetworkConfig, CONFIG_KEY};
#[cfg(feature = "reqwest")]
pub use fetch::ReqwestFetcher;
pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
pub use handoff::{consume_handoff, read_transport, write_transport, HandoffError};
pub use network::ReplayNetwork;
