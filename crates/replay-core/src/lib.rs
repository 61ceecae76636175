// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reassembly and replay of GraphQL incremental delivery.
//!
//! * [`IncrementalReducer`] folds one response stream into [`DeliveryEvent`]s.
//! * [`ReplayChannel`] multicasts those events with full history.
//! * [`RequestRegistry`] owns one [`RequestRecord`] (and channel) per request key.
//! * [`ServerTransport`] / [`ClientTransport`] carry request lifecycles from the
//!   origin environment to the consumer.
//!
//! [`DeliveryEvent`]: replay_proto::DeliveryEvent
#![forbid(unsafe_code)]

pub mod channel;
pub mod queue;
pub mod reducer;
pub mod registry;
pub mod transport;
pub mod tree;

pub use channel::{ReplayChannel, Subscription, Terminal};
pub use queue::BackpressureQueue;
pub use reducer::{IncrementalReducer, PendingPart, ReducerError};
pub use registry::{
    Producer, RegistryError, RequestExecutor, RequestRecord, RequestRegistry, Role, WatchedRequest,
};
pub use transport::{ClientTransport, ServerTransport, TransportStream};
pub use tree::{ResponseTree, TreeError};

use std::sync::{Mutex, MutexGuard, PoisonError};

// Poisoning is recovered, not propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
