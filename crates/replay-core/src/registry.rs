// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Request registry: one record (and one replay channel) per [`RequestKey`].
//!
//! The registry is created per environment and shared by reference. On the
//! origin side it announces watched requests through a two-state queue; on
//! the consumer side it routes handoff progress by [`TransferId`] into the
//! matching record and re-issues requests the handoff abandoned.
//!
//! Each record has exactly one producer at a time ([`Producer`]). Claiming a
//! record is an atomic compare-and-set under the record's lock, so a local
//! fetch and a handoff announcement racing for the same key never both write
//! to its channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use replay_proto::{
    DeliveryEvent, ErrorPayload, OperationDescriptor, Progress, RequestKey, TransferId,
    TransportEvent,
};
use tracing::{debug, info, warn};

use crate::channel::{ReplayChannel, Subscription, Terminal};
use crate::lock;
use crate::queue::BackpressureQueue;

/// Which side of the handoff this registry lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server render pass: fetches and announces.
    Origin,
    /// Client hydration: replays what the origin announced.
    Consumer,
}

/// Who is currently writing a record's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    /// Nobody.
    Idle,
    /// A local network fetch.
    Fetching,
    /// Progress replayed from the handoff stream.
    Handoff,
}

/// Registry invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Progress arrived for a transfer id that was never started (or already ended).
    #[error("replay channel for {0} not found")]
    UnknownTransfer(TransferId),
    /// Watching is only meaningful on the origin side.
    #[error("watching requests is only supported on the origin side")]
    NotOrigin,
}

#[derive(Debug)]
struct RecordState {
    channel: ReplayChannel<DeliveryEvent>,
    producer: Producer,
    has_data: bool,
    is_complete: bool,
}

impl RecordState {
    fn fresh() -> Self {
        Self {
            channel: ReplayChannel::new(),
            producer: Producer::Idle,
            has_data: false,
            is_complete: false,
        }
    }
}

#[derive(Debug)]
struct RecordInner {
    key: RequestKey,
    operation: OperationDescriptor,
    state: Mutex<RecordState>,
}

/// Shared handle to one logical request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    inner: Arc<RecordInner>,
}

impl RequestRecord {
    /// New idle record for `operation`.
    pub fn new(operation: OperationDescriptor) -> Self {
        Self {
            inner: Arc::new(RecordInner {
                key: operation.key(),
                operation,
                state: Mutex::new(RecordState::fresh()),
            }),
        }
    }

    /// The record's key.
    pub fn key(&self) -> &RequestKey {
        &self.inner.key
    }

    /// Enough to re-issue the request.
    pub fn operation(&self) -> &OperationDescriptor {
        &self.inner.operation
    }

    /// True once any event was emitted on the current channel.
    pub fn has_data(&self) -> bool {
        lock(&self.inner.state).has_data
    }

    /// True once the current channel terminated.
    pub fn is_complete(&self) -> bool {
        lock(&self.inner.state).is_complete
    }

    /// Current producer.
    pub fn producer(&self) -> Producer {
        lock(&self.inner.state).producer
    }

    /// Handle to the current channel.
    pub fn channel(&self) -> ReplayChannel<DeliveryEvent> {
        lock(&self.inner.state).channel.clone()
    }

    /// Subscribe to the current channel (history replayed first).
    pub fn subscribe(&self) -> Subscription<DeliveryEvent> {
        lock(&self.inner.state).channel.subscribe()
    }

    /// True when both handles refer to the same record.
    pub fn same_record(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Become the record's only producer.
    ///
    /// Succeeds when the record is idle and has nothing to replay. A record
    /// whose last run failed is reset onto a fresh channel first, so a failed
    /// request is re-issued rather than replayed.
    pub fn try_claim(&self, producer: Producer) -> bool {
        let mut state = lock(&self.inner.state);
        if state.producer != Producer::Idle {
            return false;
        }
        if matches!(state.channel.terminal(), Some(Terminal::Error(_))) {
            *state = RecordState::fresh();
        }
        if state.has_data || state.is_complete {
            return false;
        }
        state.producer = producer;
        true
    }

    /// Emit an event on the current channel.
    pub fn emit(&self, event: DeliveryEvent) -> bool {
        let mut state = lock(&self.inner.state);
        let sent = state.channel.next(event);
        state.has_data |= sent;
        sent
    }

    /// Terminate the current channel with an error and release the producer.
    pub fn fail(&self, error: ErrorPayload) -> bool {
        let mut state = lock(&self.inner.state);
        state.is_complete = true;
        state.producer = Producer::Idle;
        state.channel.error(error)
    }

    /// Terminate the current channel successfully and release the producer.
    pub fn complete(&self) -> bool {
        let mut state = lock(&self.inner.state);
        state.is_complete = true;
        state.producer = Producer::Idle;
        state.channel.complete()
    }

    /// Apply one progress notification.
    pub fn apply(&self, progress: Progress) {
        match progress {
            Progress::Next(event) => {
                self.emit(event);
            }
            Progress::Error(error) => {
                self.fail(error);
            }
            Progress::Complete => {
                self.complete();
            }
        }
    }

    // Leaves the record idle on a fresh channel. Live subscribers follow it
    // there; the broken channel ends with `E_HANDOFF_ABANDONED`.
    fn abandon(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let broken = std::mem::replace(&mut *state, RecordState::fresh());
        broken.channel.hand_over(
            &state.channel,
            ErrorPayload::handoff_abandoned(&self.inner.key),
        )
    }
}

/// A request announced by the origin for forwarding over the handoff.
#[derive(Debug)]
pub struct WatchedRequest {
    /// Routing id for the progress that follows.
    pub id: TransferId,
    /// The request.
    pub operation: OperationDescriptor,
    /// The record's events, history first.
    pub events: Subscription<DeliveryEvent>,
}

impl WatchedRequest {
    /// The `started` event announcing this request.
    pub fn started_event(&self) -> TransportEvent {
        TransportEvent::Started {
            id: self.id,
            operation: self.operation.clone(),
        }
    }
}

/// Re-issues requests; implemented by the network layer.
pub trait RequestExecutor {
    /// Start `operation` as an ordinary request.
    fn execute_operation(&self, operation: OperationDescriptor);
}

#[derive(Debug)]
enum Route {
    // Progress feeds this record.
    Replay(RequestRecord),
    // Another producer owns the record; progress is dropped.
    Discard,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<RequestKey, RequestRecord>,
    simulated: BTreeMap<TransferId, Route>,
    next_transfer: u64,
}

/// Per-environment map of requests.
#[derive(Debug)]
pub struct RequestRegistry {
    role: Role,
    state: Mutex<RegistryState>,
    watch_queue: BackpressureQueue<WatchedRequest>,
}

impl RequestRegistry {
    /// Empty registry for one side of the handoff.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: Mutex::new(RegistryState::default()),
            watch_queue: BackpressureQueue::new(),
        }
    }

    /// Which side this registry lives on.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get-or-create the record for `operation`'s key.
    pub fn build(&self, operation: &OperationDescriptor) -> RequestRecord {
        let key = operation.key();
        let mut state = lock(&self.state);
        state
            .records
            .entry(key)
            .or_insert_with(|| RequestRecord::new(operation.clone()))
            .clone()
    }

    /// Insert-if-absent. Returns the record stored under its key.
    pub fn add(&self, record: RequestRecord) -> RequestRecord {
        let mut state = lock(&self.state);
        state
            .records
            .entry(record.key().clone())
            .or_insert(record)
            .clone()
    }

    /// Record for `key`, if built.
    pub fn get(&self, key: &RequestKey) -> Option<RequestRecord> {
        lock(&self.state).records.get(key).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    /// True when no record was built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a record ahead of execution (route preloading).
    pub fn preload(&self, operation: &OperationDescriptor) -> RequestRecord {
        let record = self.build(operation);
        debug!(key = %record.key(), "preloaded request");
        record
    }

    /// Announce `record` to the origin handoff. Origin only.
    pub fn watch(&self, record: &RequestRecord) -> Result<TransferId, RegistryError> {
        if self.role != Role::Origin {
            return Err(RegistryError::NotOrigin);
        }
        let id = {
            let mut state = lock(&self.state);
            state.next_transfer += 1;
            TransferId(state.next_transfer)
        };
        debug!(%id, key = %record.key(), "watching request");
        let Ok(()) = self.watch_queue.push(WatchedRequest {
            id,
            operation: record.operation().clone(),
            events: record.subscribe(),
        });
        Ok(id)
    }

    /// Deliver watched requests to `sink`, flushing those announced earlier.
    pub fn attach_watch_queue<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(WatchedRequest) + Send + 'static,
    {
        let Ok(flushed) = self.watch_queue.attach(move |watched| {
            sink(watched);
            Ok(())
        });
        flushed
    }

    /// Consumer side: the origin began `operation` under `id`.
    ///
    /// If the record already has another producer (a local fetch won the
    /// race), progress for `id` is discarded instead of interleaved.
    pub fn on_started(&self, id: TransferId, operation: &OperationDescriptor) -> RequestRecord {
        let record = self.build(operation);
        let route = if record.try_claim(Producer::Handoff) {
            info!(%id, key = %record.key(), "replaying request from handoff");
            Route::Replay(record.clone())
        } else {
            debug!(%id, key = %record.key(), "request already produced locally; discarding handoff");
            Route::Discard
        };
        lock(&self.state).simulated.insert(id, route);
        record
    }

    /// Consumer side: route progress for `id` to its record.
    pub fn on_progress(&self, id: TransferId, progress: Progress) -> Result<(), RegistryError> {
        let terminal = !matches!(progress, Progress::Next(_));
        let route = {
            let mut state = lock(&self.state);
            if terminal {
                state.simulated.remove(&id)
            } else {
                match state.simulated.get(&id) {
                    Some(Route::Replay(record)) => Some(Route::Replay(record.clone())),
                    Some(Route::Discard) => Some(Route::Discard),
                    None => None,
                }
            }
        };
        match route.ok_or(RegistryError::UnknownTransfer(id))? {
            Route::Replay(record) => record.apply(progress),
            Route::Discard => {}
        }
        Ok(())
    }

    /// Consumer side: dispatch one handoff event.
    pub fn handle_event(&self, event: TransportEvent) -> Result<(), RegistryError> {
        match event {
            TransportEvent::Started { id, operation } => {
                self.on_started(id, &operation);
                Ok(())
            }
            TransportEvent::Value { id, .. } => {
                debug!(%id, "registry ignores static value");
                Ok(())
            }
            progress => match progress.into_progress() {
                Some((id, progress)) => self.on_progress(id, progress),
                None => Ok(()),
            },
        }
    }

    /// Requests started over the handoff that have not finished.
    pub fn simulated_len(&self) -> usize {
        lock(&self.state).simulated.len()
    }

    /// Re-issue at most one abandoned request (lowest transfer id first).
    ///
    /// The record is reset onto a fresh channel and `executor` starts it
    /// again. Subscribers already attached keep the partial events they saw
    /// and continue with the re-issued request's events. Handles to the old
    /// channel end with `E_HANDOFF_ABANDONED`.
    pub fn rerun_simulated(&self, executor: &dyn RequestExecutor) -> Option<RequestKey> {
        loop {
            let (id, route) = lock(&self.state).simulated.pop_first()?;
            let Route::Replay(record) = route else {
                continue;
            };
            warn!(
                %id,
                key = %record.key(),
                "handoff closed before request finished; rerunning"
            );
            let moved = record.abandon();
            debug!(key = %record.key(), moved, "subscribers moved to the rerun");
            executor.execute_operation(record.operation().clone());
            return Some(record.key().clone());
        }
    }

    /// Re-issue every abandoned request. Returns their keys in rerun order.
    pub fn rerun_all_simulated(&self, executor: &dyn RequestExecutor) -> Vec<RequestKey> {
        let mut keys = Vec::new();
        while let Some(key) = self.rerun_simulated(executor) {
            keys.push(key);
        }
        keys
    }
}
