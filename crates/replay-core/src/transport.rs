// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Handoff transports.
//!
//! [`ServerTransport`] (origin) turns watched requests into an ordered stream
//! of [`TransportEvent`]s and closes it only once every forwarded request
//! finished *and* [`close_once_finished`](ServerTransport::close_once_finished)
//! was called. [`ClientTransport`] (consumer) buffers request events until a
//! handler attaches and keeps static values for one-shot reads.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use replay_proto::{ErrorPayload, Progress, TransferId, TransportEvent};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::channel::Terminal;
use crate::lock;
use crate::queue::BackpressureQueue;
use crate::registry::{RegistryError, RequestRegistry, WatchedRequest};

#[derive(Debug)]
struct ServerState {
    tx: Option<UnboundedSender<TransportEvent>>,
    ongoing: HashSet<TransferId>,
    should_close: bool,
}

impl ServerState {
    fn send(&self, event: TransportEvent) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    fn close_if_finished(&mut self) {
        if self.should_close && self.ongoing.is_empty() && self.tx.take().is_some() {
            info!("handoff stream closed");
        }
    }
}

/// Origin side of the handoff.
#[derive(Debug, Clone)]
pub struct ServerTransport {
    state: Arc<Mutex<ServerState>>,
}

/// Ordered events produced by a [`ServerTransport`]; ends when it closes.
#[derive(Debug)]
pub struct TransportStream {
    rx: UnboundedReceiver<TransportEvent>,
}

impl TransportStream {
    /// Next event, or `None` once the transport closed.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

impl Stream for TransportStream {
    type Item = TransportEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl ServerTransport {
    /// Open transport and the stream it feeds.
    pub fn new() -> (Self, TransportStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(Mutex::new(ServerState {
                tx: Some(tx),
                ongoing: HashSet::new(),
                should_close: false,
            })),
        };
        (transport, TransportStream { rx })
    }

    /// Forward `registry`'s watched requests, including those announced before now.
    ///
    /// Attach before [`close_once_finished`](Self::close_once_finished):
    /// requests still buffered in the registry are not ongoing yet, so an
    /// earlier close request does not wait for them. Returns how many
    /// buffered requests were forwarded; any the closed stream refused are
    /// logged.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach_registry(&self, registry: &RequestRegistry) -> usize {
        let transport = self.clone();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&forwarded);
        let flushed = registry.attach_watch_queue(move |watched| {
            if transport.dispatch_request_started(watched) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let forwarded = forwarded.load(Ordering::SeqCst).min(flushed);
        if forwarded < flushed {
            warn!(
                refused = flushed - forwarded,
                "registry attached after the handoff closed; requests not forwarded"
            );
        }
        forwarded
    }

    /// Enqueue `started`, then forward the request's progress until it ends.
    ///
    /// Returns `false` when the stream is already closed.
    /// Must be called inside a tokio runtime.
    pub fn dispatch_request_started(&self, watched: WatchedRequest) -> bool {
        let WatchedRequest {
            id,
            operation,
            mut events,
        } = watched;
        {
            let mut state = lock(&self.state);
            if !state.send(TransportEvent::Started { id, operation }) {
                debug!(%id, "handoff already closed; request not forwarded");
                return false;
            }
            state.ongoing.insert(id);
        }
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(item) = events.recv().await {
                if let Ok(event) = item {
                    transport.forward(id, Progress::Next(event));
                }
            }
            let last = match events.terminal() {
                Some(Terminal::Complete) => Progress::Complete,
                Some(Terminal::Error(err)) => Progress::Error(err.clone()),
                None => Progress::Error(ErrorPayload::transport(
                    "request channel dropped before finishing",
                )),
            };
            transport.forward(id, last);
            transport.finalize(id);
        });
        true
    }

    fn forward(&self, id: TransferId, progress: Progress) {
        lock(&self.state).send(TransportEvent::progress(id, progress));
    }

    fn finalize(&self, id: TransferId) {
        let mut state = lock(&self.state);
        state.ongoing.remove(&id);
        debug!(%id, remaining = state.ongoing.len(), "request finished on handoff");
        state.close_if_finished();
    }

    /// Send an out-of-band value. Returns `false` once closed.
    pub fn stream_value(&self, id: impl Into<String>, value: Value) -> bool {
        lock(&self.state).send(TransportEvent::Value {
            id: id.into(),
            value,
        })
    }

    /// Close once every forwarded request has finished.
    ///
    /// Only requests already dispatched count as ongoing. Call
    /// [`attach_registry`](Self::attach_registry) first, or requests the
    /// registry buffered will find the stream closed.
    pub fn close_once_finished(&self) {
        let mut state = lock(&self.state);
        state.should_close = true;
        state.close_if_finished();
    }

    /// Requests still being forwarded.
    pub fn ongoing(&self) -> usize {
        lock(&self.state).ongoing.len()
    }

    /// True once the stream has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).tx.is_none()
    }
}

/// Consumer side of the handoff.
#[derive(Debug, Default)]
pub struct ClientTransport {
    events: BackpressureQueue<TransportEvent, RegistryError>,
    values: Mutex<HashMap<String, Value>>,
}

impl ClientTransport {
    /// Empty transport in the buffering state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one event from the handoff stream.
    ///
    /// Values are stored; request events go to the handler, or are buffered
    /// until one attaches.
    pub fn push_event(&self, event: TransportEvent) -> Result<(), RegistryError> {
        match event {
            TransportEvent::Value { id, value } => {
                lock(&self.values).insert(id, value);
                Ok(())
            }
            event => self.events.push(event),
        }
    }

    /// Attach the request-event handler: buffered events first, in order,
    /// then each new event immediately.
    pub fn set_on_query_event<F>(&self, handler: F) -> Result<usize, RegistryError>
    where
        F: FnMut(TransportEvent) -> Result<(), RegistryError> + Send + 'static,
    {
        self.events.attach(handler)
    }

    /// Route request events into `registry`.
    pub fn attach_registry(&self, registry: Arc<RequestRegistry>) -> Result<usize, RegistryError> {
        self.set_on_query_event(move |event| registry.handle_event(event))
    }

    /// Request events waiting for a handler.
    pub fn buffered_len(&self) -> usize {
        self.events.buffered_len()
    }

    /// Take a static value; each is returned at most once.
    pub fn take_value(&self, id: &str) -> Option<Value> {
        lock(&self.values).remove(id)
    }
}

/// Collect a transport stream until it closes.
pub async fn collect_stream(stream: TransportStream) -> Vec<TransportEvent> {
    stream.collect().await
}
