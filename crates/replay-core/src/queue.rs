// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-state queue: buffer until a sink attaches, then deliver immediately.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Mutex;

use crate::lock;

/// Receiver installed by [`BackpressureQueue::attach`].
pub type Sink<T, E> = Box<dyn FnMut(T) -> Result<(), E> + Send>;

enum State<T, E> {
    Buffering(VecDeque<T>),
    Attached(Sink<T, E>),
}

/// Queue that is either buffering or attached to a sink.
///
/// The attach transition flushes the buffer in order under the same lock
/// that guards [`push`](Self::push), so no item is delivered twice or
/// overtaken by a later one. A sink must not push into its own queue.
pub struct BackpressureQueue<T, E = Infallible> {
    state: Mutex<State<T, E>>,
}

impl<T, E> fmt::Debug for BackpressureQueue<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        let mut s = f.debug_struct("BackpressureQueue");
        match &*state {
            State::Buffering(items) => s.field("buffered", &items.len()),
            State::Attached(_) => s.field("attached", &true),
        };
        s.finish()
    }
}

impl<T, E> Default for BackpressureQueue<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> BackpressureQueue<T, E> {
    /// Empty queue in the buffering state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Buffering(VecDeque::new())),
        }
    }

    /// Deliver to the sink, or buffer when none is attached.
    pub fn push(&self, item: T) -> Result<(), E> {
        let mut state = lock(&self.state);
        match &mut *state {
            State::Buffering(items) => {
                items.push_back(item);
                Ok(())
            }
            State::Attached(sink) => sink(item),
        }
    }

    /// Flush buffered items into `sink`, then switch to immediate delivery.
    ///
    /// Every buffered item is offered to the sink; the first error is
    /// returned after the flush. Returns how many items were flushed.
    /// Attaching again replaces the previous sink.
    pub fn attach<F>(&self, sink: F) -> Result<usize, E>
    where
        F: FnMut(T) -> Result<(), E> + Send + 'static,
    {
        let mut sink: Sink<T, E> = Box::new(sink);
        let mut state = lock(&self.state);
        let buffered = match &mut *state {
            State::Buffering(items) => std::mem::take(items),
            State::Attached(_) => VecDeque::new(),
        };
        let flushed = buffered.len();
        let mut first_err = None;
        for item in buffered {
            if let Err(err) = sink(item) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        *state = State::Attached(sink);
        first_err.map_or(Ok(flushed), Err)
    }

    /// Return to buffering. Returns `true` if a sink was attached.
    pub fn detach(&self) -> bool {
        let mut state = lock(&self.state);
        let was_attached = matches!(&*state, State::Attached(_));
        if was_attached {
            *state = State::Buffering(VecDeque::new());
        }
        was_attached
    }

    /// True while a sink is attached.
    pub fn is_attached(&self) -> bool {
        matches!(&*lock(&self.state), State::Attached(_))
    }

    /// Items waiting for a sink.
    pub fn buffered_len(&self) -> usize {
        match &*lock(&self.state) {
            State::Buffering(items) => items.len(),
            State::Attached(_) => 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32) -> Result<(), Infallible> + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |v| {
            sink_seen.lock().unwrap().push(v);
            Ok(())
        })
    }

    #[test]
    fn buffers_then_flushes_in_order_exactly_once() {
        let q: BackpressureQueue<u32> = BackpressureQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.buffered_len(), 2);

        let (seen, sink) = recorder();
        assert_eq!(q.attach(sink).unwrap(), 2);
        q.push(3).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(q.buffered_len(), 0);
        assert!(q.is_attached());
    }

    #[test]
    fn detach_returns_to_buffering() {
        let q: BackpressureQueue<u32> = BackpressureQueue::new();
        let (seen, sink) = recorder();
        q.attach(sink).unwrap();
        q.push(1).unwrap();
        assert!(q.detach());
        assert!(!q.detach());
        q.push(2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(q.buffered_len(), 1);
    }

    #[test]
    fn flush_reports_first_error_but_delivers_everything() {
        let q: BackpressureQueue<u32, String> = BackpressureQueue::new();
        for v in 0..4 {
            q.push(v).unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let err = q
            .attach(move |v| {
                sink_seen.lock().unwrap().push(v);
                if v % 2 == 1 {
                    Err(format!("odd {v}"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err, "odd 1");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(q.push(5).unwrap_err(), "odd 5");
    }
}
