// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! History-preserving multicast channel.
//!
//! Every subscriber, whether it attached before the first event or after the
//! terminal one, observes the same total order: the full history, then live
//! events, then at most one terminal signal.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use replay_proto::ErrorPayload;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::lock;

/// How a channel ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    /// Producer finished normally.
    Complete,
    /// Producer failed.
    Error(ErrorPayload),
}

#[derive(Debug)]
enum Signal<T> {
    Next(T),
    Error(ErrorPayload),
    Complete,
}

#[derive(Debug)]
struct Shared<T> {
    history: Vec<T>,
    terminal: Option<Terminal>,
    subscribers: Vec<UnboundedSender<Signal<T>>>,
}

/// Multicast channel that replays its history to late subscribers.
#[derive(Debug)]
pub struct ReplayChannel<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for ReplayChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for ReplayChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ReplayChannel<T> {
    /// Open channel with empty history.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                history: Vec::new(),
                terminal: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Append `value` and deliver it to every live subscriber.
    ///
    /// Returns `false` (and drops the value) once the channel has terminated.
    pub fn next(&self, value: T) -> bool {
        let mut shared = lock(&self.shared);
        if shared.terminal.is_some() {
            return false;
        }
        shared
            .subscribers
            .retain(|tx| tx.send(Signal::Next(value.clone())).is_ok());
        shared.history.push(value);
        true
    }

    /// Terminate with an error. Only the first terminal signal wins.
    pub fn error(&self, error: ErrorPayload) -> bool {
        self.terminate(Terminal::Error(error))
    }

    /// Terminate successfully. Only the first terminal signal wins.
    pub fn complete(&self) -> bool {
        self.terminate(Terminal::Complete)
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        let mut shared = lock(&self.shared);
        if shared.terminal.is_some() {
            return false;
        }
        for tx in shared.subscribers.drain(..) {
            let _ = tx.send(terminal_signal(&terminal));
        }
        shared.terminal = Some(terminal);
        true
    }

    /// Subscribe: history first, then live events, then the terminal signal.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = lock(&self.shared);
        for value in &shared.history {
            let _ = tx.send(Signal::Next(value.clone()));
        }
        match &shared.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal_signal(terminal));
            }
            None => shared.subscribers.push(tx),
        }
        Subscription {
            rx,
            terminal: None,
        }
    }

    /// Move every live subscriber onto `successor`, then terminate this
    /// channel with `error`.
    ///
    /// Moved subscribers keep what they already received and continue with
    /// the successor's history and live events; they never see `error`.
    /// Later subscribers of this channel see its history and then `error`.
    /// Returns the number of subscribers moved.
    pub fn hand_over(&self, successor: &Self, error: ErrorPayload) -> usize {
        let moved: Vec<_> = {
            let mut shared = lock(&self.shared);
            if shared.terminal.is_some() {
                return 0;
            }
            shared.terminal = Some(Terminal::Error(error));
            shared.subscribers.drain(..).collect()
        };
        let count = moved.len();
        let mut next = lock(&successor.shared);
        for tx in moved {
            for value in &next.history {
                let _ = tx.send(Signal::Next(value.clone()));
            }
            match &next.terminal {
                Some(terminal) => {
                    let _ = tx.send(terminal_signal(terminal));
                }
                None => next.subscribers.push(tx),
            }
        }
        count
    }

    /// Events emitted so far.
    pub fn history(&self) -> Vec<T> {
        lock(&self.shared).history.clone()
    }

    /// Terminal signal, if the channel has ended.
    pub fn terminal(&self) -> Option<Terminal> {
        lock(&self.shared).terminal.clone()
    }

    /// True once a terminal signal was sent.
    pub fn is_terminated(&self) -> bool {
        lock(&self.shared).terminal.is_some()
    }

    /// True when both handles refer to the same channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

fn terminal_signal<T>(terminal: &Terminal) -> Signal<T> {
    match terminal {
        Terminal::Complete => Signal::Complete,
        Terminal::Error(err) => Signal::Error(err.clone()),
    }
}

/// One subscriber's view of a [`ReplayChannel`].
///
/// Yields `Ok(event)` for each event, one `Err` if the channel failed, and
/// then `None`.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: UnboundedReceiver<Signal<T>>,
    terminal: Option<Terminal>,
}

impl<T> Subscription<T> {
    /// Next event, the error, or `None` once finished.
    pub async fn recv(&mut self) -> Option<Result<T, ErrorPayload>> {
        StreamExt::next(self).await
    }

    /// How the channel ended, once this subscription has observed it.
    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    /// Read until the end; returns the events and how the channel ended.
    ///
    /// `None` means the channel was dropped without a terminal signal.
    pub async fn drain(mut self) -> (Vec<T>, Option<Terminal>) {
        let mut events = Vec::new();
        while let Some(item) = self.recv().await {
            if let Ok(event) = item {
                events.push(event);
            }
        }
        (events, self.terminal)
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T, ErrorPayload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminal.is_some() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Signal::Error(err))) => {
                this.terminal = Some(Terminal::Error(err.clone()));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Signal::Complete)) => {
                this.terminal = Some(Terminal::Complete);
                Poll::Ready(None)
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_full_history() {
        let ch = ReplayChannel::new();
        let mut early = ch.subscribe();
        ch.next(1);
        ch.next(2);
        let late = ch.subscribe();
        ch.next(3);
        ch.complete();

        assert_eq!(early.recv().await, Some(Ok(1)));
        let (rest, end) = early.drain().await;
        assert_eq!(rest, vec![2, 3]);
        assert_eq!(end, Some(Terminal::Complete));

        let (all, end) = late.drain().await;
        assert_eq!(all, vec![1, 2, 3]);
        assert_eq!(end, Some(Terminal::Complete));

        let (after, end) = ch.subscribe().drain().await;
        assert_eq!(after, vec![1, 2, 3]);
        assert_eq!(end, Some(Terminal::Complete));
    }

    #[tokio::test]
    async fn error_is_delivered_once_and_ends_the_stream() {
        let ch = ReplayChannel::new();
        let mut sub = ch.subscribe();
        ch.next("a");
        assert!(ch.error(ErrorPayload::transport("boom")));
        assert!(!ch.complete());
        assert!(!ch.next("late"));

        assert_eq!(sub.recv().await, Some(Ok("a")));
        let err = sub.recv().await.unwrap().unwrap_err();
        assert_eq!(err.name, "E_TRANSPORT");
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.recv().await, None);
        assert_eq!(ch.history(), vec!["a"]);
    }

    #[tokio::test]
    async fn hand_over_continues_live_subscribers_on_the_successor() {
        let old = ReplayChannel::new();
        let mut live = old.subscribe();
        old.next("partial");
        let fresh = ReplayChannel::new();
        assert_eq!(old.hand_over(&fresh, ErrorPayload::transport("cut")), 1);
        assert!(!old.next("late"));

        fresh.next("full");
        fresh.complete();

        assert_eq!(live.recv().await, Some(Ok("partial")));
        let (rest, end) = live.drain().await;
        assert_eq!(rest, vec!["full"]);
        assert_eq!(end, Some(Terminal::Complete));

        let (stale, stale_end) = old.subscribe().drain().await;
        assert_eq!(stale, vec!["partial"]);
        assert!(matches!(stale_end, Some(Terminal::Error(e)) if e.name == "E_TRANSPORT"));
    }

    #[tokio::test]
    async fn dropped_channel_ends_without_terminal() {
        let ch = ReplayChannel::<u8>::new();
        let sub = ch.subscribe();
        drop(ch);
        let (events, end) = sub.drain().await;
        assert!(events.is_empty());
        assert_eq!(end, None);
    }
}
