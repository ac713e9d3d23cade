//! Pattern-matched, at-most-once message bus
//!
//! A [`Mailbox`] holds an unordered multiset of pending messages. Receivers
//! describe what they want with a [`Matcher`]; each message is claimed by
//! exactly one receiver. Messages nobody matches stay pending.
//!
//! Delivery order:
//! - a receive first scans already-pending messages in arrival order;
//! - a live send goes to the earliest-registered waiter whose matcher accepts it.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// Predicate over mailbox messages.
pub trait Matcher<T>: Send {
    fn matches(&self, message: &T) -> bool;
}

impl<T, F> Matcher<T> for F
where
    F: Fn(&T) -> bool + Send,
{
    fn matches(&self, message: &T) -> bool {
        self(message)
    }
}

/// Matches every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl<T> Matcher<T> for Any {
    fn matches(&self, _message: &T) -> bool {
        true
    }
}

struct Waiter<T> {
    id: u64,
    matcher: Box<dyn Matcher<T>>,
    tx: oneshot::Sender<T>,
}

struct State<T> {
    pending: VecDeque<T>,
    waiters: Vec<Waiter<T>>,
    next_waiter: u64,
}

/// Multi-producer, multi-consumer message bus with pattern-matched receive.
///
/// Cloning a `Mailbox` yields another handle to the same queue.
pub struct Mailbox<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mailbox")
            .field("pending", &state.pending.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: VecDeque::new(),
                waiters: Vec::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Number of messages nobody has claimed yet
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Deliver a message to the first matching waiter, or queue it.
    ///
    /// Never blocks on a receiver and never fails.
    pub fn send(&self, message: T) {
        if let Some(message) = self.hand_over(message) {
            self.state.lock().pending.push_back(message);
        }
    }

    /// Put back a message that was handed to a receiver which then went
    /// away. It keeps its place ahead of everything that arrived later.
    fn requeue(&self, message: T) {
        if let Some(message) = self.hand_over(message) {
            self.state.lock().pending.push_front(message);
        }
    }

    /// Give `message` to the first live waiter that matches it. Returns the
    /// message when nobody took it.
    fn hand_over(&self, message: T) -> Option<T> {
        let mut state = self.state.lock();
        let mut message = message;
        let mut idx = 0;
        while idx < state.waiters.len() {
            if !state.waiters[idx].matcher.matches(&message) {
                idx += 1;
                continue;
            }
            let waiter = state.waiters.remove(idx);
            match waiter.tx.send(message) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "mailbox message claimed by waiter");
                    return None;
                }
                // Receiver went away between registering and now.
                Err(returned) => message = returned,
            }
        }
        Some(message)
    }

    /// Wait for a message accepted by `matcher` and claim it.
    ///
    /// Dropping the returned future before it completes releases the claim:
    /// a message handed over in the meantime goes back to the mailbox.
    pub async fn receive<M>(&self, matcher: M) -> T
    where
        M: Matcher<T> + 'static,
    {
        let rx = {
            let mut state = self.state.lock();
            if let Some(pos) = state.pending.iter().position(|m| matcher.matches(m)) {
                if let Some(message) = state.pending.remove(pos) {
                    return message;
                }
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push(Waiter {
                id,
                matcher: Box::new(matcher),
                tx,
            });
            Registration {
                mailbox: self.clone(),
                id,
                rx: Some(rx),
            }
        };
        rx.await
    }

    /// Claim any message.
    pub async fn receive_any(&self) -> T {
        self.receive(Any).await
    }

    /// Claim an already-pending message without waiting.
    pub fn try_receive<M>(&self, matcher: M) -> Option<T>
    where
        M: Matcher<T> + 'static,
    {
        let mut state = self.state.lock();
        let pos = state.pending.iter().position(|m| matcher.matches(m))?;
        state.pending.remove(pos)
    }

    fn deregister(&self, id: u64) {
        self.state.lock().waiters.retain(|w| w.id != id);
    }
}

impl<T: Send + 'static> Mailbox<T> {
    /// Forward every item of an external source into this mailbox.
    ///
    /// Forwarding stops when the source ends or the returned [`Watch`] is
    /// dropped, whichever comes first.
    pub fn watch<S>(&self, source: S) -> Watch
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let mailbox = self.clone();
        let task = tokio::spawn(async move {
            futures::pin_mut!(source);
            while let Some(item) = source.next().await {
                mailbox.send(item);
            }
        });
        Watch { task }
    }
}

/// A pending registration in the waiter list.
struct Registration<T> {
    mailbox: Mailbox<T>,
    id: u64,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> std::future::Future for Registration<T> {
    type Output = T;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<T> {
        let Some(rx) = self.rx.as_mut() else {
            return std::task::Poll::Pending;
        };
        match std::pin::Pin::new(rx).poll(cx) {
            std::task::Poll::Ready(Ok(message)) => {
                self.rx = None;
                std::task::Poll::Ready(message)
            }
            // The sender lives in the waiter list, which we still own a handle to.
            std::task::Poll::Ready(Err(_)) => {
                self.rx = None;
                std::task::Poll::Pending
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        self.mailbox.deregister(self.id);
        rx.close();
        if let Ok(message) = rx.try_recv() {
            self.mailbox.requeue(message);
        }
    }
}

/// Scope guard for [`Mailbox::watch`]. Dropping it stops forwarding.
#[derive(Debug)]
pub struct Watch {
    task: JoinHandle<()>,
}

impl Watch {
    /// Whether the source has been fully drained
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        to: &'static str,
        n: u32,
    }

    fn to(name: &'static str) -> impl Fn(&Msg) -> bool + Send + 'static {
        move |m: &Msg| m.to == name
    }

    #[tokio::test]
    async fn test_receive_pending_message() {
        let mailbox = Mailbox::new();
        mailbox.send(Msg { to: "a", n: 1 });

        let got = mailbox.receive(to("a")).await;
        assert_eq!(got, Msg { to: "a", n: 1 });
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_before_send() {
        let mailbox = Mailbox::new();
        let rx = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.receive(to("a")).await }
        });
        tokio::task::yield_now().await;

        mailbox.send(Msg { to: "a", n: 7 });
        assert_eq!(rx.await.unwrap().n, 7);
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_messages_stay_pending() {
        let mailbox = Mailbox::new();
        mailbox.send(Msg { to: "b", n: 1 });
        mailbox.send(Msg { to: "a", n: 2 });

        assert_eq!(mailbox.receive(to("a")).await.n, 2);
        assert_eq!(mailbox.pending(), 1);
        assert!(mailbox.try_receive(to("a")).is_none());
        assert_eq!(mailbox.try_receive(to("b")).map(|m| m.n), Some(1));
    }

    #[tokio::test]
    async fn test_pending_claimed_in_arrival_order() {
        let mailbox = Mailbox::new();
        for n in 0..3 {
            mailbox.send(Msg { to: "a", n });
        }
        assert_eq!(mailbox.receive_any().await.n, 0);
        assert_eq!(mailbox.receive_any().await.n, 1);
        assert_eq!(mailbox.receive_any().await.n, 2);
    }

    #[tokio::test]
    async fn test_live_send_goes_to_first_subscriber() {
        let mailbox: Mailbox<Msg> = Mailbox::new();
        let first = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.receive_any().await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let mailbox = mailbox.clone();
            async move { mailbox.receive_any().await }
        });
        tokio::task::yield_now().await;

        mailbox.send(Msg { to: "a", n: 1 });
        mailbox.send(Msg { to: "a", n: 2 });

        assert_eq!(first.await.unwrap().n, 1);
        assert_eq!(second.await.unwrap().n, 2);
    }

    #[tokio::test]
    async fn test_message_delivered_once_under_contention() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let mut receivers = Vec::new();
        for _ in 0..16 {
            let mailbox = mailbox.clone();
            receivers.push(tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(200), mailbox.receive_any())
                    .await
                    .ok()
            }));
        }
        for n in 0..8 {
            mailbox.send(n);
        }

        let mut claimed = Vec::new();
        for rx in receivers {
            if let Some(n) = rx.await.unwrap() {
                claimed.push(n);
            }
        }
        claimed.sort();
        assert_eq!(claimed, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dropped_receive_does_not_swallow_message() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        {
            let pending = mailbox.receive_any();
            futures::pin_mut!(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
        }
        mailbox.send(5);
        assert_eq!(mailbox.pending(), 1);
        assert_eq!(mailbox.receive_any().await, 5);
    }

    #[tokio::test]
    async fn test_released_message_keeps_its_place() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        {
            let pending = mailbox.receive_any();
            futures::pin_mut!(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
            // Handed to the registered receiver, which is then dropped unread.
            mailbox.send(1);
            mailbox.send(2);
        }
        assert_eq!(mailbox.pending(), 2);
        assert_eq!(mailbox.try_receive(Any), Some(1));
        assert_eq!(mailbox.try_receive(Any), Some(2));
    }

    #[tokio::test]
    async fn test_watch_forwards_stream() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let _watch = mailbox.watch(futures::stream::iter(vec![1, 2, 3]));

        assert_eq!(mailbox.receive(|n: &u32| *n == 3).await, 3);
        assert_eq!(mailbox.receive_any().await, 1);
        assert_eq!(mailbox.receive_any().await, 2);
    }

    #[tokio::test]
    async fn test_watch_stops_when_dropped() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let watch = mailbox.watch(tokio_stream_from(rx));

        tx.send(1).unwrap();
        assert_eq!(mailbox.receive_any().await, 1);

        drop(watch);
        tokio::task::yield_now().await;
        let _ = tx.send(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mailbox.pending(), 0);
    }

    fn tokio_stream_from(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<u32>,
    ) -> impl Stream<Item = u32> + Send + 'static {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}
