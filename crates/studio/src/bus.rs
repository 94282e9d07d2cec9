//! Event bus for broadcasting unit lifecycle and log events.
//!
//! [`EventBus`] wraps [`tokio::sync::broadcast`]:
//! - `publish()` never blocks and never fails, even without subscribers.
//! - Every [`Subscription`] sees events published after it subscribed, in
//!   publication order.
//! - A subscriber that falls more than `capacity` events behind silently skips
//!   the oldest ones; other subscribers are unaffected.
//! - Dropping a [`Subscription`] releases its slot.

use mcp_studio_core::Event;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus whose subscribers each lag by at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One live observer of the bus
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event; `None` once the bus is gone
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a stream suitable for a server-push response
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.rx).filter_map(|item| item.ok())
    }
}
