//! Event aggregator — dispatches application and lifecycle events to
//! registered handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::Payload;
use crate::message::Message;

/// Everything the distributor publishes.
#[derive(Debug, Clone)]
pub enum DistributorEvent<E> {
    /// An application event that arrived from a peer.
    Application(E),
    NodeConnected(SocketAddr),
    NodeDisconnected(SocketAddr),
    /// A frame was written to the peer's socket.
    MessageSent(Message<E>),
    /// A message could not be written or encoded.
    MessageError { message: Message<E>, cause: String },
    /// An inbound or outbound socket failed its handshake and was closed.
    HandshakeFailed {
        remote: Option<SocketAddr>,
        cause: String,
    },
}

/// Dispatch key for [`DistributorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Application,
    NodeConnected,
    NodeDisconnected,
    MessageSent,
    MessageError,
    HandshakeFailed,
}

impl<E> DistributorEvent<E> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Application(_) => EventKind::Application,
            Self::NodeConnected(_) => EventKind::NodeConnected,
            Self::NodeDisconnected(_) => EventKind::NodeDisconnected,
            Self::MessageSent(_) => EventKind::MessageSent,
            Self::MessageError { .. } => EventKind::MessageError,
            Self::HandshakeFailed { .. } => EventKind::HandshakeFailed,
        }
    }
}

/// A handler invoked synchronously on the publishing thread.
pub type EventHandler<E> = Arc<dyn Fn(&DistributorEvent<E>) + Send + Sync>;

/// Fire-and-forget publication to handlers keyed by [`EventKind`].
pub struct EventAggregator<E> {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler<E>>>>,
    catch_all: RwLock<Vec<EventHandler<E>>>,
    channels: RwLock<HashMap<EventKind, Vec<mpsc::UnboundedSender<DistributorEvent<E>>>>>,
}

impl<E: Payload> EventAggregator<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&DistributorEvent<E>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every event.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&DistributorEvent<E>) + Send + Sync + 'static,
    {
        self.catch_all.write().push(Arc::new(handler));
    }

    /// Receive events of one kind on a channel. The subscription is dropped
    /// on the first publish after the receiver goes away.
    pub fn subscribe_channel(&self, kind: EventKind) -> mpsc::UnboundedReceiver<DistributorEvent<E>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().entry(kind).or_default().push(tx);
        rx
    }

    /// Number of handlers registered for `kind`, excluding catch-all ones.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Number of live channel subscriptions for `kind`.
    pub fn channel_count(&self, kind: EventKind) -> usize {
        self.channels.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn publish(&self, event: DistributorEvent<E>) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or publish re-entrantly.
        let mut targets: Vec<EventHandler<E>> = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        targets.extend(self.catch_all.read().iter().cloned());

        trace!("Publishing {kind:?} to {} handler(s)", targets.len());
        for handler in targets {
            handler(&event);
        }

        let mut closed = false;
        if let Some(senders) = self.channels.read().get(&kind) {
            for tx in senders {
                closed |= tx.send(event.clone()).is_err();
            }
        }
        if closed {
            if let Some(senders) = self.channels.write().get_mut(&kind) {
                senders.retain(|tx| !tx.is_closed());
            }
        }
    }
}

impl<E: Payload> Default for EventAggregator<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr() -> SocketAddr {
        "127.0.0.1:1907".parse().unwrap()
    }

    #[test]
    fn test_dispatch_by_kind() {
        let events = EventAggregator::<String>::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected);
        events.subscribe(EventKind::NodeConnected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.publish(DistributorEvent::NodeConnected(addr()));
        events.publish(DistributorEvent::NodeDisconnected(addr()));
        events.publish(DistributorEvent::NodeConnected(addr()));

        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(events.handler_count(EventKind::NodeConnected), 1);
        assert_eq!(events.handler_count(EventKind::MessageSent), 0);
    }

    #[test]
    fn test_catch_all_sees_everything() {
        let events = EventAggregator::<String>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        events.subscribe_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.publish(DistributorEvent::Application("a".into()));
        events.publish(DistributorEvent::NodeDisconnected(addr()));
        events.publish(DistributorEvent::HandshakeFailed {
            remote: None,
            cause: "timeout".into(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let events = EventAggregator::<String>::new();
        let mut rx = events.subscribe_channel(EventKind::Application);

        events.publish(DistributorEvent::NodeConnected(addr()));
        events.publish(DistributorEvent::Application("payload".into()));

        match rx.recv().await {
            Some(DistributorEvent::Application(payload)) => assert_eq!(payload, "payload"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_channel_subscription_is_pruned() {
        let events = EventAggregator::<String>::new();
        let kept = events.subscribe_channel(EventKind::MessageSent);
        drop(events.subscribe_channel(EventKind::MessageSent));
        assert_eq!(events.channel_count(EventKind::MessageSent), 2);

        events.publish(DistributorEvent::MessageSent(Message::new("x".into())));
        assert_eq!(events.channel_count(EventKind::MessageSent), 1);

        drop(kept);
        events.publish(DistributorEvent::MessageSent(Message::new("y".into())));
        assert_eq!(events.channel_count(EventKind::MessageSent), 0);
        assert_eq!(events.handler_count(EventKind::MessageSent), 0);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let events = Arc::new(EventAggregator::<String>::new());
        let relay = Arc::clone(&events);
        events.subscribe(EventKind::NodeConnected, move |event| {
            if let DistributorEvent::NodeConnected(addr) = event {
                relay.publish(DistributorEvent::NodeDisconnected(*addr));
            }
        });
        let mut rx = events.subscribe_channel(EventKind::NodeDisconnected);

        events.publish(DistributorEvent::NodeConnected(addr()));
        assert!(matches!(rx.try_recv(), Ok(DistributorEvent::NodeDisconnected(_))));
    }
}
