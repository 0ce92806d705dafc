//! Distributor — routes application events between the local event bus and
//! the messaging layer.
//!
//! Outgoing messages with no targets are broadcast to every known peer;
//! targeted messages are sent to each target individually. Incoming messages
//! are unwrapped and their payload published locally as
//! [`DistributorEvent::Application`].

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Payload;
use crate::auth::{AcceptAll, ConnectionAuthenticator};
use crate::config::DistributorConfig;
use crate::error::DistributorError;
use crate::events::{DistributorEvent, EventAggregator};
use crate::message::Message;
use crate::messaging::{MessagingService, TcpMessagingService};
use crate::serializer::Serializer;

/// Entry point for applications: distribute events, receive them as
/// [`DistributorEvent::Application`] on [`events`](Self::events).
pub struct DistributorService<E> {
    messaging: Arc<dyn MessagingService<E>>,
    events: Arc<EventAggregator<E>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message<E>>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<E: Payload> DistributorService<E> {
    /// Route over an existing messaging service. `inbound` carries the
    /// messages the service decodes from its peers.
    pub fn new(
        messaging: Arc<dyn MessagingService<E>>,
        events: Arc<EventAggregator<E>>,
        inbound: mpsc::UnboundedReceiver<Message<E>>,
    ) -> Self {
        Self {
            messaging,
            events,
            inbound: Mutex::new(Some(inbound)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// A TCP distributor that accepts every peer.
    pub fn over_tcp(config: DistributorConfig, serializer: Arc<dyn Serializer<E>>) -> Self {
        Self::over_tcp_with(config, serializer, Arc::new(AcceptAll))
    }

    pub fn over_tcp_with(
        config: DistributorConfig,
        serializer: Arc<dyn Serializer<E>>,
        authenticator: Arc<dyn ConnectionAuthenticator>,
    ) -> Self {
        let events = Arc::new(EventAggregator::new());
        let (messaging, inbound) =
            TcpMessagingService::new(config, serializer, authenticator, Arc::clone(&events));
        Self::new(Arc::new(messaging), events, inbound)
    }

    pub fn events(&self) -> &Arc<EventAggregator<E>> {
        &self.events
    }

    pub fn local_address(&self) -> SocketAddr {
        self.messaging.local_address()
    }

    pub fn is_running(&self) -> bool {
        self.messaging.is_running()
    }

    /// Start the messaging service and the inbound routing task.
    pub async fn start(&self) -> Result<SocketAddr, DistributorError> {
        let local = self.messaging.start().await?;

        if let Some(mut inbound) = self.inbound.lock().take() {
            let messaging = Arc::clone(&self.messaging);
            let events = Arc::clone(&self.events);
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = inbound.recv() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    if let Err(e) = route(messaging.as_ref(), &events, message) {
                        warn!("Failed to route inbound message: {e}");
                    }
                }
                debug!("Inbound routing stopped");
            });
            info!("Distributor started on {local}");
        }
        Ok(local)
    }

    /// Broadcast `event` to every known peer.
    pub fn distribute(&self, event: E) -> Result<(), DistributorError> {
        self.on_message(Message::new(event))
    }

    /// Send `event` to each of `targets`.
    pub fn distribute_to(
        &self,
        event: E,
        targets: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<(), DistributorError> {
        let message = Message::builder().event(event).targets(targets).build();
        self.on_message(message)
    }

    /// Route one message: incoming ones are published locally, outgoing ones
    /// go to the messaging service.
    pub fn on_message(&self, message: Message<E>) -> Result<(), DistributorError> {
        route(self.messaging.as_ref(), &self.events, message)
    }

    /// Stop the messaging service, then the routing task.
    pub async fn shutdown(&self) {
        self.messaging.shutdown().await;
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Distributor stopped");
    }
}

fn route<E: Payload>(
    messaging: &dyn MessagingService<E>,
    events: &EventAggregator<E>,
    mut message: Message<E>,
) -> Result<(), DistributorError> {
    if message.is_incoming() {
        events.publish(DistributorEvent::Application(message.into_payload()));
        return Ok(());
    }

    if message.source().is_none() {
        message.set_source(messaging.local_address());
    }
    let targets = message.take_targets();
    if targets.is_empty() {
        return messaging.publish(message);
    }

    let mut first_error = None;
    for target in targets {
        if let Err(e) = messaging.send(target, message.clone()) {
            warn!("Cannot send {} to {target}: {e}", message.id());
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use async_trait::async_trait;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingMessaging {
        published: Mutex<Vec<Message<String>>>,
        sent: Mutex<Vec<(SocketAddr, Message<String>)>>,
        refuse: Mutex<Option<SocketAddr>>,
    }

    #[async_trait]
    impl MessagingService<String> for RecordingMessaging {
        async fn start(&self) -> Result<SocketAddr, DistributorError> {
            Ok(self.local_address())
        }

        async fn shutdown(&self) {}

        fn publish(&self, message: Message<String>) -> Result<(), DistributorError> {
            self.published.lock().push(message);
            Ok(())
        }

        fn send(&self, target: SocketAddr, message: Message<String>) -> Result<(), DistributorError> {
            if *self.refuse.lock() == Some(target) {
                return Err(DistributorError::QueueFull {
                    addr: target,
                    capacity: 0,
                });
            }
            self.sent.lock().push((target, message));
            Ok(())
        }

        fn local_address(&self) -> SocketAddr {
            "10.0.0.1:7000".parse().unwrap()
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    fn distributor() -> (DistributorService<String>, Arc<RecordingMessaging>) {
        let messaging = Arc::new(RecordingMessaging::default());
        let (_tx, rx) = mpsc::unbounded_channel();
        let service = DistributorService::new(
            messaging.clone(),
            Arc::new(EventAggregator::new()),
            rx,
        );
        (service, messaging)
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], port))
    }

    #[test]
    fn test_untargeted_message_is_broadcast() {
        let (service, messaging) = distributor();
        service.distribute("to all".into()).unwrap();

        let published = messaging.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload(), "to all");
        assert_eq!(published[0].source(), Some(messaging.local_address()));
        assert!(messaging.sent.lock().is_empty());
    }

    #[test]
    fn test_targeted_message_goes_to_each_target() {
        let (service, messaging) = distributor();
        service
            .distribute_to("hi".into(), [peer(1), peer(2)])
            .unwrap();

        let sent = messaging.sent.lock();
        let mut targets: Vec<_> = sent.iter().map(|(t, _)| *t).collect();
        targets.sort();
        assert_eq!(targets, vec![peer(1), peer(2)]);
        for (_, message) in sent.iter() {
            assert!(message.targets().is_empty());
            assert_eq!(message.payload(), "hi");
        }
        assert!(messaging.published.lock().is_empty());
    }

    #[test]
    fn test_existing_source_is_kept() {
        let (service, messaging) = distributor();
        let relay: SocketAddr = "10.0.0.99:1".parse().unwrap();
        let message = Message::builder()
            .event("relayed".to_string())
            .from(relay)
            .target(peer(3))
            .build();
        service.on_message(message).unwrap();
        assert_eq!(messaging.sent.lock()[0].1.source(), Some(relay));
    }

    #[test]
    fn test_incoming_message_is_published_locally() {
        let (service, messaging) = distributor();
        let mut app = service.events().subscribe_channel(EventKind::Application);

        let incoming = Message::incoming(Uuid::new_v4(), peer(4), "from afar".to_string());
        service.on_message(incoming).unwrap();

        match app.try_recv() {
            Ok(DistributorEvent::Application(payload)) => assert_eq!(payload, "from afar"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(messaging.published.lock().is_empty());
        assert!(messaging.sent.lock().is_empty());
    }

    #[test]
    fn test_failed_target_does_not_stop_the_others() {
        let (service, messaging) = distributor();
        *messaging.refuse.lock() = Some(peer(1));

        let result = service.distribute_to("partial".into(), [peer(1), peer(2)]);
        assert!(matches!(result, Err(DistributorError::QueueFull { .. })));
        let sent = messaging.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer(2));
    }

    #[tokio::test]
    async fn test_inbound_channel_feeds_event_bus() {
        let messaging = Arc::new(RecordingMessaging::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let service = DistributorService::new(messaging, Arc::new(EventAggregator::new()), rx);
        let mut app = service.events().subscribe_channel(EventKind::Application);

        service.start().await.unwrap();
        tx.send(Message::incoming(Uuid::new_v4(), peer(5), "queued".to_string()))
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), app.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(DistributorEvent::Application(p)) if p == "queued"));
        service.shutdown().await;
    }
}
