//! Messaging service — owns the listener, the transport and the connection
//! registry, and turns "send to peer" into a connection lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::Payload;
use crate::auth::ConnectionAuthenticator;
use crate::codec::FrameCodec;
use crate::config::DistributorConfig;
use crate::connection::{Connection, Dialer};
use crate::error::DistributorError;
use crate::events::{DistributorEvent, EventAggregator};
use crate::manager::ConnectionManager;
use crate::message::Message;
use crate::serializer::Serializer;
use crate::transport::Transport;

/// Point-to-point and broadcast delivery between nodes.
#[async_trait]
pub trait MessagingService<E: Payload>: Send + Sync {
    /// Bind the listener and begin accepting peers. Returns the address
    /// advertised to peers. Calling it again while running is a no-op.
    async fn start(&self) -> Result<SocketAddr, DistributorError>;

    /// Stop accepting, close every connection and wait for the socket tasks.
    async fn shutdown(&self);

    /// Send `message` to every known connection.
    fn publish(&self, message: Message<E>) -> Result<(), DistributorError>;

    /// Send `message` to one peer, dialing it if it is not yet known.
    ///
    /// Failures are published as `MessageError`. A full pending queue is
    /// also returned as [`DistributorError::QueueFull`].
    fn send(&self, target: SocketAddr, message: Message<E>) -> Result<(), DistributorError>;

    fn local_address(&self) -> SocketAddr;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// [`MessagingService`] over TCP.
pub struct TcpMessagingService<E> {
    transport: Arc<Transport<E>>,
    manager: Arc<ConnectionManager<E>>,
    events: Arc<EventAggregator<E>>,
    state: Mutex<ServiceState>,
}

impl<E: Payload> TcpMessagingService<E> {
    /// Build an unstarted service. Decoded messages from every peer arrive on
    /// the returned receiver.
    pub fn new(
        config: DistributorConfig,
        serializer: Arc<dyn Serializer<E>>,
        authenticator: Arc<dyn ConnectionAuthenticator>,
        events: Arc<EventAggregator<E>>,
    ) -> (Self, mpsc::UnboundedReceiver<Message<E>>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let max_pending = config.max_pending_messages;
        let codec = FrameCodec::new(serializer).with_max_frame_length(config.max_frame_length);
        let transport = Arc::new(Transport::new(
            Arc::new(config),
            codec,
            authenticator,
            Arc::clone(&events),
            inbound_tx,
        ));

        let dialer: Arc<dyn Dialer<E>> = transport.clone();
        let factory_events = Arc::clone(&events);
        let manager = Arc::new(ConnectionManager::new(move |addr, mode| {
            Connection::new(
                addr,
                mode,
                Arc::clone(&factory_events),
                Some(Arc::clone(&dialer)),
                max_pending,
            )
        }));

        let service = Self {
            transport,
            manager,
            events,
            state: Mutex::new(ServiceState::Idle),
        };
        (service, inbound_rx)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<E>> {
        &self.manager
    }

    pub fn events(&self) -> &Arc<EventAggregator<E>> {
        &self.events
    }

    fn ensure_running(&self) -> Result<(), DistributorError> {
        match *self.state.lock() {
            ServiceState::Running => Ok(()),
            _ => Err(DistributorError::NotRunning),
        }
    }

    fn stamp(&self, message: &mut Message<E>) {
        if message.source().is_none() {
            message.set_source(self.transport.local_address());
        }
    }

    /// Hand `message` to `connection`. Every failure is published as a
    /// `MessageError`; only a full pending queue is also returned.
    fn deliver(&self, connection: &Connection<E>, message: Message<E>) -> Result<(), DistributorError> {
        let Err(e) = connection.send(message.clone()) else {
            return Ok(());
        };
        warn!(
            "Cannot send {} to {}: {e}",
            message.id(),
            connection.endpoint()
        );
        let refused = matches!(e, DistributorError::QueueFull { .. });
        self.events.publish(DistributorEvent::MessageError {
            message,
            cause: e.to_string(),
        });
        if refused { Err(e) } else { Ok(()) }
    }
}

#[async_trait]
impl<E: Payload> MessagingService<E> for TcpMessagingService<E> {
    async fn start(&self) -> Result<SocketAddr, DistributorError> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Idle => *state = ServiceState::Starting,
                ServiceState::Starting | ServiceState::Running => {
                    return Ok(self.transport.local_address());
                }
                ServiceState::Stopped => return Err(DistributorError::NotRunning),
            }
        }

        let listener = match self.transport.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock() = ServiceState::Idle;
                return Err(e);
            }
        };
        self.transport.serve(listener, Arc::clone(&self.manager));

        let mut state = self.state.lock();
        if *state == ServiceState::Stopped {
            return Err(DistributorError::NotRunning);
        }
        *state = ServiceState::Running;
        let local = self.transport.local_address();
        info!("Messaging service started on {local}");
        Ok(local)
    }

    async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == ServiceState::Stopped {
                return;
            }
            *state = ServiceState::Stopped;
        }
        info!("Messaging service on {} shutting down", self.transport.local_address());
        self.transport.stop_accepting();
        self.manager.shutdown();
        self.transport.close().await;
    }

    fn publish(&self, mut message: Message<E>) -> Result<(), DistributorError> {
        self.ensure_running()?;
        self.stamp(&mut message);

        for connection in self.manager.get_all() {
            // Already reported as MessageError; one full peer does not stop
            // the broadcast.
            let _ = self.deliver(&connection, message.clone());
        }
        Ok(())
    }

    fn send(&self, target: SocketAddr, mut message: Message<E>) -> Result<(), DistributorError> {
        self.ensure_running()?;
        self.stamp(&mut message);
        let connection = self.manager.get(target, true);
        self.deliver(&connection, message)
    }

    fn local_address(&self) -> SocketAddr {
        self.transport.local_address()
    }

    fn is_running(&self) -> bool {
        *self.state.lock() == ServiceState::Running
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
