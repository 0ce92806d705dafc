//! Per-peer connection: buffers while disconnected, flushes on reconnect.
//!
//! A [`Connection`] is keyed externally by the peer's advertised address. It
//! holds at most one live [`ChannelSink`] and a FIFO of pending messages.
//! While no sink is installed every `send` is queued; installing a sink drains
//! the queue back through `send`, so a socket that dies mid-flush re-queues
//! the remainder instead of losing it.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Payload;
use crate::error::DistributorError;
use crate::events::{DistributorEvent, EventAggregator};
use crate::message::Message;

/// Who re-establishes a dropped link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Buffer while disconnected and wait for the peer to dial back in.
    CacheOnly,
    /// Buffer while disconnected and redial the peer ourselves.
    CacheAndReconnect,
}

/// The write side of a live socket.
pub trait ChannelSink<E>: Send + Sync {
    /// Hand `message` to the socket. Gives the message back if the socket is
    /// already gone.
    fn write(&self, message: Message<E>) -> Result<(), Message<E>>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens sockets for connections that reconnect themselves.
///
/// `dial` starts one dial sequence in the background. It must eventually call
/// either [`Connection::set_channel`] or [`Connection::dial_failed`].
pub trait Dialer<E>: Send + Sync {
    fn dial(self: Arc<Self>, connection: Arc<Connection<E>>);
}

pub struct Connection<E> {
    endpoint: SocketAddr,
    mode: ReconnectMode,
    link: Mutex<Link<E>>,
    attempting: AtomicBool,
    shut_down: AtomicBool,
    dialer: Option<Arc<dyn Dialer<E>>>,
    events: Arc<EventAggregator<E>>,
    max_pending: usize,
    this: Weak<Connection<E>>,
}

struct Link<E> {
    channel: Option<Arc<dyn ChannelSink<E>>>,
    pending: VecDeque<Message<E>>,
}

impl<E: Payload> Connection<E> {
    pub fn new(
        endpoint: SocketAddr,
        mode: ReconnectMode,
        events: Arc<EventAggregator<E>>,
        dialer: Option<Arc<dyn Dialer<E>>>,
        max_pending: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            mode,
            link: Mutex::new(Link {
                channel: None,
                pending: VecDeque::new(),
            }),
            attempting: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            dialer,
            events,
            max_pending,
            this: this.clone(),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn mode(&self) -> ReconnectMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .channel
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    pub fn pending_len(&self) -> usize {
        self.link.lock().pending.len()
    }

    /// Whether a dial sequence is in flight.
    pub fn is_attempting(&self) -> bool {
        self.attempting.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Transmit `message` if a socket is installed, otherwise queue it and
    /// ask for a connection.
    ///
    /// Transmission is asynchronous: the outcome arrives later as a
    /// `MessageSent` or `MessageError` event. Fails only when the pending
    /// queue is full or the connection was shut down.
    pub fn send(&self, message: Message<E>) -> Result<(), DistributorError> {
        if self.is_shut_down() {
            return Err(DistributorError::NotRunning);
        }

        let mut lost_channel = false;
        let queued = {
            let mut link = self.link.lock();
            let mut message = message;

            if let Some(channel) = link.channel.clone() {
                match channel.write(message) {
                    Ok(()) => return Ok(()),
                    Err(returned) => {
                        message = returned;
                        link.channel = None;
                        lost_channel = true;
                    }
                }
            }

            if link.pending.len() >= self.max_pending {
                warn!(
                    "Pending queue for {} is full, refusing message {}",
                    self.endpoint,
                    message.id()
                );
                Err(DistributorError::QueueFull {
                    addr: self.endpoint,
                    capacity: self.max_pending,
                })
            } else {
                link.pending.push_back(message);
                Ok(())
            }
        };

        if lost_channel {
            self.disconnected();
        }
        self.connect();
        queued
    }

    /// Start a dial sequence unless one is already running.
    ///
    /// A no-op for [`ReconnectMode::CacheOnly`] connections, for connections
    /// without a dialer, and after shutdown.
    pub fn connect(&self) {
        if self.mode != ReconnectMode::CacheAndReconnect || self.is_shut_down() {
            return;
        }
        let Some(dialer) = self.dialer.clone() else {
            return;
        };
        if self
            .attempting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connection attempt to {} already in flight", self.endpoint);
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.attempting.store(false, Ordering::SeqCst);
            return;
        };

        debug!("Dialing {}", self.endpoint);
        dialer.dial(this);
    }

    /// Install a live socket and flush the pending queue through it.
    pub fn set_channel(&self, channel: Arc<dyn ChannelSink<E>>) {
        let pending = {
            let mut link = self.link.lock();
            if self.is_shut_down() {
                drop(link);
                channel.close();
                return;
            }
            if link.channel.is_some() {
                debug!("Replacing live channel to {}", self.endpoint);
            }
            link.channel = Some(channel);
            std::mem::take(&mut link.pending)
        };
        self.attempting.store(false, Ordering::SeqCst);

        info!("Activating connection to {}", self.endpoint);
        self.events
            .publish(DistributorEvent::NodeConnected(self.endpoint));

        if !pending.is_empty() {
            debug!(
                "Flushing {} pending message(s) to {}",
                pending.len(),
                self.endpoint
            );
        }
        for message in pending {
            if let Err(e) = self.send(message) {
                warn!("Dropping pending message to {}: {e}", self.endpoint);
            }
        }
    }

    /// Called by the socket task when `channel` has closed. Ignored unless
    /// `channel` is the installed one.
    pub fn channel_closed(&self, channel: &Arc<dyn ChannelSink<E>>) {
        let was_current = {
            let mut link = self.link.lock();
            match &link.channel {
                Some(current) if same_channel(current, channel) => {
                    link.channel = None;
                    true
                }
                _ => false,
            }
        };
        if !was_current {
            return;
        }

        self.disconnected();
        if !self.is_shut_down() {
            // A fresh disconnect starts a fresh dial sequence.
            self.attempting.store(false, Ordering::SeqCst);
            self.connect();
        }
    }

    /// Called by the dialer when a sequence gives up. Pending messages stay
    /// queued; the next `send` starts a new sequence.
    pub fn dial_failed(&self) {
        self.attempting.store(false, Ordering::SeqCst);
    }

    /// Close the live socket, if any, and discard the pending queue.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = {
            let mut link = self.link.lock();
            link.pending.clear();
            link.channel.take()
        };
        if let Some(channel) = channel {
            debug!("Closing connection to {}", self.endpoint);
            channel.close();
        }
    }

    fn disconnected(&self) {
        info!("Deactivating connection to {}", self.endpoint);
        self.events
            .publish(DistributorEvent::NodeDisconnected(self.endpoint));
    }
}

impl<E> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("attempting", &self.attempting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn same_channel<E>(a: &Arc<dyn ChannelSink<E>>, b: &Arc<dyn ChannelSink<E>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
