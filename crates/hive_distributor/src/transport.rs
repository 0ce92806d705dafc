//! TCP transport — listener, dialer, and the per-socket pipeline.
//!
//! Every socket runs the same fixed sequence of stages:
//!
//! 1. authenticate (server side only)
//! 2. handshake, bounded by the handshake timeout
//! 3. frame decode/encode via [`FrameCodec`]
//! 4. hand decoded messages to the inbound channel
//!
//! Once the handshake completes the socket is split: one half feeds the
//! inbound channel, the other drains a per-socket queue of outgoing messages
//! and reports each write as `MessageSent` or `MessageError`. When either half
//! stops, the owning [`Connection`] is told its channel closed and anything
//! still queued for the socket is sent through the connection again.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use hive_retry::{RetryDecision, RetryPolicy};

use crate::Payload;
use crate::auth::ConnectionAuthenticator;
use crate::codec::FrameCodec;
use crate::config::DistributorConfig;
use crate::connection::{ChannelSink, Connection, Dialer, ReconnectMode};
use crate::error::{DistributorError, EncodingError, HandshakeError};
use crate::events::{DistributorEvent, EventAggregator};
use crate::handshake::{self, HandshakeRole};
use crate::manager::ConnectionManager;
use crate::message::Message;

type FrameSink<E> = SplitSink<Framed<TcpStream, FrameCodec<E>>, Message<E>>;
type FrameStream<E> = SplitStream<Framed<TcpStream, FrameCodec<E>>>;

/// Write handle for one live socket.
pub struct SocketChannel<E> {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Message<E>>,
    closed: CancellationToken,
}

impl<E> SocketChannel<E> {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl<E: Payload> ChannelSink<E> for SocketChannel<E> {
    fn write(&self, message: Message<E>) -> Result<(), Message<E>> {
        if self.closed.is_cancelled() {
            return Err(message);
        }
        self.outbound.send(message).map_err(|e| e.0)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }
}

/// Shared state for every socket of one node.
pub struct Transport<E> {
    config: Arc<DistributorConfig>,
    codec: FrameCodec<E>,
    authenticator: Arc<dyn ConnectionAuthenticator>,
    events: Arc<EventAggregator<E>>,
    inbound: mpsc::UnboundedSender<Message<E>>,
    local_address: RwLock<SocketAddr>,
    runtime: OnceCell<Handle>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<E: Payload> Transport<E> {
    pub fn new(
        config: Arc<DistributorConfig>,
        codec: FrameCodec<E>,
        authenticator: Arc<dyn ConnectionAuthenticator>,
        events: Arc<EventAggregator<E>>,
        inbound: mpsc::UnboundedSender<Message<E>>,
    ) -> Self {
        let unbound = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        Self {
            config,
            codec,
            authenticator,
            events,
            inbound,
            local_address: RwLock::new(unbound),
            runtime: OnceCell::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// The address advertised to peers in the handshake.
    pub fn local_address(&self) -> SocketAddr {
        *self.local_address.read()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolve the configured host and open the listener.
    ///
    /// An unresolvable host falls back to `0.0.0.0`.
    pub async fn bind(&self) -> Result<TcpListener, DistributorError> {
        let _ = self.runtime.set(Handle::current());

        let addr = self.resolve_listen_address().await;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(self.config.reuse_address)?;
        socket.set_keepalive(self.config.keep_alive)?;
        socket
            .bind(addr)
            .map_err(|e| DistributorError::Transport(format!("Cannot bind {addr}: {e}")))?;
        let listener = socket.listen(self.config.accept_backlog)?;

        let local = listener.local_addr()?;
        *self.local_address.write() = local;
        info!("Listening on {local}");
        Ok(listener)
    }

    async fn resolve_listen_address(&self) -> SocketAddr {
        let host = self.config.host.as_str();
        let port = self.config.port;
        match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if let Some(addr) = addrs.iter().find(|a| a.is_ipv4()).or(addrs.first()) {
                    return *addr;
                }
                warn!("Host {host} resolved to nothing, listening on all interfaces");
            }
            Err(e) => {
                warn!("Cannot resolve host {host} ({e}), listening on all interfaces");
            }
        }
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    }

    /// Accept sockets on `listener` until shutdown.
    pub fn serve(self: &Arc<Self>, listener: TcpListener, manager: Arc<ConnectionManager<E>>) {
        let this = Arc::clone(self);
        self.tracker.spawn(this.accept_loop(listener, manager));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, manager: Arc<ConnectionManager<E>>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Listener on {} shutting down", self.local_address());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Incoming socket from {remote}");
                        let this = Arc::clone(&self);
                        self.tracker.spawn(this.accept(stream, remote, Arc::clone(&manager)));
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
        }
    }

    async fn accept(
        self: Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
        manager: Arc<ConnectionManager<E>>,
    ) {
        if !self.authenticator.authenticate(&remote) {
            warn!("Rejected connection from {remote}");
            return;
        }
        if let Err(e) = stream.set_nodelay(self.config.tcp_no_delay) {
            debug!("Cannot set TCP_NODELAY for {remote}: {e}");
        }

        let handshake = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = handshake::server_handshake(&mut stream, self.config.handshake_timer()) => result,
        };
        let (peer, leftover) = match handshake {
            Ok(done) => done,
            Err(e) => {
                self.handshake_failed(Some(remote), &e);
                return;
            }
        };
        if self.is_shutting_down() {
            return;
        }

        let connection = manager.get_or_create(peer, ReconnectMode::CacheOnly);
        if connection.is_shut_down() {
            debug!("Dropping {peer}: registry already shut down");
            return;
        }
        if let Err(e) = handshake::send_reply(&mut stream).await {
            self.handshake_failed(Some(remote), &e);
            return;
        }

        info!("Accepted {peer} from {remote}");
        self.attach(stream, leftover, connection, HandshakeRole::Server);
    }

    async fn dial_loop(self: Arc<Self>, connection: Arc<Connection<E>>) {
        let endpoint = connection.endpoint();
        let mut policy = match self.config.retry_policy() {
            Ok(policy) => policy,
            Err(e) => {
                error!("Invalid retry configuration, not dialing {endpoint}: {e}");
                connection.dial_failed();
                return;
            }
        };

        loop {
            if self.is_shutting_down() || connection.is_shut_down() {
                connection.dial_failed();
                return;
            }

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    connection.dial_failed();
                    return;
                }
                attempt = self.connect_once(endpoint) => attempt,
            };
            let failure = match attempt {
                Ok((stream, leftover)) => {
                    info!("Connected to {endpoint}");
                    self.attach(stream, leftover, connection, HandshakeRole::Client);
                    return;
                }
                Err(e) => e,
            };
            debug!("Connection attempt to {endpoint} failed: {failure}");

            // The delay blocks, so it runs off the reactor threads.
            let retry = tokio::task::spawn_blocking(move || {
                let decision = policy.retry();
                (policy, decision)
            });
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                joined = retry => joined.ok(),
            };
            match outcome {
                Some((returned, RetryDecision::Proceed)) => policy = returned,
                Some((_, RetryDecision::Exhausted)) => {
                    warn!("Giving up on {endpoint}: {failure}");
                    connection.dial_failed();
                    return;
                }
                None => {
                    connection.dial_failed();
                    return;
                }
            }
        }
    }

    async fn connect_once(&self, endpoint: SocketAddr) -> Result<(TcpStream, BytesMut), DistributorError> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.config.keep_alive)?;

        let connect = socket.connect(endpoint);
        let mut stream = match self.config.connection_timer() {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                DistributorError::Transport(format!(
                    "Connect to {endpoint} timed out after {limit:?}"
                ))
            })??,
            None => connect.await?,
        };
        stream.set_nodelay(self.config.tcp_no_delay)?;

        match handshake::client_handshake(&mut stream, self.local_address(), self.config.handshake_timer())
            .await
        {
            Ok(leftover) => Ok((stream, leftover)),
            Err(e) => {
                self.handshake_failed(Some(endpoint), &e);
                Err(e.into())
            }
        }
    }

    /// Start the frame stages on a handshaken socket and install it on
    /// `connection`.
    fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        leftover: BytesMut,
        connection: Arc<Connection<E>>,
        role: HandshakeRole,
    ) {
        let remote = connection.endpoint();
        let mut parts = FramedParts::new::<Message<E>>(stream, self.codec.clone());
        parts.read_buf = leftover;
        let (mut sink, mut frames) = Framed::from_parts(parts).split();

        let (outbound, mut queued) = mpsc::unbounded_channel();
        let closed = self.shutdown.child_token();
        let channel: Arc<dyn ChannelSink<E>> = Arc::new(SocketChannel {
            remote,
            outbound,
            closed: closed.clone(),
        });

        // Installed before the task starts so an immediate close is not stale.
        connection.set_channel(Arc::clone(&channel));

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            // The message the writer is in the middle of, if any.
            let mut in_flight = None;
            tokio::select! {
                _ = closed.cancelled() => {
                    debug!("Closing {role:?} socket to {remote}");
                }
                _ = this.read_frames(&mut frames, remote, role) => {}
                _ = this.write_frames(&mut sink, &mut queued, &mut in_flight, remote, role) => {}
            }
            closed.cancel();
            drop(frames);
            drop(sink);

            connection.channel_closed(&channel);

            let requeued = requeue_unsent(&connection, in_flight, &mut queued);
            if requeued > 0 {
                debug!("Re-queued {requeued} unsent message(s) for {remote}");
            }
        });
    }

    async fn read_frames(&self, frames: &mut FrameStream<E>, remote: SocketAddr, role: HandshakeRole) {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(message) => {
                    if self.config.verbose_logging {
                        trace!("[{role:?}] {remote} -> frame {}", message.id());
                    }
                    if self.inbound.send(message).is_err() {
                        debug!("Inbound channel closed, dropping socket to {remote}");
                        return;
                    }
                }
                Err(e) => {
                    warn!("Closing connection to {remote}: {e}");
                    return;
                }
            }
        }
        debug!("{remote} closed the connection");
    }

    async fn write_frames(
        &self,
        sink: &mut FrameSink<E>,
        queued: &mut mpsc::UnboundedReceiver<Message<E>>,
        in_flight: &mut Option<Message<E>>,
        remote: SocketAddr,
        role: HandshakeRole,
    ) {
        while let Some(message) = queued.recv().await {
            if self.config.verbose_logging {
                trace!("[{role:?}] {remote} <- frame {}", message.id());
            }
            *in_flight = Some(message.clone());
            let written = sink.send(message.clone()).await;
            *in_flight = None;
            match written {
                Ok(()) => self.events.publish(DistributorEvent::MessageSent(message)),
                Err(EncodingError::Io(e)) => {
                    warn!("Write to {remote} failed: {e}");
                    self.events.publish(DistributorEvent::MessageError {
                        message,
                        cause: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    warn!("Cannot encode message {} for {remote}: {e}", message.id());
                    self.events.publish(DistributorEvent::MessageError {
                        message,
                        cause: e.to_string(),
                    });
                }
            }
        }
    }

    fn handshake_failed(&self, remote: Option<SocketAddr>, error: &HandshakeError) {
        match remote {
            Some(remote) => warn!("Handshake with {remote} failed: {error}"),
            None => warn!("Handshake failed: {error}"),
        }
        self.events.publish(DistributorEvent::HandshakeFailed {
            remote,
            cause: error.to_string(),
        });
    }

    /// Stop the listener, abandon handshakes in progress and close every live
    /// socket. Does not wait; see [`close`](Self::close).
    pub fn stop_accepting(&self) {
        self.shutdown.cancel();
    }

    /// Stop accepting, close every socket and wait, bounded by the shutdown
    /// timeout, for the socket tasks to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Timed out waiting for {} socket task(s) to finish",
                self.tracker.len()
            );
        }
    }
}

/// Send a dead socket's undelivered messages back through `connection`,
/// the interrupted one first. Returns how many there were.
fn requeue_unsent<E: Payload>(
    connection: &Connection<E>,
    in_flight: Option<Message<E>>,
    queued: &mut mpsc::UnboundedReceiver<Message<E>>,
) -> usize {
    queued.close();
    let mut requeued = 0usize;
    let rest = std::iter::from_fn(|| queued.try_recv().ok());
    for message in in_flight.into_iter().chain(rest) {
        requeued += 1;
        if let Err(e) = connection.send(message) {
            debug!("Dropping unsent message for {}: {e}", connection.endpoint());
        }
    }
    requeued
}

impl<E: Payload> Dialer<E> for Transport<E> {
    fn dial(self: Arc<Self>, connection: Arc<Connection<E>>) {
        if self.is_shutting_down() {
            connection.dial_failed();
            return;
        }
        let Some(runtime) = self.runtime.get().cloned() else {
            warn!("Transport not started, cannot dial {}", connection.endpoint());
            connection.dial_failed();
            return;
        };
        let tracker = self.tracker.clone();
        tracker.spawn_on(self.dial_loop(connection), &runtime);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
