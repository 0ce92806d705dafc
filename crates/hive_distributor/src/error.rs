//! Distributor error types.

use std::net::SocketAddr;
use std::time::Duration;

use hive_retry::RetryError;

/// Errors surfaced by the distributor to its callers.
#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    /// A transport-level error (connect, bind, socket write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The handshake with a peer failed.
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Invalid retry/back-off configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] RetryError),

    /// The pending queue for a disconnected peer refused another message.
    #[error("Pending queue for {addr} is full ({capacity} messages)")]
    QueueFull { addr: SocketAddr, capacity: usize },

    /// The service has not been started or is shutting down.
    #[error("Distributor not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while framing a [`Message`](crate::Message). Fatal to the
/// connection that produced them.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed source address: {0}")]
    Address(#[from] AddressError),

    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Outgoing messages must carry a source address.
    #[error("Message {0} has no source address")]
    MissingSource(uuid::Uuid),

    #[error("Payload serialization failed: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the connection handshake. Fatal to the socket.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Bad handshake magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Handshake block length {0} out of range")]
    Length(u32),

    #[error("Malformed advertised address: {0}")]
    Address(#[from] AddressError),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Peer closed the socket during the handshake")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A peer address that could not be read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("unsupported address length {0}")]
    Length(u32),

    #[error("address truncated")]
    Truncated,

    #[error("port {0} out of range")]
    Port(u32),
}
