//! Hive Distributor — peer-to-peer event distribution over TCP.
//!
//! Every node listens on one TCP port and keeps at most one connection per
//! peer address. Application events are wrapped in a [`Message`], framed with
//! their source address, and either broadcast to every known peer or sent to
//! an explicit set of targets. Events arriving from peers are republished on
//! the local [`EventAggregator`].
//!
//! # Architecture
//!
//! - **Transport**: TCP sockets split into a framed reader and writer
//!   (`tokio-util` codecs), opened by a two-step handshake.
//! - **Connections**: one [`Connection`] per peer, queueing messages while
//!   disconnected and redialing with a [`hive_retry`] policy.
//! - **Routing**: [`DistributorService`] broadcasts untargeted messages and
//!   unicasts targeted ones.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hive_distributor::{DistributorConfig, DistributorService, EventKind, JsonSerializer};
//!
//! # async fn example() -> Result<(), hive_distributor::DistributorError> {
//! let config = DistributorConfig { port: 7400, ..DistributorConfig::default() };
//! let node = DistributorService::<String>::over_tcp(config, Arc::new(JsonSerializer::new()));
//! node.events().subscribe(EventKind::Application, |event| println!("{event:?}"));
//!
//! node.start().await?;
//! node.distribute("hello, everyone".to_string())?;
//! node.distribute_to("hello, you".to_string(), ["10.0.0.7:7400".parse().unwrap()])?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;

pub mod address;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod logging;
pub mod manager;
pub mod message;
pub mod messaging;
pub mod router;
pub mod serializer;
pub mod source;
pub mod transport;

/// Bound for application event types carried by the distributor.
pub trait Payload: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + fmt::Debug + 'static {}

// ── Re-exports ──────────────────────────────────────────────────────

pub use auth::{AcceptAll, AllowList, ConnectionAuthenticator};
pub use codec::{FRAME_MAGIC, FrameCodec};
pub use config::DistributorConfig;
pub use connection::{ChannelSink, Connection, Dialer, ReconnectMode};
pub use error::{AddressError, DistributorError, EncodingError, HandshakeError};
pub use events::{DistributorEvent, EventAggregator, EventHandler, EventKind};
pub use handshake::{HANDSHAKE_MAGIC, Handshake, HandshakeOutcome, HandshakeRole, HandshakeState};
pub use manager::ConnectionManager;
pub use message::{Message, MessageBuilder, NoPayload};
pub use messaging::{MessagingService, TcpMessagingService};
pub use router::DistributorService;
pub use serializer::{JsonSerializer, Serializer};
pub use source::{ConfigurationSource, InMemoryConfigurationSource, PropertiesConfigurationSource};
