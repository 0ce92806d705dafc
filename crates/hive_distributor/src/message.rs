//! Message envelope — one application event plus its routing metadata.

use std::collections::HashSet;
use std::net::SocketAddr;

use uuid::Uuid;

/// The envelope carried by one frame.
///
/// `targets` is routing metadata only; it never goes over the wire. An empty
/// target set means broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<E> {
    id: Uuid,
    source: Option<SocketAddr>,
    targets: HashSet<SocketAddr>,
    payload: E,
    incoming: bool,
}

/// Placeholder for a [`MessageBuilder`] that has no payload yet.
#[derive(Debug)]
pub struct NoPayload;

impl<E> Message<E> {
    /// Create an outgoing broadcast message with a fresh id.
    pub fn new(payload: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: None,
            targets: HashSet::new(),
            payload,
            incoming: false,
        }
    }

    /// A message that arrived from the network.
    pub(crate) fn incoming(id: Uuid, source: SocketAddr, payload: E) -> Self {
        Self {
            id,
            source: Some(source),
            targets: HashSet::new(),
            payload,
            incoming: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn set_source(&mut self, source: SocketAddr) {
        self.source = Some(source);
    }

    pub fn targets(&self) -> &HashSet<SocketAddr> {
        &self.targets
    }

    pub fn add_target(&mut self, target: SocketAddr) {
        self.targets.insert(target);
    }

    pub fn clear_targets(&mut self) {
        self.targets.clear();
    }

    /// Remove and return the target set, leaving it empty.
    pub fn take_targets(&mut self) -> HashSet<SocketAddr> {
        std::mem::take(&mut self.targets)
    }

    pub fn is_broadcast(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Whether the message arrived from the network rather than being
    /// created locally for sending.
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }
}

impl Message<NoPayload> {
    /// Start building a message. A payload must be supplied through
    /// [`MessageBuilder::event`] before it can be built.
    pub fn builder() -> MessageBuilder<NoPayload> {
        MessageBuilder::new()
    }
}

/// Fluent construction of outgoing messages.
///
/// ```rust
/// use hive_distributor::Message;
///
/// let target = "127.0.0.1:1907".parse().unwrap();
/// let message = Message::builder().event("hello").target(target).build();
/// assert_eq!(*message.payload(), "hello");
/// assert!(message.targets().contains(&target));
/// ```
#[derive(Debug)]
pub struct MessageBuilder<P> {
    id: Option<Uuid>,
    source: Option<SocketAddr>,
    targets: HashSet<SocketAddr>,
    payload: P,
}

impl MessageBuilder<NoPayload> {
    pub fn new() -> Self {
        Self {
            id: None,
            source: None,
            targets: HashSet::new(),
            payload: NoPayload,
        }
    }
}

impl Default for MessageBuilder<NoPayload> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> MessageBuilder<P> {
    pub fn event<E>(self, payload: E) -> MessageBuilder<E> {
        MessageBuilder {
            id: self.id,
            source: self.source,
            targets: self.targets,
            payload,
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn from(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target(mut self, target: SocketAddr) -> Self {
        self.targets.insert(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.targets.extend(targets);
        self
    }
}

impl<E: crate::Payload> MessageBuilder<E> {
    pub fn build(self) -> Message<E> {
        Message {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            source: self.source,
            targets: self.targets,
            payload: self.payload,
            incoming: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_new_message_is_outgoing_broadcast() {
        let message = Message::new("payload".to_string());
        assert!(!message.is_incoming());
        assert!(message.is_broadcast());
        assert!(message.source().is_none());
        assert_eq!(message.payload(), "payload");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::new(1u32);
        let b = Message::new(1u32);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_builder_sets_fields() {
        let id = Uuid::new_v4();
        let message = Message::builder()
            .id(id)
            .from(addr(1))
            .target(addr(2))
            .targets([addr(3), addr(2)])
            .event(42u64)
            .build();

        assert_eq!(message.id(), id);
        assert_eq!(message.source(), Some(addr(1)));
        assert_eq!(message.targets().len(), 2);
        assert_eq!(*message.payload(), 42);
        assert!(!message.is_incoming());
    }

    #[test]
    fn test_take_targets_clears() {
        let mut message = Message::builder()
            .event("x")
            .target(addr(5))
            .target(addr(6))
            .build();

        let targets = message.take_targets();
        assert_eq!(targets.len(), 2);
        assert!(message.targets().is_empty());
        assert!(message.is_broadcast());
    }

    #[test]
    fn test_add_and_clear_targets() {
        let mut message = Message::new(0u8);
        message.add_target(addr(9));
        assert!(!message.is_broadcast());
        message.clear_targets();
        assert!(message.is_broadcast());
    }

    #[test]
    fn test_incoming_constructor() {
        let id = Uuid::new_v4();
        let message = Message::incoming(id, addr(7), "evt");
        assert!(message.is_incoming());
        assert_eq!(message.id(), id);
        assert_eq!(message.source(), Some(addr(7)));
        assert_eq!(message.into_payload(), "evt");
    }
}
