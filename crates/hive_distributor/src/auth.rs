//! Inbound connection gate, consulted once per accepted socket before the
//! handshake starts.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;

pub trait ConnectionAuthenticator: Send + Sync {
    /// Whether the socket from `remote` may proceed to the handshake.
    fn authenticate(&self, remote: &SocketAddr) -> bool;
}

/// Accepts every socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ConnectionAuthenticator for AcceptAll {
    fn authenticate(&self, _remote: &SocketAddr) -> bool {
        true
    }
}

/// Accepts sockets whose remote IP is on the list.
#[derive(Debug, Default)]
pub struct AllowList {
    allowed: RwLock<HashSet<IpAddr>>,
}

impl AllowList {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: RwLock::new(allowed.into_iter().collect()),
        }
    }

    pub fn allow(&self, ip: IpAddr) {
        self.allowed.write().insert(ip);
    }

    pub fn revoke(&self, ip: &IpAddr) -> bool {
        self.allowed.write().remove(ip)
    }
}

impl ConnectionAuthenticator for AllowList {
    fn authenticate(&self, remote: &SocketAddr) -> bool {
        self.allowed.read().contains(&remote.ip())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.authenticate(&"203.0.113.9:5000".parse().unwrap()));
    }

    #[test]
    fn test_allow_list_matches_ip_only() {
        let list = AllowList::new(["10.0.0.1".parse().unwrap()]);
        assert!(list.authenticate(&"10.0.0.1:1".parse().unwrap()));
        assert!(list.authenticate(&"10.0.0.1:65000".parse().unwrap()));
        assert!(!list.authenticate(&"10.0.0.2:1".parse().unwrap()));
    }

    #[test]
    fn test_allow_and_revoke() {
        let list = AllowList::default();
        let ip: IpAddr = "::1".parse().unwrap();
        let remote = SocketAddr::new(ip, 80);
        assert!(!list.authenticate(&remote));

        list.allow(ip);
        assert!(list.authenticate(&remote));

        assert!(list.revoke(&ip));
        assert!(!list.authenticate(&remote));
    }
}
