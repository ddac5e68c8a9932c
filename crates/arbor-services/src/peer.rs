//! Peer registry: every remote endpoint that has completed a Hello exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_core::crypto::{Hash, PublicKey};
use arbor_core::tree::File;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Tracked state for one remote endpoint.
///
/// Created by the first Hello or HelloReply from an address and kept for
/// the life of the process. Every other field fills in as the matching
/// message arrives.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Name the peer claimed in its last Hello / HelloReply.
    pub name: String,

    /// P-256 key from PublicKey / PublicKeyReply. None = peer does not sign.
    pub public_key: Option<PublicKey>,

    /// Root hash from the last Root / RootReply.
    pub root: Option<Hash>,

    /// Round-trip time of the last answered request to this peer.
    pub rtt: Option<Duration>,

    /// The peer's tree as far as it has been fetched.
    pub partial_tree: Option<File>,

    /// Last time any admitted datagram arrived from this peer.
    pub last_seen: Instant,
}

impl PeerInfo {
    pub fn new(name: String) -> Self {
        Self {
            name,
            public_key: None,
            root: None,
            rtt: None,
            partial_tree: None,
            last_seen: Instant::now(),
        }
    }

    /// Refresh on a repeated Hello. Key, root and tree survive.
    pub fn refresh(&mut self, name: String) {
        self.name = name;
        self.last_seen = Instant::now();
    }
}

/// The peer registry, shared by the receive loop and every request caller.
/// Keyed on remote socket address.
pub type PeerRegistry = Arc<DashMap<SocketAddr, PeerInfo>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

/// Register `addr` or refresh its name. Returns true on first contact.
pub fn admit(registry: &PeerRegistry, addr: SocketAddr, name: String) -> bool {
    match registry.entry(addr) {
        Entry::Occupied(mut entry) => {
            entry.get_mut().refresh(name);
            false
        }
        Entry::Vacant(slot) => {
            slot.insert(PeerInfo::new(name));
            true
        }
    }
}

/// Find the address of a peer by claimed name.
pub fn find_by_name(registry: &PeerRegistry, name: &str) -> Option<SocketAddr> {
    registry
        .iter()
        .find(|entry| entry.value().name == name)
        .map(|entry| *entry.key())
}
