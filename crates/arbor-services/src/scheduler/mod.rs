//! The scheduler: one UDP socket, the exported tree, the peer registry, and
//! the request engine that matches replies to the requests that caused them.
//!
//! Outgoing requests are correlated by message id. Each in-flight request
//! owns a one-shot slot in `pending`; the receive loop fills the slot when
//! a reply with the same id arrives from the same address. Any number of
//! requests may be outstanding at once.
//!
//! A request is sent up to `attempts` times. The wait after each
//! transmission starts at `initial_timeout` and doubles (1s, 2s, 4s with
//! the defaults), so an unreachable peer fails after about seven seconds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, RwLock};

use arbor_core::config::ArborConfig;
use arbor_core::crypto::{Hash, Keypair, PublicKey};
use arbor_core::tree::File;
use arbor_core::wire::{hash_body, HelloBody, Message, MessageType, WireError};

use crate::peer::{PeerInfo, PeerRegistry};

pub mod download;
pub mod receive;

pub use download::DownloadError;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name announced in Hello and HelloReply.
    pub name: String,
    /// Transmissions per request.
    pub attempts: u32,
    /// Wait after the first transmission.
    pub initial_timeout: Duration,
    /// Sign handshake messages when a key pair is present.
    pub sign: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "arbor".to_string(),
            attempts: 3,
            initial_timeout: Duration::from_secs(1),
            sign: true,
        }
    }
}

impl From<&ArborConfig> for SchedulerConfig {
    fn from(config: &ArborConfig) -> Self {
        Self {
            name: config.identity.name.clone(),
            attempts: config.scheduler.attempts.max(1),
            initial_timeout: config.scheduler.initial_timeout(),
            sign: config.identity.sign_messages,
        }
    }
}

/// A message together with where it went or came from and when.
#[derive(Debug, Clone)]
pub struct SchedulerEntry {
    pub addr: SocketAddr,
    pub at: Instant,
    pub message: Message,
}

/// One armed correlation slot.
pub(crate) struct Pending {
    pub(crate) addr: SocketAddr,
    pub(crate) tx: oneshot::Sender<SchedulerEntry>,
}

/// Removes a correlation slot when its request finishes or is abandoned.
struct PendingGuard {
    pending: Arc<DashMap<u32, Pending>>,
    id: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Protocol endpoint. Cheap to clone; clones share the socket and state.
#[derive(Clone)]
pub struct Scheduler {
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    exported: Arc<RwLock<File>>,
    keypair: Option<Arc<Keypair>>,
    pending: Arc<DashMap<u32, Pending>>,
    config: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: PeerRegistry,
        exported: File,
        keypair: Option<Arc<Keypair>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            socket,
            registry,
            exported: Arc::new(RwLock::new(exported)),
            keypair,
            pending: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Snapshot of one peer's state.
    pub fn peer(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.registry.get(addr).map(|p| p.clone())
    }

    /// Hash of the exported tree's root.
    pub async fn exported_root(&self) -> Hash {
        self.exported.read().await.hash()
    }

    /// Replace the exported tree. Later GetDatum and Root requests see the
    /// new tree.
    pub async fn set_exported(&self, tree: File) {
        let root = tree.hash();
        *self.exported.write().await = tree;
        tracing::info!(root = hex::encode(root), "exported tree replaced");
    }

    /// Number of requests waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// A random id not used by any in-flight request.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = rand::random::<u32>();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Sign `message` if it is a handshake type and signing is enabled.
    fn seal(&self, message: &mut Message) -> Result<(), SchedulerError> {
        if !self.config.sign || !is_signed_type(message.kind) {
            return Ok(());
        }
        if let Some(keypair) = &self.keypair {
            message.sign(keypair)?;
        }
        Ok(())
    }

    /// Send one datagram without waiting for anything.
    pub async fn send(&self, addr: SocketAddr, mut message: Message) -> Result<(), SchedulerError> {
        self.seal(&mut message)?;
        let datagram = message.encode()?;
        self.socket.send_to(&datagram, addr).await?;
        tracing::trace!(peer = %addr, id = message.id, kind = ?message.kind, "sent");
        Ok(())
    }

    /// Send a request and wait for the reply carrying the same id from the
    /// same address, retransmitting on timeout.
    ///
    /// The RTT of the answered transmission is recorded on the peer.
    pub async fn send_packet(
        &self,
        addr: SocketAddr,
        mut message: Message,
    ) -> Result<SchedulerEntry, SchedulerError> {
        self.seal(&mut message)?;
        let datagram = message.encode()?;

        let (tx, mut rx) = oneshot::channel();
        match self.pending.entry(message.id) {
            Entry::Occupied(_) => return Err(SchedulerError::DuplicateId(message.id)),
            Entry::Vacant(slot) => {
                slot.insert(Pending { addr, tx });
            }
        }
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: message.id,
        };

        let mut wait = self.config.initial_timeout;
        for attempt in 1..=self.config.attempts {
            let sent_at = Instant::now();
            self.socket.send_to(&datagram, addr).await?;
            tracing::trace!(peer = %addr, id = message.id, kind = ?message.kind, attempt, "request sent");

            match tokio::time::timeout(wait, &mut rx).await {
                Ok(Ok(reply)) => {
                    let rtt = reply.at.saturating_duration_since(sent_at);
                    if let Some(mut peer) = self.registry.get_mut(&addr) {
                        peer.rtt = Some(rtt);
                    }
                    tracing::debug!(
                        peer = %addr,
                        id = message.id,
                        reply = ?reply.message.kind,
                        rtt_ms = rtt.as_millis() as u64,
                        "reply received"
                    );
                    return Ok(reply);
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!(peer = %addr, id = message.id, attempt, wait_ms = wait.as_millis() as u64, "request timed out");
                    wait *= 2;
                }
            }
        }

        tracing::warn!(peer = %addr, id = message.id, kind = ?message.kind, "no response");
        Err(SchedulerError::NoResponse {
            addr,
            attempts: self.config.attempts,
        })
    }

    /// Send a request and check the reply is of the `expected` type.
    async fn request(
        &self,
        addr: SocketAddr,
        kind: MessageType,
        body: Bytes,
        expected: &[MessageType],
    ) -> Result<SchedulerEntry, SchedulerError> {
        let message = Message::new(self.next_id(), kind, body);
        let reply = self.send_packet(addr, message).await?;
        if !expected.contains(&reply.message.kind) {
            return Err(SchedulerError::UnexpectedReply {
                request: kind,
                reply: reply.message.kind,
            });
        }
        Ok(reply)
    }

    // ── Request helpers ──────────────────────────────────────────────────────

    /// Our Hello / HelloReply body.
    pub(crate) fn hello_body(&self) -> Bytes {
        HelloBody {
            extensions: 0,
            name: self.config.name.clone(),
        }
        .encode()
    }

    /// Our PublicKey / PublicKeyReply body: empty when we do not sign.
    pub(crate) fn public_key_body(&self) -> Bytes {
        match (&self.keypair, self.config.sign) {
            (Some(kp), true) => Bytes::copy_from_slice(&kp.public.to_raw()),
            _ => Bytes::new(),
        }
    }

    /// Greet `addr`. The HelloReply registers the peer.
    pub async fn hello(&self, addr: SocketAddr) -> Result<SchedulerEntry, SchedulerError> {
        self.request(addr, MessageType::Hello, self.hello_body(), &[MessageType::HelloReply])
            .await
    }

    /// Send our public key and return the peer's, if it has one.
    pub async fn send_public_key(
        &self,
        addr: SocketAddr,
    ) -> Result<Option<PublicKey>, SchedulerError> {
        let reply = self
            .request(
                addr,
                MessageType::PublicKey,
                self.public_key_body(),
                &[MessageType::PublicKeyReply],
            )
            .await?;
        if reply.message.body.is_empty() {
            return Ok(None);
        }
        Ok(PublicKey::from_raw(&reply.message.body).ok())
    }

    /// Advertise our root and return the peer's.
    pub async fn send_root(&self, addr: SocketAddr) -> Result<Hash, SchedulerError> {
        let root = self.exported_root().await;
        let reply = self
            .request(
                addr,
                MessageType::Root,
                Bytes::copy_from_slice(&root),
                &[MessageType::RootReply],
            )
            .await?;
        Ok(hash_body(&reply.message.body)?)
    }

    /// Ask `addr` for the node hashed `hash`. The reply is Datum or NoDatum.
    pub async fn get_datum(
        &self,
        addr: SocketAddr,
        hash: &Hash,
    ) -> Result<SchedulerEntry, SchedulerError> {
        self.request(
            addr,
            MessageType::GetDatum,
            Bytes::copy_from_slice(hash),
            &[MessageType::Datum, MessageType::NoDatum],
        )
        .await
    }

    /// Keepalive. NoOp is never answered, so nothing is awaited.
    pub async fn noop(&self, addr: SocketAddr) -> Result<(), SchedulerError> {
        self.send(addr, Message::new(self.next_id(), MessageType::NoOp, Bytes::new()))
            .await
    }

    /// Hello, then PublicKey, then Root. Returns the peer's root hash.
    pub async fn handshake(&self, addr: SocketAddr) -> Result<Hash, SchedulerError> {
        self.hello(addr).await?;
        self.send_public_key(addr).await?;
        let root = self.send_root(addr).await?;
        tracing::info!(peer = %addr, root = hex::encode(root), "handshake complete");
        Ok(root)
    }
}

/// Types that carry a signature when signing is enabled.
pub fn is_signed_type(kind: MessageType) -> bool {
    matches!(
        kind,
        MessageType::Hello
            | MessageType::HelloReply
            | MessageType::PublicKey
            | MessageType::PublicKeyReply
            | MessageType::Root
            | MessageType::RootReply
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no response from {addr} after {attempts} attempts")]
    NoResponse { addr: SocketAddr, attempts: u32 },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{request:?} answered with {reply:?}")]
    UnexpectedReply {
        request: MessageType,
        reply: MessageType,
    },

    #[error("message id {0} is already in flight")]
    DuplicateId(u32),

    #[error("{0} has not completed a handshake")]
    UnknownPeer(SocketAddr),
}
