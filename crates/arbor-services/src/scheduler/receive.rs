//! Receive loop: decode, admit, verify, dispatch.
//!
//! Runs for the life of the socket. Nothing a remote peer sends can stop
//! it; bad datagrams are logged and dropped.

use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::broadcast;

use arbor_core::crypto::PublicKey;
use arbor_core::tree::File;
use arbor_core::wire::{hash_body, DatumBody, HelloBody, Message, MessageType, MAX_DATAGRAM};

use super::{Scheduler, SchedulerEntry};
use crate::peer;

impl Scheduler {
    /// Serve the socket until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM + 1024];
        tracing::info!(addr = ?self.local_addr().ok(), "receive loop started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receive loop shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(addr, Instant::now(), &buf[..len]).await;
                }
            }
        }
    }

    /// Process one datagram from `addr`.
    pub(crate) async fn handle_datagram(&self, addr: SocketAddr, at: Instant, datagram: &[u8]) {
        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "malformed datagram, discarding");
                return;
            }
        };

        // Only Hello and HelloReply may come from an address we have not met.
        let known = self.registry.contains_key(&addr);
        if !known && !matches!(message.kind, MessageType::Hello | MessageType::HelloReply) {
            tracing::debug!(peer = %addr, kind = ?message.kind, "datagram before handshake, discarding");
            return;
        }

        if !self.signature_ok(addr, &message) {
            tracing::warn!(peer = %addr, id = message.id, kind = ?message.kind, "bad signature, discarding");
            return;
        }

        if let Some(mut p) = self.registry.get_mut(&addr) {
            p.last_seen = at;
        }

        tracing::trace!(peer = %addr, id = message.id, kind = ?message.kind, len = message.body.len(), "received");

        match message.kind {
            MessageType::Hello => {
                if self.accept_hello(addr, &message.body) {
                    self.reply(addr, message.id, MessageType::HelloReply, self.hello_body())
                        .await;
                }
            }
            MessageType::HelloReply => {
                if self.accept_hello(addr, &message.body) {
                    self.complete(addr, at, message);
                }
            }
            MessageType::PublicKey => {
                self.store_public_key(addr, &message.body);
                self.reply(addr, message.id, MessageType::PublicKeyReply, self.public_key_body())
                    .await;
            }
            MessageType::PublicKeyReply => {
                self.store_public_key(addr, &message.body);
                self.complete(addr, at, message);
            }
            MessageType::Root => {
                if self.store_root(addr, &message.body) {
                    let root = self.exported_root().await;
                    self.reply(addr, message.id, MessageType::RootReply, Bytes::copy_from_slice(&root))
                        .await;
                }
            }
            MessageType::RootReply => {
                if self.store_root(addr, &message.body) {
                    self.complete(addr, at, message);
                }
            }
            MessageType::GetDatum => self.serve_datum(addr, &message).await,
            MessageType::Datum => {
                let datum = match DatumBody::decode(&message.body) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %e, "malformed datum, discarding");
                        return;
                    }
                };
                if !datum.is_consistent() {
                    tracing::warn!(
                        peer = %addr,
                        id = message.id,
                        hash = hex::encode(datum.hash),
                        "datum hash does not match value, discarding"
                    );
                    return;
                }
                self.complete(addr, at, message);
            }
            MessageType::NoDatum => self.complete(addr, at, message),
            MessageType::NoOp => {}
            MessageType::Error | MessageType::ErrorReply => {
                tracing::warn!(
                    peer = %addr,
                    id = message.id,
                    text = %String::from_utf8_lossy(&message.body),
                    "peer reported an error"
                );
            }
            MessageType::NatTraversalRequest | MessageType::NatTraversal => {
                tracing::debug!(peer = %addr, kind = ?message.kind, "NAT traversal not supported, ignoring");
            }
        }
    }

    /// Verify the signature if both a signature and the sender's key exist.
    fn signature_ok(&self, addr: SocketAddr, message: &Message) -> bool {
        let Some(signature) = &message.signature else {
            return true;
        };
        let Some(peer) = self.registry.get(&addr) else {
            return true;
        };
        let Some(key) = &peer.public_key else {
            return true;
        };
        match message.signed_bytes() {
            Ok(data) => key.verify(&data, signature),
            Err(_) => false,
        }
    }

    fn accept_hello(&self, addr: SocketAddr, body: &[u8]) -> bool {
        let hello = match HelloBody::decode(body) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "malformed hello, discarding");
                return false;
            }
        };
        if peer::admit(&self.registry, addr, hello.name.clone()) {
            tracing::info!(peer = %addr, name = %hello.name, "new peer");
        }
        true
    }

    /// An empty body clears the key. An invalid point leaves it unchanged.
    fn store_public_key(&self, addr: SocketAddr, body: &[u8]) {
        let Some(mut peer) = self.registry.get_mut(&addr) else {
            return;
        };
        if body.is_empty() {
            peer.public_key = None;
            return;
        }
        match PublicKey::from_raw(body) {
            Ok(key) => {
                tracing::debug!(peer = %addr, "stored public key");
                peer.public_key = Some(key);
            }
            Err(e) => tracing::warn!(peer = %addr, error = %e, len = body.len(), "ignoring public key"),
        }
    }

    fn store_root(&self, addr: SocketAddr, body: &[u8]) -> bool {
        let root = match hash_body(body) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "malformed root, discarding");
                return false;
            }
        };
        if let Some(mut peer) = self.registry.get_mut(&addr) {
            if peer.root != Some(root) {
                tracing::debug!(peer = %addr, root = hex::encode(root), "peer root updated");
            }
            peer.root = Some(root);
        }
        true
    }

    /// Answer GetDatum from the exported tree.
    async fn serve_datum(&self, addr: SocketAddr, message: &Message) {
        let hash = match hash_body(&message.body) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "malformed GetDatum, discarding");
                return;
            }
        };

        let value = {
            let tree = self.exported.read().await;
            tree.get_node(&hash).and_then(File::datum_value)
        };

        match value {
            Some(value) => {
                let body = DatumBody {
                    hash,
                    value: value.encode(),
                }
                .encode();
                tracing::debug!(peer = %addr, hash = hex::encode(hash), "serving datum");
                self.reply(addr, message.id, MessageType::Datum, body).await;
            }
            None => {
                tracing::debug!(peer = %addr, hash = hex::encode(hash), "no such datum");
                self.reply(addr, message.id, MessageType::NoDatum, Bytes::new()).await;
            }
        }
    }

    async fn reply(&self, addr: SocketAddr, id: u32, kind: MessageType, body: Bytes) {
        if let Err(e) = self.send(addr, Message::new(id, kind, body)).await {
            tracing::warn!(peer = %addr, id, kind = ?kind, error = %e, "failed to send reply");
        }
    }

    /// Hand a reply to the request waiting on its id. Never blocks.
    fn complete(&self, addr: SocketAddr, at: Instant, message: Message) {
        let id = message.id;
        match self.pending.remove_if(&id, |_, p| p.addr == addr) {
            Some((_, pending)) => {
                if pending.tx.send(SchedulerEntry { addr, at, message }).is_err() {
                    tracing::trace!(peer = %addr, id, "requester already gone");
                }
            }
            None if self.pending.contains_key(&id) => {
                tracing::warn!(peer = %addr, id, "reply from unexpected address, ignoring");
            }
            None => {
                tracing::debug!(peer = %addr, id, kind = ?message.kind, "unsolicited reply, discarding");
            }
        }
    }
}
