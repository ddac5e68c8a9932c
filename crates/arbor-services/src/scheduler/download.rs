//! Fetching a peer's tree one Datum at a time.
//!
//! A node's placeholder children are requested in order, each reply is
//! checked against the hash it was requested for, and the materialized
//! node replaces its placeholder. Then every new bigfile and directory is
//! descended into, depth-first, until nothing is left pending.

use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};

use arbor_core::crypto::Hash;
use arbor_core::tree::{File, Name, TreeError};
use arbor_core::wire::{DatumBody, MessageType, WireError};

use super::{Scheduler, SchedulerError};

impl Scheduler {
    /// Request one node and materialize it. Its children, if any, come back
    /// as placeholders.
    pub async fn fetch_node(&self, addr: SocketAddr, hash: &Hash) -> Result<File, DownloadError> {
        let reply = self.get_datum(addr, hash).await?;
        match reply.message.kind {
            MessageType::NoDatum => Err(DownloadError::NoDatum(*hash)),
            MessageType::Datum => {
                let datum = DatumBody::decode(&reply.message.body)?;
                if datum.hash != *hash {
                    return Err(DownloadError::WrongDatum {
                        requested: *hash,
                        received: datum.hash,
                    });
                }
                let node = File::from_datum(*hash, datum.parse_value()?)?;
                tracing::trace!(peer = %addr, hash = hex::encode(hash), "node fetched");
                Ok(node)
            }
            other => Err(SchedulerError::UnexpectedReply {
                request: MessageType::GetDatum,
                reply: other,
            }
            .into()),
        }
    }

    /// Materialize every placeholder under `node`.
    ///
    /// Each fetched node must fit under its parent (no directory inside a
    /// bigfile) and is then spliced into the peer's recorded partial tree.
    /// Any failure aborts the whole subtree; nodes already fetched stay in
    /// place.
    pub fn download_node<'a>(
        &'a self,
        addr: SocketAddr,
        node: &'a mut File,
    ) -> BoxFuture<'a, Result<(), DownloadError>> {
        async move {
            let pending: Vec<(usize, Hash)> = node
                .children()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_placeholder())
                .map(|(i, c)| (i, c.hash()))
                .collect();

            for (index, hash) in pending {
                let fetched = self.fetch_node(addr, &hash).await?;
                node.check_child(&fetched)?;
                self.splice_partial(addr, &hash, &fetched);
                if let Some(child) = node.children_mut().and_then(|c| c.get_mut(index)) {
                    child.update_placeholder(&hash, fetched);
                }
            }

            if let Some(children) = node.children_mut() {
                for child in children.iter_mut() {
                    self.download_node(addr, child).await?;
                }
            }

            node.verify_shallow()?;
            Ok(())
        }
        .boxed()
    }

    /// Fetch the whole tree `addr` advertised in its last Root.
    ///
    /// The root must be a directory. It is recorded as the peer's partial
    /// tree before its children are fetched, and the result is verified end
    /// to end before it is returned.
    pub async fn fetch_tree(&self, addr: SocketAddr) -> Result<File, DownloadError> {
        let peer = self
            .peer(&addr)
            .ok_or(SchedulerError::UnknownPeer(addr))?;
        let root = peer.root.ok_or(DownloadError::NoRoot(addr))?;

        let mut tree = self.fetch_node(addr, &root).await?;
        if !matches!(tree, File::Directory { .. }) {
            return Err(DownloadError::NotDirectory(root));
        }
        tree.set_name(Name::new(&peer.name));
        if let Some(mut p) = self.registry.get_mut(&addr) {
            p.partial_tree = Some(tree.clone());
        }
        tracing::info!(
            peer = %addr,
            root = hex::encode(root),
            entries = tree.children().len(),
            "fetching tree"
        );

        self.download_node(addr, &mut tree).await?;
        tree.verify()?;

        tracing::info!(peer = %addr, root = hex::encode(root), "tree fetched");
        Ok(tree)
    }

    fn splice_partial(&self, addr: SocketAddr, hash: &Hash, node: &File) {
        if let Some(mut peer) = self.registry.get_mut(&addr) {
            if let Some(tree) = peer.partial_tree.as_mut() {
                tree.update_placeholder(hash, node.clone());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("peer has no datum {}", hex::encode(.0))]
    NoDatum(Hash),

    #[error("asked for {} but got {}", hex::encode(requested), hex::encode(received))]
    WrongDatum { requested: Hash, received: Hash },

    #[error("integrity failure: {0}")]
    Integrity(#[from] TreeError),

    #[error("malformed datum: {0}")]
    Malformed(#[from] WireError),

    #[error("{0} has not advertised a root")]
    NoRoot(SocketAddr),

    #[error("root {} is not a directory", hex::encode(.0))]
    NotDirectory(Hash),
}
