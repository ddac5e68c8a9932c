//! Content-addressed file tree.
//!
//! A tree is built from three kinds of materialized node plus one pending
//! kind:
//!
//! ```text
//!   Chunk       hash = SHA256(0x00 ‖ data)                      data ≤ 1024 bytes
//!   Bigfile     hash = SHA256(0x01 ‖ child.hash ...)            2..=32 children when built
//!   Directory   hash = SHA256(0x02 ‖ (pad32(name) ‖ hash) ...)
//!   Placeholder hash known from a parent manifest, content not fetched yet
//! ```
//!
//! The hash preimages are exactly the `DatumValue` encodings, so a node's
//! hash is also the hash of the Datum that carries it. Names are padded
//! with NUL bytes to 32 bytes inside the preimage; that padding is part of
//! the protocol and must never change.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;

use crate::crypto::{Hash, Hasher};
use crate::wire::{DatumValue, WireError, NAME_LEN, TAG_BIGFILE, TAG_CHUNK, TAG_DIRECTORY};

/// Largest chunk payload.
pub const MAX_CHUNK: usize = 1024;

/// Most children a bigfile may have.
pub const MAX_FANOUT: usize = 32;

/// Fewest children the chunker gives a bigfile.
pub const MIN_FANOUT: usize = 2;

// ── Names ─────────────────────────────────────────────────────────────────────

/// A node name: raw bytes, at most 32, without trailing NUL padding.
///
/// Longer names are truncated on construction. Two names that collide
/// after truncation hash identically; that is a known limitation of the
/// format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name(Vec<u8>);

impl Name {
    pub fn new(raw: impl AsRef<[u8]>) -> Self {
        let raw = raw.as_ref();
        let raw = &raw[..raw.len().min(NAME_LEN)];
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Self(raw[..end].to_vec())
    }

    /// Decode a NUL-padded wire name.
    pub fn from_padded(raw: &[u8; NAME_LEN]) -> Self {
        Self::new(raw)
    }

    /// The 32-byte NUL-padded form used on the wire and in hash preimages.
    pub fn padded(&self) -> [u8; NAME_LEN] {
        let mut out = [0u8; NAME_LEN];
        out[..self.0.len()].copy_from_slice(&self.0);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// One node of a file tree. Each node owns its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum File {
    Chunk {
        name: Name,
        hash: Hash,
        data: Bytes,
    },
    Bigfile {
        name: Name,
        hash: Hash,
        children: Vec<File>,
    },
    Directory {
        name: Name,
        hash: Hash,
        children: Vec<File>,
    },
    /// Known by hash only, waiting for its Datum.
    Placeholder { name: Name, hash: Hash },
}

impl File {
    /// A chunk with its hash computed from `data`.
    pub fn chunk(name: Name, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = chunk_hash(&data);
        File::Chunk { name, hash, data }
    }

    /// A bigfile with its hash computed from its children's hashes.
    pub fn bigfile(name: Name, children: Vec<File>) -> Self {
        let hash = bigfile_hash(&children);
        File::Bigfile {
            name,
            hash,
            children,
        }
    }

    /// A directory with its hash computed from its children's names and hashes.
    pub fn directory(name: Name, children: Vec<File>) -> Self {
        let hash = directory_hash(&children);
        File::Directory {
            name,
            hash,
            children,
        }
    }

    pub fn placeholder(name: Name, hash: Hash) -> Self {
        File::Placeholder { name, hash }
    }

    pub fn name(&self) -> &Name {
        match self {
            File::Chunk { name, .. }
            | File::Bigfile { name, .. }
            | File::Directory { name, .. }
            | File::Placeholder { name, .. } => name,
        }
    }

    pub fn set_name(&mut self, new_name: Name) {
        match self {
            File::Chunk { name, .. }
            | File::Bigfile { name, .. }
            | File::Directory { name, .. }
            | File::Placeholder { name, .. } => *name = new_name,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            File::Chunk { hash, .. }
            | File::Bigfile { hash, .. }
            | File::Directory { hash, .. }
            | File::Placeholder { hash, .. } => *hash,
        }
    }

    /// Direct children; empty for chunks and placeholders.
    pub fn children(&self) -> &[File] {
        match self {
            File::Bigfile { children, .. } | File::Directory { children, .. } => children,
            File::Chunk { .. } | File::Placeholder { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<File>> {
        match self {
            File::Bigfile { children, .. } | File::Directory { children, .. } => Some(children),
            File::Chunk { .. } | File::Placeholder { .. } => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, File::Placeholder { .. })
    }

    /// Whether no placeholder remains anywhere in this subtree.
    pub fn is_materialized(&self) -> bool {
        match self {
            File::Placeholder { .. } => false,
            File::Chunk { .. } => true,
            File::Bigfile { children, .. } | File::Directory { children, .. } => {
                children.iter().all(File::is_materialized)
            }
        }
    }

    /// Recompute this node's hash from its own content, trusting the stored
    /// hashes of its children. A placeholder's hash is taken as given.
    pub fn compute_hash(&self) -> Hash {
        match self {
            File::Chunk { data, .. } => chunk_hash(data),
            File::Bigfile { children, .. } => bigfile_hash(children),
            File::Directory { children, .. } => directory_hash(children),
            File::Placeholder { hash, .. } => *hash,
        }
    }

    /// Check this node's stored hash against its content, one level deep.
    pub fn verify_shallow(&self) -> Result<(), TreeError> {
        let actual = self.compute_hash();
        if actual != self.hash() {
            return Err(TreeError::HashMismatch {
                expected: self.hash(),
                actual,
            });
        }
        Ok(())
    }

    /// Check that `child` may sit directly under this node. A bigfile only
    /// holds chunks and bigfiles; a placeholder passes until it is fetched.
    pub fn check_child(&self, child: &File) -> Result<(), TreeError> {
        match (self, child) {
            (File::Bigfile { hash, .. }, File::Directory { hash: inner, .. }) => {
                Err(TreeError::BadChild {
                    parent: *hash,
                    child: *inner,
                })
            }
            _ => Ok(()),
        }
    }

    /// Check every hash and every parent/child pairing in the subtree,
    /// bottom-up. Placeholders fail.
    pub fn verify(&self) -> Result<(), TreeError> {
        if let File::Placeholder { hash, .. } = self {
            return Err(TreeError::Unmaterialized(*hash));
        }
        for child in self.children() {
            self.check_child(child)?;
            child.verify()?;
        }
        self.verify_shallow()
    }

    /// Depth-first search for the first node whose own hash is `target`,
    /// starting with `self`.
    pub fn get_node(&self, target: &Hash) -> Option<&File> {
        if self.hash() == *target {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.get_node(target))
    }

    /// Replace the first placeholder hashed `target` with `replacement`.
    ///
    /// A non-empty placeholder name is carried onto a replacement whose own
    /// name is empty. Returns whether a placeholder was replaced.
    pub fn update_placeholder(&mut self, target: &Hash, replacement: File) -> bool {
        let mut slot = Some(replacement);
        self.replace_in(target, &mut slot)
    }

    fn replace_in(&mut self, target: &Hash, slot: &mut Option<File>) -> bool {
        if let File::Placeholder { name, hash } = self {
            if hash != target {
                return false;
            }
            let Some(mut node) = slot.take() else {
                return false;
            };
            if node.name().is_empty() && !name.is_empty() {
                node.set_name(std::mem::take(name));
            }
            *self = node;
            return true;
        }
        match self.children_mut() {
            Some(children) => children.iter_mut().any(|c| c.replace_in(target, slot)),
            None => false,
        }
    }

    /// The Datum value that describes this node, or None for a placeholder.
    pub fn datum_value(&self) -> Option<DatumValue> {
        match self {
            File::Chunk { data, .. } => Some(DatumValue::Chunk(data.clone())),
            File::Bigfile { children, .. } => Some(DatumValue::Bigfile(
                children.iter().map(File::hash).collect(),
            )),
            File::Directory { children, .. } => Some(DatumValue::Directory(
                children.iter().map(|c| (c.name().padded(), c.hash())).collect(),
            )),
            File::Placeholder { .. } => None,
        }
    }

    /// Materialize one node from a Datum value received for `hash`.
    ///
    /// Children revealed by the value become placeholders. The result's
    /// hash is recomputed and must equal `hash`. Out-of-range fan-out and
    /// oversized chunks are rejected.
    pub fn from_datum(hash: Hash, value: DatumValue) -> Result<File, TreeError> {
        let node = match value {
            DatumValue::Chunk(data) => {
                if data.len() > MAX_CHUNK {
                    return Err(TreeError::ChunkTooLarge(data.len()));
                }
                File::Chunk {
                    name: Name::default(),
                    hash,
                    data,
                }
            }
            DatumValue::Bigfile(hashes) => {
                if hashes.is_empty() || hashes.len() > MAX_FANOUT {
                    return Err(TreeError::BadFanout(hashes.len()));
                }
                File::Bigfile {
                    name: Name::default(),
                    hash,
                    children: hashes
                        .into_iter()
                        .map(|h| File::placeholder(Name::default(), h))
                        .collect(),
                }
            }
            DatumValue::Directory(entries) => File::Directory {
                name: Name::default(),
                hash,
                children: entries
                    .into_iter()
                    .map(|(name, h)| File::placeholder(Name::from_padded(&name), h))
                    .collect(),
            },
        };
        node.verify_shallow()?;
        Ok(node)
    }

    /// Indented listing of the subtree. With `simplified`, bigfiles show a
    /// child count instead of their chunks.
    pub fn render(&self, simplified: bool) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0, simplified);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize, simplified: bool) {
        let indent = "  ".repeat(depth);
        match self {
            File::Directory { name, children, .. } => {
                out.push_str(&format!("{indent}{name}/\n"));
                for c in children {
                    c.render_into(out, depth + 1, simplified);
                }
            }
            File::Chunk { name, data, .. } => {
                out.push_str(&format!("{indent}{name} ({} bytes)\n", data.len()));
            }
            File::Bigfile { name, children, .. } => {
                out.push_str(&format!("{indent}{name} (bigfile)\n"));
                if simplified {
                    out.push_str(&format!("{indent}  {} children\n", children.len()));
                } else {
                    for c in children {
                        c.render_into(out, depth + 1, simplified);
                    }
                }
            }
            File::Placeholder { name, hash } => {
                out.push_str(&format!("{indent}{name} (pending {})\n", hex::encode(&hash[..4])));
            }
        }
    }
}

// ── Hashing rules ─────────────────────────────────────────────────────────────

fn chunk_hash(data: &[u8]) -> Hash {
    let mut h = Hasher::new();
    h.update(&[TAG_CHUNK]);
    h.update(data);
    h.finalize()
}

fn bigfile_hash(children: &[File]) -> Hash {
    let mut h = Hasher::new();
    h.update(&[TAG_BIGFILE]);
    for c in children {
        h.update(&c.hash());
    }
    h.finalize()
}

fn directory_hash(children: &[File]) -> Hash {
    let mut h = Hasher::new();
    h.update(&[TAG_DIRECTORY]);
    for c in children {
        h.update(&c.name().padded());
        h.update(&c.hash());
    }
    h.finalize()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("hash mismatch: expected {}, computed {}", hex::encode(expected), hex::encode(actual))]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("node {} has not been fetched", hex::encode(.0))]
    Unmaterialized(Hash),

    #[error("chunk of {0} bytes exceeds {}", MAX_CHUNK)]
    ChunkTooLarge(usize),

    #[error("bigfile with {0} children (allowed 1..={})", MAX_FANOUT)]
    BadFanout(usize),

    #[error("directory {} listed inside bigfile {}", hex::encode(child), hex::encode(parent))]
    BadChild { parent: Hash, child: Hash },

    #[error("malformed datum: {0}")]
    Malformed(#[from] WireError),

    #[error("name {0:?} cannot be used as a path component")]
    UnsafeName(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
