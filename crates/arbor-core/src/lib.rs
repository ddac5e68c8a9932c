//! arbor-core: wire format, hashing and signing, and the Merkle file tree.
//! Everything here is socket-free; arbor-services builds the networking on top.

pub mod chunker;
pub mod config;
pub mod crypto;
pub mod disk;
pub mod tree;
pub mod wire;

pub use crypto::Hash;
pub use tree::{File, Name, TreeError};
pub use wire::{Message, MessageType, WireError};
