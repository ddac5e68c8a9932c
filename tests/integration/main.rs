//! arbor integration test harness.
//!
//! Every test runs whole nodes in-process over loopback UDP: a real
//! socket, a real receive loop, real retransmission timers. Nodes bind
//! 127.0.0.1:0, so tests never collide on ports and need no privileges.
//!
//!   cargo test --test integration
//!
//! Each test owns the nodes and directories it creates; both clean up on
//! drop, including when the test panics.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use arbor_core::crypto::Keypair;
use arbor_core::tree::File;
use arbor_core::wire::{Message, MAX_DATAGRAM};
use arbor_services::{new_registry, Scheduler, SchedulerConfig};

mod download;
mod exchange;
mod faults;

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// A running node. Its receive loop stops when this is dropped.
pub struct Node {
    pub scheduler: Scheduler,
    pub addr: SocketAddr,
    pub keypair: Option<Arc<Keypair>>,
    shutdown: broadcast::Sender<()>,
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Short timers so failure paths finish quickly.
pub fn fast_config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        name: name.to_string(),
        attempts: 3,
        initial_timeout: Duration::from_millis(200),
        sign: true,
    }
}

/// A signing node exporting `tree`, with short timers.
pub async fn spawn_node(name: &str, tree: File) -> Result<Node> {
    spawn_node_with(tree, fast_config(name), true).await
}

pub async fn spawn_node_with(tree: File, config: SchedulerConfig, with_key: bool) -> Result<Node> {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback socket")?;
    let addr = socket.local_addr()?;
    let keypair = with_key.then(|| Arc::new(Keypair::generate()));

    let scheduler = Scheduler::new(Arc::new(socket), new_registry(), tree, keypair.clone(), config);
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(scheduler.clone().run(rx));

    Ok(Node {
        scheduler,
        addr,
        keypair,
        shutdown,
    })
}

pub fn empty_tree(name: &str) -> File {
    File::directory(name.into(), Vec::new())
}

// ── Raw peers ─────────────────────────────────────────────────────────────────

/// A bare socket for speaking the protocol by hand.
pub struct RawPeer {
    pub socket: UdpSocket,
    pub addr: SocketAddr,
}

impl RawPeer {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        Ok(Self { socket, addr })
    }

    pub async fn send(&self, to: SocketAddr, message: &Message) -> Result<()> {
        self.socket.send_to(&message.encode()?, to).await?;
        Ok(())
    }

    /// Next decodable message, or None after `wait`.
    pub async fn recv(&self, wait: Duration) -> Option<(Message, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Message::decode(&buf[..len]).ok().map(|m| (m, from))
    }
}

// ── Temporary directories ─────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A scratch directory removed on drop.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "arbor-it-{tag}-{}-{id}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("failed to create temp dir");
        Self(dir)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Deterministic test content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
