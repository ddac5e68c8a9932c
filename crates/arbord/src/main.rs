//! arbord: arbor peer-to-peer file sharing daemon.
//!
//! ```text
//! arbord [serve]        export the configured tree until Ctrl-C
//! arbord fetch <peer>   download a peer's tree into download_dir
//! ```
//!
//! `<peer>` is a socket address or a name known to the directory.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

use arbor_core::config::ArborConfig;
use arbor_core::crypto::load_or_create_keypair;
use arbor_core::disk::{load_tree, save_tree};
use arbor_core::tree::{File, Name};
use arbor_services::{new_registry, HttpDirectory, Scheduler, SchedulerConfig};

enum Command {
    Serve,
    Fetch(String),
}

fn parse_args() -> Result<Command> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => Ok(Command::Serve),
        Some("fetch") => match args.next() {
            Some(peer) => Ok(Command::Fetch(peer)),
            None => bail!("usage: arbord fetch <peer>"),
        },
        Some(other) => bail!("unknown command {other:?}; usage: arbord [serve | fetch <peer>]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let command = parse_args()?;

    // Load config
    if let Err(e) = ArborConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ArborConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ArborConfig::default()
    });
    tracing::info!(name = %config.identity.name, "arbord starting");

    let keypair = if config.identity.sign_messages {
        let kp = load_or_create_keypair(&config.identity.keypair_path)
            .context("failed to load key pair")?;
        tracing::info!(public_key = hex::encode(kp.public.to_raw()), "identity loaded");
        Some(Arc::new(kp))
    } else {
        None
    };

    let exported = load_export(&config.export.root)?;
    tracing::info!(
        root = hex::encode(exported.hash()),
        path = %config.export.root.display(),
        "export loaded"
    );

    let socket = UdpSocket::bind(&config.network.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.bind_addr))?;
    let socket = Arc::new(socket);
    tracing::info!(addr = %socket.local_addr()?, "socket bound");

    let scheduler = Scheduler::new(
        socket,
        new_registry(),
        exported,
        keypair,
        SchedulerConfig::from(&config),
    );

    let directory = if config.discovery.endpoint.is_empty() {
        None
    } else {
        Some(HttpDirectory::new(
            &config.discovery.endpoint,
            Duration::from_secs(config.discovery.timeout_secs),
            config.discovery.accept_invalid_certs,
        )?)
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receive_task = tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));

    let bootstrap_task = {
        let scheduler = scheduler.clone();
        let directory = directory.clone();
        let peers = config.discovery.bootstrap_peers.clone();
        tokio::spawn(async move {
            for peer in peers {
                match resolve(&peer, directory.as_ref()).await {
                    Ok(addrs) => {
                        if contact(&scheduler, &peer, &addrs).await.is_none() {
                            tracing::warn!(peer, "bootstrap peer unreachable");
                        }
                    }
                    Err(e) => tracing::warn!(peer, error = %e, "cannot resolve bootstrap peer"),
                }
            }
        })
    };

    let keepalive_task = tokio::spawn(keepalive_loop(
        scheduler.clone(),
        config.network.keepalive_secs,
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    match command {
        Command::Serve => {
            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("shutting down"),
                r = receive_task       => tracing::error!("receive loop exited: {:?}", r),
                r = keepalive_task     => tracing::error!("keepalive task exited: {:?}", r),
            }
        }
        Command::Fetch(peer) => {
            let download_dir = config.export.download_dir.clone();
            tokio::select! {
                _ = shutdown_rx.recv() => tracing::info!("fetch interrupted"),
                r = fetch(&scheduler, directory.as_ref(), &peer, &download_dir) => {
                    let _ = shutdown_tx.send(());
                    r?;
                }
            }
        }
    }

    bootstrap_task.abort();
    Ok(())
}

/// Load the exported tree, or serve an empty directory if the path is
/// missing.
fn load_export(root: &Path) -> Result<File> {
    if root.exists() {
        return load_tree(root).with_context(|| format!("failed to load {}", root.display()));
    }
    tracing::warn!(path = %root.display(), "export path missing, serving an empty directory");
    let name = root
        .file_name()
        .map(|n| Name::new(n.as_encoded_bytes()))
        .unwrap_or_default();
    Ok(File::directory(name, Vec::new()))
}

/// A literal socket address, or every address the directory lists for a name.
async fn resolve(peer: &str, directory: Option<&HttpDirectory>) -> Result<Vec<SocketAddr>> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    let Some(directory) = directory else {
        bail!("{peer:?} is not an address and no directory is configured");
    };
    let addrs = directory.addresses(peer).await?;
    if addrs.is_empty() {
        bail!("directory lists no addresses for {peer:?}");
    }
    Ok(addrs)
}

/// Handshake with the first address that answers.
async fn contact(scheduler: &Scheduler, peer: &str, addrs: &[SocketAddr]) -> Option<SocketAddr> {
    for &addr in addrs {
        match scheduler.handshake(addr).await {
            Ok(_) => return Some(addr),
            Err(e) => tracing::debug!(peer, addr = %addr, error = %e, "handshake failed"),
        }
    }
    None
}

async fn fetch(
    scheduler: &Scheduler,
    directory: Option<&HttpDirectory>,
    peer: &str,
    download_dir: &Path,
) -> Result<()> {
    let addrs = resolve(peer, directory).await?;
    let Some(addr) = contact(scheduler, peer, &addrs).await else {
        bail!("no address of {peer:?} answered");
    };

    let tree = scheduler
        .fetch_tree(addr)
        .await
        .with_context(|| format!("failed to fetch tree from {peer}"))?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let safe_peer: String = peer
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let target = download_dir.join(format!("{safe_peer}-{stamp}"));
    save_tree(&target, &tree)?;

    print!("{}", tree.render(true));
    tracing::info!(peer, path = %target.display(), "tree saved");
    Ok(())
}

/// Re-greet every known peer so NAT bindings and registry entries stay fresh.
async fn keepalive_loop(scheduler: Scheduler, period_secs: u64) {
    if period_secs == 0 {
        std::future::pending::<()>().await;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(period_secs));
    interval.tick().await;
    loop {
        interval.tick().await;
        let peers: Vec<SocketAddr> = scheduler.registry().iter().map(|e| *e.key()).collect();
        for addr in peers {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.hello(addr).await {
                    tracing::debug!(peer = %addr, error = %e, "keepalive failed");
                }
            });
        }
    }
}
