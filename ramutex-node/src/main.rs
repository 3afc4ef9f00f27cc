// ramutex node: listener, peer dialing, periodic presence broadcast and optional lock demo.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use ramutex_core::{Facing, NodeId, PresenceSnapshot, PresenceTable};
use ramutex_node::config::{self, PeerEntry};
use ramutex_node::{Coordinator, StateCallback};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run one peer of the distributed mutual-exclusion group.
#[derive(Debug, Parser)]
#[command(name = "ramutex-node", version)]
struct Cli {
    /// Config file (default: ~/.config/ramutex/config.toml, then /etc/ramutex/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// This node's id; overrides the config file.
    #[arg(long)]
    id: Option<u32>,
    /// Listen port; overrides the config file.
    #[arg(long)]
    port: Option<u16>,
    /// Peer to dial as <id>@<host:port>. Repeatable; adds to the config file's peers.
    #[arg(long = "peer")]
    peers: Vec<PeerEntry>,
    /// Request the critical section every N milliseconds (0 = never).
    #[arg(long, default_value_t = 0)]
    lock_every_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    cfg.apply_overrides(cli.id, cli.port, cli.peers);
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, cli.lock_every_ms))
}

async fn run(cfg: config::Config, lock_every_ms: u64) -> anyhow::Result<()> {
    let me = cfg.node_id();
    let presence = Arc::new(Mutex::new(PresenceTable::with_window(
        me,
        cfg.liveness_window(),
    )));

    let table = presence.clone();
    let on_state: StateCallback = Arc::new(move |sender: NodeId, payload: String| {
        let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
        match table.apply_payload(&payload, Instant::now()) {
            Ok(true) => info!(peer = %sender, "new remote entity"),
            Ok(false) => {}
            Err(e) => warn!(peer = %sender, "bad state payload: {e}"),
        }
    });

    let coordinator = Coordinator::bind(cfg.settings(), Some(on_state))
        .await
        .context("starting listener")?;
    info!(node = %me, addr = %coordinator.local_addr(), "node started");

    for peer in &cfg.peers {
        if let Err(e) = coordinator
            .connect_to_peer(peer.addr.as_str(), NodeId(peer.id))
            .await
        {
            warn!(peer = peer.id, addr = %peer.addr, "dial failed: {e}");
        }
    }

    // Local entity walks right one step per broadcast; the position is what peers render.
    let step = Arc::new(AtomicU64::new(0));
    let walker = step.clone();
    coordinator.spawn_state_broadcast(cfg.state_interval(), move || {
        let n = walker.fetch_add(1, Ordering::Relaxed);
        PresenceSnapshot {
            node: me,
            x: 48 * 23 + (n % 480) as i32,
            y: 48 * 21,
            facing: Facing::Right,
            frame: (n / 10 % 2 + 1) as u8,
        }
        .encode()
    });

    let expiry_table = presence.clone();
    let window = cfg.liveness_window();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window / 4);
        loop {
            ticker.tick().await;
            let gone = expiry_table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .expire(Instant::now());
            for node in gone {
                info!(peer = %node, "remote entity expired");
            }
        }
    });

    if lock_every_ms > 0 {
        let locker = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(lock_every_ms));
            let mut held = 0u64;
            loop {
                ticker.tick().await;
                if locker.has_open_request() {
                    continue;
                }
                held += 1;
                let n = held;
                match locker.request_critical_section(move || {
                    info!(entry = n, "holding the shared critical section");
                }) {
                    Ok(_) => {}
                    Err(e) => warn!("lock request rejected: {e}"),
                }
            }
        });
    }

    shutdown_signal().await?;
    coordinator.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
