// Nearby chat for Linux: LAN discovery and transport, lines from stdin to every peer.

mod config;
mod discovery;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nearby_core::{
    device_name, ConnectionState, PeerId, SessionError, SessionListener, SessionManager,
    INVITE_TIMEOUT,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::transport::{LanOptions, LanTransport};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Time for queued `Bye` frames to reach peers before the runtime stops.
const LINGER: Duration = Duration::from_millis(200);

/// Prints received payloads as `name: text` and state changes as notices.
struct Console;

impl SessionListener for Console {
    fn on_data_received(&self, payload: &[u8], from: &PeerId) {
        println!("{}: {}", from.display_name(), String::from_utf8_lossy(payload));
    }

    fn on_state_changed(&self, peer: &PeerId, state: ConnectionState) {
        println!("* {} {}", peer.display_name(), state);
    }

    fn on_error(&self, error: &SessionError) {
        warn!(%error, "session error");
    }
}

fn main() -> anyhow::Result<()> {
    let mut name = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nearby-linux {}", VERSION);
                return Ok(());
            }
            "--name" => name = Some(args.next().context("--name needs a value")?),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let mut cfg = config::load()?;
    if name.is_some() {
        cfg.display_name = name;
    }
    init_logging(&cfg.log_level);
    let local = PeerId::new(device_name(cfg.display_name.as_deref()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, local))
}

/// RUST_LOG wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: config::Config, local: PeerId) -> anyhow::Result<()> {
    let transport = LanTransport::bind(LanOptions {
        discovery_port: cfg.discovery_port,
        transport_port: cfg.transport_port,
        group: discovery::MULTICAST_GROUP,
        invite_read_timeout: INVITE_TIMEOUT,
    })
    .await
    .with_context(|| format!("binding transport port {}", cfg.transport_port))?;
    let port = transport.listen_port();
    let manager =
        SessionManager::new(Arc::new(transport), local).context("spawning dispatcher")?;
    manager.set_listener(Arc::new(Console));
    manager.start();
    info!(me = %manager.current_identity(), port, "session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if manager.send(line.as_bytes()).is_empty() {
                        println!("* nobody connected");
                    }
                }
                None => break,
            },
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    info!("shutting down");
    manager.shutdown();
    tokio::time::sleep(LINGER).await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
