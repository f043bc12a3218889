use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use proxymux::dev::{ChannelFactory, NetDevice, PacketLower, TapFactory, mac_add};
use proxymux::{Mux, MuxConfig};

#[derive(Parser)]
#[command(name = "proxymux")]
#[command(about = "Proxy interface multiplexer between the host stack and a switch ASIC")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Side-band socket name (overrides the config file)
    #[arg(short, long)]
    name: Option<String>,

    /// Use in-memory devices instead of TAP interfaces and packet sockets
    #[arg(long)]
    dry_run: bool,

    /// Additional lower interface (can be repeated)
    #[arg(long)]
    lower: Vec<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,

    /// Seconds between counter summaries at debug level (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => MuxConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MuxConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    config.lowers.extend(args.lower);

    let lowers = config.lowers.clone();
    let base_mac = config.base_mac().context("invalid base_mac")?;
    let channels = Arc::new(ChannelFactory::new());
    let mux = if args.dry_run {
        Mux::builder(config).devices(channels.clone()).build()?
    } else {
        Mux::builder(config).devices(Arc::new(TapFactory)).build()?
    };

    for (i, name) in lowers.iter().enumerate() {
        let device: Arc<dyn NetDevice> = if args.dry_run {
            channels.make(name, mac_add(base_mac, 0x100 + i as u32))
        } else {
            Arc::new(PacketLower::open(name).with_context(|| format!("opening lower {name}"))?)
        };
        let index = mux.attach_lower(device)?;
        info!(lower = %name, index, "Lower attached");
    }

    let ports = mux.provision_ports()?;
    info!(ports = ports.len(), dry_run = args.dry_run, "Ports provisioned");

    mux.start()?;

    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let period = Duration::from_secs(args.stats_interval.max(1));
    let mut stats = tokio::time::interval(period);
    stats.tick().await;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = stats.tick(), if args.stats_interval > 0 => {
                log_stats(&mux);
            }
        }
    }

    mux.stop();
    info!("Stopped");
    Ok(())
}

fn log_stats(mux: &Mux) {
    for (name, value) in mux.stats_summary() {
        if value != 0 {
            debug!(counter = %name, value, "Counter");
        }
    }
}
