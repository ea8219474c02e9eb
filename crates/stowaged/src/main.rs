//! stowaged - the stowage volume-management daemon.
//!
//! Wires the pieces together: volume declarations from the command
//! line, a netlink reader feeding kernel block events, the single
//! engine thread that owns all volume state, and the line-oriented
//! control socket.

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stowage::netlink::NetlinkSource;
use stowage::VolumeManager;
use stowage_common::StowagePaths;

mod config;
mod control;
mod dispatch;
mod engine;

use engine::EngineRequest;

#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory for the daemon's filesystem layout
    #[arg(long, env = "STOWAGE_ROOT", default_value = "/")]
    root: std::path::PathBuf,

    /// Control socket path (defaults to dev/socket/stowaged under the root)
    #[arg(long)]
    socket: Option<std::path::PathBuf>,

    /// USB mass-storage LUN backing file
    #[arg(
        long,
        default_value = "/sys/devices/platform/usb_mass_storage/lun0/file"
    )]
    lun_file: std::path::PathBuf,

    /// Managed volume declaration:
    /// label:mountpoint:sysfs_prefix[,prefix...][:flags[:partnum]]
    #[arg(long = "volume", value_name = "SPEC")]
    volumes: Vec<String>,

    /// Enable debug logging on every volume
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("stowage=info".parse()?))
        .init();

    let args = Args::parse();

    let paths = StowagePaths::with_root(&args.root);
    paths.create_dirs()?;
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| args.root.join("dev/socket/stowaged"));

    let mut manager = VolumeManager::with_memory_props(paths.clone(), &args.lun_file);
    manager.set_debug(args.debug);
    for spec in &args.volumes {
        let config = config::parse_volume_spec(spec, &paths)?;
        manager.add_volume(config)?;
    }
    let broadcaster = manager.services().broadcaster.clone();

    let (engine_tx, engine_rx) = mpsc::unbounded_channel::<EngineRequest>();

    // Kernel events arrive on a dedicated reader thread and are drained
    // by the engine in FIFO order.
    let (uevent_tx, mut uevent_rx) = mpsc::unbounded_channel();
    match NetlinkSource::open() {
        Ok(source) => {
            let _reader = std::thread::Builder::new()
                .name("uevent-reader".into())
                .spawn(move || {
                    if let Err(err) = source.run(uevent_tx) {
                        tracing::error!(%err, "uevent reader exited");
                    }
                })?;
        }
        Err(err) => {
            tracing::warn!(%err, "cannot open uevent socket; hotplug disabled");
        }
    }
    let kernel_tx = engine_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = uevent_rx.recv().await {
            if kernel_tx.send(EngineRequest::Kernel(event)).is_err() {
                break;
            }
        }
    });

    // All state mutation happens on this one thread.
    let _engine = std::thread::Builder::new()
        .name("engine".into())
        .spawn(move || engine::run(manager, engine_rx))?;

    tracing::info!(socket = %socket.display(), "stowaged started");
    control::serve(&socket, engine_tx, broadcaster).await?;
    Ok(())
}
