//! Desktop throttle bridge.
//!
//! Connects to a WiThrottle or DCC-Ex command station, relays it to local
//! throttle clients and runs automation scripts from a directory.
//!
//! # Options
//!
//! Every option can also be set from the environment.
//!
//! | Flag | Variable | Default |
//! |------|----------|---------|
//! | `--host` | `BRIDGE_HOST` | `192.168.4.1` |
//! | `--port` | `BRIDGE_PORT` | `12090` |
//! | `--relay-port` | `BRIDGE_RELAY_PORT` | `12090` |
//! | `--relay-clients` | `BRIDGE_RELAY_CLIENTS` | `4` |
//! | `--name` | `BRIDGE_NAME` | `mThrottle` |
//! | `--scripts` | `BRIDGE_SCRIPTS` | `scripts` |
//! | `--autostart` | `BRIDGE_AUTOSTART` | (none) |
//!
//! Logging follows `RUST_LOG`, defaulting to `info`.
//!
//! # Run
//!
//! ```bash
//! cargo run --features net --bin bridge -- --host 10.0.0.5
//! BRIDGE_HOST=10.0.0.5 cargo run --features net --bin bridge
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;

use rs_throttle_bridge::bridge::BridgeCore;
use rs_throttle_bridge::config::{Config, DeviceConfig, NetworkConfig, RelayConfig};
use rs_throttle_bridge::services::{
    run_relay, run_ticker, run_upstream, DirScripts, LogSink, LoggedPins, SharedBridge,
};

#[derive(Debug, Parser)]
#[command(name = "bridge", about = "WiThrottle / DCC-Ex throttle bridge")]
struct Args {
    /// Command station host
    #[arg(long, env = "BRIDGE_HOST", default_value = "192.168.4.1")]
    host: String,

    /// Command station port
    #[arg(long, env = "BRIDGE_PORT", default_value_t = 12090)]
    port: u16,

    /// Port local throttles connect to
    #[arg(long, env = "BRIDGE_RELAY_PORT", default_value_t = 12090)]
    relay_port: u16,

    /// Maximum simultaneous relay clients
    #[arg(long, env = "BRIDGE_RELAY_CLIENTS", default_value_t = 4)]
    relay_clients: usize,

    /// Device name announced upstream and to relay clients
    #[arg(long, env = "BRIDGE_NAME", default_value = "mThrottle")]
    name: String,

    /// Directory automation scripts are read from
    #[arg(long, env = "BRIDGE_SCRIPTS", default_value = "scripts")]
    scripts: PathBuf,

    /// Script to start once connected
    #[arg(long, env = "BRIDGE_AUTOSTART")]
    autostart: Option<String>,
}

impl Args {
    fn config(&self) -> Config {
        Config::default()
            .with_network(NetworkConfig::default().with_host(&self.host).with_port(self.port))
            .with_relay(
                RelayConfig::default()
                    .with_port(self.relay_port)
                    .with_max_clients(self.relay_clients),
            )
            .with_device(DeviceConfig::default().with_name(&self.name))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // =========================================================================
    // Configuration
    // =========================================================================
    let args = Args::parse();
    let config = args.config();
    let scripts = DirScripts::new(&args.scripts);
    info!(
        "[bridge] {} -> {}:{}, scripts in {}",
        config.device.name,
        config.network.host,
        config.network.port,
        scripts.root().display()
    );

    let relay_port = config.relay.port;
    let relay_enabled = config.relay.enabled;
    let shared = Arc::new(SharedBridge::new(BridgeCore::new(config)));

    // =========================================================================
    // Autostart
    // =========================================================================
    if let Some(name) = &args.autostart {
        let now = shared.now_ms();
        match shared.with_core(|core| core.spawn_script(name, now, &scripts, &mut LoggedPins, false)) {
            Ok(pid) => info!("[bridge] autostart {} as process {}", name, pid),
            Err(err) => warn!("[bridge] autostart {} failed: {}", name, err),
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================
    if relay_enabled {
        let listener = TcpListener::bind(("0.0.0.0", relay_port))
            .await
            .with_context(|| format!("binding relay port {}", relay_port))?;
        tokio::spawn(run_relay(Arc::clone(&shared), listener));
    }
    tokio::spawn(run_ticker(Arc::clone(&shared), scripts, LoggedPins, LogSink::default()));

    tokio::select! {
        _ = run_upstream(Arc::clone(&shared)) => {
            warn!("[bridge] upstream closed, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("[bridge] interrupted");
            shared.with_core(|core| core.close_session());
        }
    }
    Ok(())
}
