//! Veiltun: obfuscated TCP tunnel client
//!
//! Command line front end for the tunnel library.
//!
//! ```text
//! veiltun sample-config                  print a default config (TOML)
//! veiltun probe <config> [profile]       handshake against a relay, print settings, stop
//! veiltun core-config <config>           write the core engine config, print its path
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use veiltun_core::{
    ChannelInterface, CoreBridge, CoreEngine, CoreError, TunnelController, TunnelFd, VeilConfig,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Handshake deadline for `probe`
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const USAGE: &str = "usage: veiltun <sample-config | probe <config> [profile] | core-config <config>>";

#[tokio::main]
async fn main() -> Result<()> {
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("sample-config") => sample_config(),
        Some("probe") => {
            let path = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            probe(Path::new(path), args.get(2).map(String::as_str)).await
        }
        Some("core-config") => {
            let path = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            core_config(Path::new(path))
        }
        _ => bail!(USAGE),
    }
}

fn load_config(path: &Path) -> Result<VeilConfig> {
    VeilConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn sample_config() -> Result<()> {
    print!("{}", VeilConfig::default_config().to_toml()?);
    Ok(())
}

/// Run one session against a relay with an in-memory interface
async fn probe(path: &Path, profile_name: Option<&str>) -> Result<()> {
    let config = load_config(path)?;
    let profile = match profile_name {
        Some(name) => config.profile(name),
        None => config.default_profile(),
    }
    .cloned()
    .ok_or_else(|| anyhow!("no matching profile in {}", path.display()))?;

    info!("Probing relay {} ({})", profile.server_addr(), profile.name);

    let (iface, _handle) = ChannelInterface::new(64);
    let controller = TunnelController::new(profile, config.identity.clone(), Arc::new(iface))
        .on_error(Arc::new(|e| error!("Tunnel error: {}", e)));

    let started = tokio::time::timeout(PROBE_TIMEOUT, controller.start()).await;
    let outcome = match started {
        Ok(Ok(())) => {
            if let Some(settings) = controller.network_config().await {
                println!("{}", settings);
            }
            Ok(())
        }
        Ok(Err(e)) => Err(anyhow!(e).context("handshake failed")),
        Err(_) => Err(anyhow!("handshake timed out after {:?}", PROBE_TIMEOUT)),
    };

    if let Some(stats) = controller.stats().await {
        info!("{}", stats.format());
    }
    controller.stop().await;
    outcome
}

/// Engine stand-in for commands that only materialize files
struct DetachedEngine;

impl CoreEngine for DetachedEngine {
    fn start(&self, _config_path: &Path, _tun_fd: TunnelFd) -> Result<(), CoreError> {
        Err(CoreError::Engine("no engine linked".to_string()))
    }

    fn stop(&self) {}

    fn activate(&self) -> Result<(), CoreError> {
        Err(CoreError::Engine("no engine linked".to_string()))
    }
}

fn core_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let bridge = CoreBridge::new(Arc::new(DetachedEngine), config.core);
    let run_path: PathBuf = bridge.generate_config()?;
    println!("{}", run_path.display());
    Ok(())
}
