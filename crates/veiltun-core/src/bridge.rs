//! Proxy/Core Bridge
//!
//! Hands the tunnel over to the external proxy engine that processes
//! application traffic. The engine is opaque: it takes a config file path and
//! the virtual interface's file descriptor, and exposes start, stop and
//! activate.
//!
//! # Generated Files
//!
//! ```text
//! <config_dir>/core-config.json   decoded engine template
//! <config_dir>/core-run.json      {"datDir", "configPath", "maxMemory"}
//! ```

use crate::config::CoreSettings;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the materialized engine template
pub const ENGINE_CONFIG_FILE: &str = "core-config.json";

/// File name of the run request handed to the engine
pub const RUN_CONFIG_FILE: &str = "core-run.json";

/// Highest descriptor number inspected when scanning for the tunnel
#[cfg(any(target_os = "macos", target_os = "ios"))]
const MAX_SCAN_FD: i32 = 1024;

/// OS file descriptor backing the virtual interface
pub type TunnelFd = i32;

/// Bridge errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid engine template: {0}")]
    Template(String),

    #[error("Failed to write engine config: {0}")]
    Write(String),

    #[error("Tunnel file descriptor not found")]
    DescriptorNotFound,

    #[error("Engine error: {0}")]
    Engine(String),
}

/// The external proxy engine
///
/// Calls may block; the bridge runs them off the async runtime.
pub trait CoreEngine: Send + Sync {
    /// Start processing traffic on `tun_fd` with the config at `config_path`
    fn start(&self, config_path: &Path, tun_fd: TunnelFd) -> Result<(), CoreError>;

    /// Stop the engine
    fn stop(&self);

    /// Tell a started engine the tunnel is ready for traffic
    fn activate(&self) -> Result<(), CoreError>;
}

/// Run request consumed by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunConfig<'a> {
    dat_dir: &'a str,
    config_path: String,
    max_memory: u64,
}

/// Bridge between the tunnel and the external engine
pub struct CoreBridge {
    engine: Arc<dyn CoreEngine>,
    settings: CoreSettings,
    tunnel_fd: Option<TunnelFd>,
    running: AtomicBool,
}

impl CoreBridge {
    /// Create a bridge
    pub fn new(engine: Arc<dyn CoreEngine>, settings: CoreSettings) -> Self {
        Self {
            engine,
            settings,
            tunnel_fd: None,
            running: AtomicBool::new(false),
        }
    }

    /// Use a known descriptor instead of scanning for one
    pub fn with_tunnel_fd(mut self, fd: TunnelFd) -> Self {
        self.tunnel_fd = Some(fd);
        self
    }

    /// Is the engine running?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Write the engine config and run request; returns the run request path
    pub fn generate_config(&self) -> Result<PathBuf, CoreError> {
        let dir = &self.settings.config_dir;
        std::fs::create_dir_all(dir).map_err(|e| CoreError::Write(e.to_string()))?;

        let template = decode_template(&self.settings.template)?;
        let engine_path = dir.join(ENGINE_CONFIG_FILE);
        write_json(&engine_path, &template)?;

        let run = RunConfig {
            dat_dir: &self.settings.dat_dir,
            config_path: engine_path.to_string_lossy().into_owned(),
            max_memory: self.settings.max_memory,
        };
        let run_path = dir.join(RUN_CONFIG_FILE);
        write_json(&run_path, &run)?;

        debug!("Wrote engine config to {}", run_path.display());
        Ok(run_path)
    }

    /// Generate config, find the tunnel descriptor and start the engine
    pub fn start(&self) -> Result<(), CoreError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.launch();
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn launch(&self) -> Result<(), CoreError> {
        let config_path = self.generate_config()?;
        let fd = self
            .tunnel_fd
            .or_else(locate_tunnel_fd)
            .ok_or(CoreError::DescriptorNotFound)?;

        info!("Starting core engine (fd {}, config {})", fd, config_path.display());
        self.engine.start(&config_path, fd)?;
        if let Err(e) = self.engine.activate() {
            warn!("Core engine activation failed, stopping: {}", e);
            self.engine.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stop the engine. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping core engine");
            self.engine.stop();
        }
    }
}

impl Drop for CoreBridge {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Core bridge dropped while engine running");
            self.stop();
        }
    }
}

/// Decode the base64 template into a JSON object; empty means `{}`
fn decode_template(template: &str) -> Result<serde_json::Value, CoreError> {
    if template.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }

    let raw = BASE64
        .decode(template.trim())
        .map_err(|e| CoreError::Template(e.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| CoreError::Template(e.to_string()))?;

    if !value.is_object() {
        return Err(CoreError::Template("template is not a JSON object".to_string()));
    }
    Ok(value)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| CoreError::Write(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| CoreError::Write(format!("{}: {}", path.display(), e)))
}

/// Find the descriptor of the utun control socket
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn locate_tunnel_fd() -> Option<TunnelFd> {
    const SYSPROTO_CONTROL: libc::c_int = 2;
    const UTUN_OPT_IFNAME: libc::c_int = 2;
    const IFNAMSIZ: usize = 16;

    for fd in 0..=MAX_SCAN_FD {
        let mut name = [0u8; IFNAMSIZ];
        let mut len = name.len() as libc::socklen_t;

        // SAFETY: `name` and `len` describe a valid writable buffer; closed or
        // non-socket descriptors fail with an error code.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                name.as_mut_ptr().cast(),
                &mut len,
            )
        };

        if rc == 0 && name.starts_with(b"utun") {
            debug!("Found utun descriptor {}", fd);
            return Some(fd);
        }
    }
    None
}

/// Find the lowest descriptor open on `/dev/net/tun`
#[cfg(target_os = "linux")]
pub fn locate_tunnel_fd() -> Option<TunnelFd> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;

    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            std::fs::read_link(entry.path())
                .map(|target| target == Path::new("/dev/net/tun"))
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.file_name().to_str()?.parse::<TunnelFd>().ok())
        .min()
}

/// No descriptor lookup on this platform
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "linux")))]
pub fn locate_tunnel_fd() -> Option<TunnelFd> {
    None
}
