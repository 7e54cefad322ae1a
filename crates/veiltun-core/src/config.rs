//! Tunnel Configuration
//!
//! Client identity, per-deployment tunnel profiles and core engine settings.
//! Loadable from TOML or JSON.
//!
//! # Example
//!
//! ```toml
//! [identity]
//! package = "com.example.vpn"
//! version = "2.4.1"
//! sdk = "1.0.3"
//! country = "US"
//! language = "en"
//!
//! [[profiles]]
//! name = "primary"
//! host = "relay.example.net"
//! port = 8443
//! xor_key = "shared-obfuscation-key"
//! aes_key = "0123456789abcdef0123456789abcdef"
//! mtu = 1400
//!
//! [core]
//! template = "eyJsb2ciOnt9fQ=="
//! config_dir = "/tmp/veiltun"
//! ```

use crate::codec::{CodecError, Obfuscator, DEFAULT_MAX_PADDING};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Smallest MTU an IPv4 host must accept
const MIN_MTU: u16 = 576;

/// Client identity sent in the auth payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// App bundle id
    pub package: String,
    /// App version string
    pub version: String,
    /// Protocol/SDK version string
    pub sdk: String,
    /// Region code
    pub country: String,
    /// Locale code
    pub language: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            package: "com.veiltun.client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sdk: "1.0.0".to_string(),
            country: "US".to_string(),
            language: "en".to_string(),
        }
    }
}

/// One relay deployment (server address, key material, interface settings)
#[derive(Clone, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Profile name
    pub name: String,
    /// Relay host name or IP
    pub host: String,
    /// Relay TCP port
    pub port: u16,
    /// Shared XOR key, applied cyclically
    pub xor_key: String,
    /// AES key for the auth payload (16, 24 or 32 bytes)
    pub aes_key: String,
    /// Virtual interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Upper bound for random frame padding
    #[serde(default = "default_max_padding")]
    pub max_padding: u8,
    /// Subnet mask for the assigned address
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: Ipv4Addr,
    /// Fixed link address of the remote end of the virtual adapter
    #[serde(default = "default_remote_address")]
    pub remote_address: IpAddr,
    /// DNS servers pushed to the virtual interface
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,
    /// Route all traffic through the tunnel
    #[serde(default = "default_true")]
    pub default_route: bool,
    /// Maximum bytes requested per socket receive
    #[serde(default = "default_recv_chunk_size")]
    pub recv_chunk_size: usize,
    /// Is this profile enabled?
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_mtu() -> u16 {
    1400
}

fn default_max_padding() -> u8 {
    DEFAULT_MAX_PADDING
}

fn default_subnet_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 0, 0)
}

fn default_remote_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 10, 0, 1))
}

fn default_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    ]
}

fn default_recv_chunk_size() -> usize {
    65535
}

fn default_true() -> bool {
    true
}

impl TunnelProfile {
    /// Create a profile with default interface settings
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        xor_key: impl Into<String>,
        aes_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            xor_key: xor_key.into(),
            aes_key: aes_key.into(),
            mtu: default_mtu(),
            max_padding: default_max_padding(),
            subnet_mask: default_subnet_mask(),
            remote_address: default_remote_address(),
            dns: default_dns(),
            default_route: true,
            recv_chunk_size: default_recv_chunk_size(),
            enabled: true,
        }
    }

    /// Set the interface MTU
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// `host:port` of the relay
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the frame obfuscator for this profile
    pub fn obfuscator(&self) -> Result<Obfuscator, CodecError> {
        Obfuscator::new(self.xor_key.as_bytes(), self.max_padding)
    }

    /// Validate profile
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid(format!("profile {}: empty host", self.name)));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(format!("profile {}: port is zero", self.name)));
        }
        if self.xor_key.is_empty() {
            return Err(ConfigError::Invalid(format!("profile {}: empty xor_key", self.name)));
        }
        if !matches!(self.aes_key.len(), 16 | 24 | 32) {
            return Err(ConfigError::Invalid(format!(
                "profile {}: aes_key must be 16, 24 or 32 bytes (got {})",
                self.name,
                self.aes_key.len()
            )));
        }
        if self.mtu < MIN_MTU {
            return Err(ConfigError::Invalid(format!(
                "profile {}: mtu {} below {}",
                self.name, self.mtu, MIN_MTU
            )));
        }
        if self.recv_chunk_size == 0 {
            return Err(ConfigError::Invalid(format!(
                "profile {}: recv_chunk_size is zero",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TunnelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProfile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("xor_key", &"[redacted]")
            .field("aes_key", &"[redacted]")
            .field("mtu", &self.mtu)
            .field("max_padding", &self.max_padding)
            .field("subnet_mask", &self.subnet_mask)
            .field("remote_address", &self.remote_address)
            .field("dns", &self.dns)
            .field("default_route", &self.default_route)
            .field("recv_chunk_size", &self.recv_chunk_size)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Settings for the external proxy/core engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Base64-encoded JSON config template for the engine
    #[serde(default)]
    pub template: String,
    /// Directory the generated config files are written to
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Memory budget handed to the engine (bytes)
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,
    /// Engine data directory
    #[serde(default)]
    pub dat_dir: String,
}

fn default_config_dir() -> PathBuf {
    std::env::temp_dir().join("veiltun")
}

fn default_max_memory() -> u64 {
    50 * 1024 * 1024
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            template: String::new(),
            config_dir: default_config_dir(),
            max_memory: default_max_memory(),
            dat_dir: String::new(),
        }
    }
}

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VeilConfig {
    /// Client identity
    #[serde(default)]
    pub identity: Identity,
    /// Relay deployments
    pub profiles: Vec<TunnelProfile>,
    /// Proxy/core engine settings
    #[serde(default)]
    pub core: CoreSettings,
}

impl VeilConfig {
    /// Load from file; format chosen by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&content, format)
    }

    /// Load from string
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with placeholder relays
    ///
    /// Two deployment variants: a standard one and a jumbo-MTU one.
    pub fn default_config() -> Self {
        Self {
            identity: Identity::default(),
            profiles: vec![
                TunnelProfile::new(
                    "primary",
                    "relay1.veiltun.example",
                    8443,
                    "REPLACE_WITH_SHARED_XOR_KEY",
                    "REPLACE_WITH_32_BYTE_AES_KEY_000",
                ),
                TunnelProfile::new(
                    "jumbo",
                    "relay2.veiltun.example",
                    9443,
                    "REPLACE_WITH_SHARED_XOR_KEY",
                    "REPLACE_WITH_32_BYTE_AES_KEY_000",
                )
                .with_mtu(9000),
            ],
            core: CoreSettings::default(),
        }
    }

    /// Find a profile by name
    pub fn profile(&self, name: &str) -> Option<&TunnelProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// First enabled profile
    pub fn default_profile(&self) -> Option<&TunnelProfile> {
        self.profiles.iter().find(|p| p.enabled)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::Invalid("no profiles configured".to_string()));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        Ok(())
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VeilConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profile("primary").unwrap().mtu, 1400);
        assert_eq!(config.profile("jumbo").unwrap().mtu, 9000);
        assert_eq!(config.default_profile().unwrap().name, "primary");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = VeilConfig::default_config();
        let toml = config.to_toml().unwrap();

        let parsed = VeilConfig::parse(&toml, ConfigFormat::Toml).unwrap();
        assert_eq!(parsed.profiles.len(), 2);
        assert_eq!(parsed.identity, config.identity);
        assert_eq!(parsed.profiles[1].mtu, 9000);
    }

    #[test]
    fn test_minimal_toml_defaults() {
        let toml = r#"
            [[profiles]]
            name = "edge"
            host = "10.0.0.1"
            port = 443
            xor_key = "abc"
            aes_key = "0123456789abcdef"
        "#;

        let config = VeilConfig::parse(toml, ConfigFormat::Toml).unwrap();
        let profile = config.default_profile().unwrap();

        assert_eq!(profile.mtu, 1400);
        assert_eq!(profile.max_padding, 128);
        assert_eq!(profile.subnet_mask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(profile.dns.len(), 2);
        assert!(profile.default_route);
        assert_eq!(profile.server_addr(), "10.0.0.1:443");
        assert!(config.core.dat_dir.is_empty());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "identity": {"package": "a.b", "version": "1", "sdk": "2", "country": "DE", "language": "de"},
            "profiles": [{"name": "p", "host": "h", "port": 1, "xor_key": "x", "aes_key": "0123456789abcdef01234567"}]
        }"#;

        let config = VeilConfig::parse(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.identity.country, "DE");
        assert_eq!(config.profiles[0].aes_key.len(), 24);
    }

    #[test]
    fn test_invalid_profiles() {
        let mut profile = TunnelProfile::new("p", "host", 443, "xor", "short");
        assert!(profile.validate().is_err());

        profile.aes_key = "0123456789abcdef".to_string();
        assert!(profile.validate().is_ok());

        profile.xor_key.clear();
        assert!(profile.validate().is_err());

        let profile = TunnelProfile::new("p", "host", 0, "xor", "0123456789abcdef");
        assert!(profile.validate().is_err());

        let profile = TunnelProfile::new("p", "host", 1, "xor", "0123456789abcdef").with_mtu(100);
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_empty_profiles_rejected() {
        let config = VeilConfig {
            identity: Identity::default(),
            profiles: Vec::new(),
            core: CoreSettings::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let profile = TunnelProfile::new("p", "h", 1, "secret-xor", "secret-aes-key-0");
        let out = format!("{:?}", profile);
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_unsupported_extension() {
        let err = VeilConfig::from_file(Path::new("config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat));
    }
}
