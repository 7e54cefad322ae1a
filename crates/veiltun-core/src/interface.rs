//! Virtual Interface
//!
//! The OS owns the TUN-like device. The tunnel only sees it through
//! [`VirtualInterface`]: a batched packet source, a packet sink, and a
//! one-shot network settings call.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::{mpsc, Mutex};

/// Protocol family tag attached to packets written to the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// IPv4 (`AF_INET`)
    Inet,
    /// IPv6 (`AF_INET6`)
    Inet6,
}

impl ProtocolFamily {
    /// Numeric address family as used by the host OS
    pub fn as_raw(&self) -> i32 {
        match self {
            ProtocolFamily::Inet => 2,
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            ProtocolFamily::Inet6 => 30,
            #[cfg(not(any(target_os = "macos", target_os = "ios")))]
            ProtocolFamily::Inet6 => 10,
        }
    }
}

/// Network settings applied to the virtual interface once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelNetworkConfig {
    /// Fixed remote end of the virtual adapter
    pub remote_address: IpAddr,
    /// Address assigned by the relay
    pub client_address: Ipv4Addr,
    /// Subnet mask for `client_address`
    pub subnet_mask: Ipv4Addr,
    /// Interface MTU
    pub mtu: u16,
    /// DNS servers
    pub dns_servers: Vec<IpAddr>,
    /// Route all IPv4 traffic through the tunnel
    pub default_route: bool,
}

impl TunnelNetworkConfig {
    /// Prefix length of the subnet mask
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.subnet_mask).count_ones()
    }
}

impl std::fmt::Display for TunnelNetworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} via {} (mtu {}, dns {:?}, default route: {})",
            self.client_address,
            self.prefix_len(),
            self.remote_address,
            self.mtu,
            self.dns_servers,
            self.default_route
        )
    }
}

/// Packet source/sink and settings owner for the local virtual interface
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read the next batch of outbound IP packets
    ///
    /// Called repeatedly for the lifetime of a session. An error ends the
    /// session.
    async fn read_packets(&self) -> io::Result<Vec<Bytes>>;

    /// Deliver inbound IP packets, one family tag per packet
    async fn write_packets(&self, packets: Vec<Bytes>, families: Vec<ProtocolFamily>) -> io::Result<()>;

    /// Apply network settings for a freshly negotiated session
    async fn apply_settings(&self, config: &TunnelNetworkConfig) -> io::Result<()>;
}

/// Channel-backed virtual interface
///
/// Packets sent on the outbound channel are read by the tunnel; packets the
/// tunnel writes appear on the inbound channel. Applied settings are
/// published on a third channel.
pub struct ChannelInterface {
    outbound: Mutex<mpsc::Receiver<Vec<Bytes>>>,
    inbound: mpsc::Sender<Bytes>,
    settings: mpsc::UnboundedSender<TunnelNetworkConfig>,
}

/// Host side of a [`ChannelInterface`]
pub struct ChannelInterfaceHandle {
    /// Send batches of packets into the tunnel
    pub outbound: mpsc::Sender<Vec<Bytes>>,
    /// Packets received from the tunnel
    pub inbound: mpsc::Receiver<Bytes>,
    /// Network settings applied by the tunnel
    pub settings: mpsc::UnboundedReceiver<TunnelNetworkConfig>,
}

impl ChannelInterface {
    /// Create an interface and its host-side handle
    pub fn new(capacity: usize) -> (Self, ChannelInterfaceHandle) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (set_tx, set_rx) = mpsc::unbounded_channel();

        let iface = Self {
            outbound: Mutex::new(out_rx),
            inbound: in_tx,
            settings: set_tx,
        };
        let handle = ChannelInterfaceHandle {
            outbound: out_tx,
            inbound: in_rx,
            settings: set_rx,
        };
        (iface, handle)
    }
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    async fn read_packets(&self) -> io::Result<Vec<Bytes>> {
        self.outbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "packet source closed"))
    }

    async fn write_packets(&self, packets: Vec<Bytes>, _families: Vec<ProtocolFamily>) -> io::Result<()> {
        for packet in packets {
            self.inbound
                .send(packet)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet sink closed"))?;
        }
        Ok(())
    }

    async fn apply_settings(&self, config: &TunnelNetworkConfig) -> io::Result<()> {
        self.settings
            .send(config.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "settings receiver closed"))
    }
}
