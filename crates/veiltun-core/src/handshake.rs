//! Handshake
//!
//! Drives a session from TCP connect to an applied interface configuration:
//!
//! ```text
//! Idle → Connecting → Authenticating → AwaitingAssignment
//!      → ConfiguringInterface → Forwarding
//! ```
//!
//! Any step may fail; the caller moves the session to `Failed`. There is no
//! retry here. Reconnecting means building a new session.

use crate::auth::build_auth_frame;
use crate::codec::{Obfuscator, HEADER_LEN};
use crate::config::{Identity, TunnelProfile};
use crate::error::TunnelError;
use crate::interface::{TunnelNetworkConfig, VirtualInterface};
use crate::session::{until_cancelled, TunnelSession, TunnelState};
use bytes::BytesMut;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Relay's answer to the auth frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Address assigned to this client
    pub client_address: Ipv4Addr,
    /// Remaining entries of the response, unparsed
    pub additional: Vec<String>,
}

impl Assignment {
    /// Parse a comma-separated address list; the first entry is ours
    pub fn parse(response: &str) -> Result<Self, TunnelError> {
        let mut entries = response.split(',').map(str::trim);

        let client_address = entries
            .next()
            .and_then(|first| first.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| TunnelError::InvalidAssignment(response.to_string()))?;

        Ok(Self {
            client_address,
            additional: entries.filter(|e| !e.is_empty()).map(str::to_string).collect(),
        })
    }
}

/// Build the interface settings for an assigned address
pub fn network_config(profile: &TunnelProfile, client_address: Ipv4Addr) -> TunnelNetworkConfig {
    TunnelNetworkConfig {
        remote_address: profile.remote_address,
        client_address,
        subnet_mask: profile.subnet_mask,
        mtu: profile.mtu,
        dns_servers: profile.dns.clone(),
        default_route: profile.default_route,
    }
}

/// One handshake run over a session
pub struct Handshake<'a> {
    session: &'a TunnelSession,
    profile: &'a TunnelProfile,
    identity: &'a Identity,
    obfuscator: &'a Obfuscator,
}

impl<'a> Handshake<'a> {
    /// Prepare a handshake
    pub fn new(
        session: &'a TunnelSession,
        profile: &'a TunnelProfile,
        identity: &'a Identity,
        obfuscator: &'a Obfuscator,
    ) -> Self {
        Self { session, profile, identity, obfuscator }
    }

    /// Run every step: connect, negotiate, configure
    pub async fn run(
        &self,
        interface: &dyn VirtualInterface,
    ) -> Result<(TcpStream, TunnelNetworkConfig), TunnelError> {
        let mut stream = self.connect().await?;
        let assignment = self.negotiate(&mut stream).await?;
        let config = self.configure(interface, &assignment).await?;
        Ok((stream, config))
    }

    /// `Idle → Connecting`: open the TCP connection
    pub async fn connect(&self) -> Result<TcpStream, TunnelError> {
        self.enter(TunnelState::Connecting).await?;

        let addr = self.profile.server_addr();
        info!("Connecting to relay {} ({})", addr, self.profile.name);

        let mut cancel = self.session.cancelled();
        let stream = until_cancelled(&mut cancel, TcpStream::connect(&addr))
            .await?
            .map_err(|e| TunnelError::ConnectFailure {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// `Connecting → Authenticating → AwaitingAssignment`
    ///
    /// Sends the auth frame and reads the single assignment frame.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<Assignment, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut cancel = self.session.cancelled();

        self.enter(TunnelState::Authenticating).await?;
        let frame = build_auth_frame(self.identity, self.profile.aes_key.as_bytes(), self.obfuscator)?;

        until_cancelled(&mut cancel, stream.write_all(&frame))
            .await?
            .map_err(|e| TunnelError::AuthSendFailure(e.to_string()))?;
        until_cancelled(&mut cancel, stream.flush())
            .await?
            .map_err(|e| TunnelError::AuthSendFailure(e.to_string()))?;
        debug!("Sent auth frame ({} bytes)", frame.len());

        self.enter(TunnelState::AwaitingAssignment).await?;

        let mut header = [0u8; HEADER_LEN];
        until_cancelled(&mut cancel, stream.read_exact(&mut header))
            .await?
            .map_err(|e| TunnelError::HeaderReadFailure(e.to_string()))?;

        let body_len = u16::from_be_bytes(header) as usize;
        let mut body = BytesMut::zeroed(body_len);
        until_cancelled(&mut cancel, stream.read_exact(&mut body))
            .await?
            .map_err(|e| TunnelError::BodyReadFailure(e.to_string()))?;

        self.obfuscator.decode_in_place(&mut body)?;
        let response = String::from_utf8_lossy(&body);
        let assignment = Assignment::parse(&response)?;

        self.session.set_assigned_address(assignment.client_address);
        info!(
            "Relay assigned {} ({} additional entries)",
            assignment.client_address,
            assignment.additional.len()
        );
        Ok(assignment)
    }

    /// `AwaitingAssignment → ConfiguringInterface → Forwarding`
    pub async fn configure(
        &self,
        interface: &dyn VirtualInterface,
        assignment: &Assignment,
    ) -> Result<TunnelNetworkConfig, TunnelError> {
        let mut cancel = self.session.cancelled();

        self.enter(TunnelState::ConfiguringInterface).await?;
        let config = network_config(self.profile, assignment.client_address);
        debug!("Applying network settings: {}", config);

        until_cancelled(&mut cancel, interface.apply_settings(&config))
            .await?
            .map_err(|e| TunnelError::InterfaceConfigFailure(e.to_string()))?;

        self.session.set_network_config(config.clone());
        self.enter(TunnelState::Forwarding).await?;
        info!("Tunnel up: {}", config);
        Ok(config)
    }

    async fn enter(&self, state: TunnelState) -> Result<(), TunnelError> {
        if self.session.is_cancelled() || !self.session.transition(state).await {
            return Err(TunnelError::Cancelled);
        }
        Ok(())
    }
}
