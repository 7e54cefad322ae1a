//! Veiltun - Obfuscated TCP Tunnel Client
//!
//! Client data plane for a relay-based VPN. Packets read from a virtual
//! network interface are obfuscated, framed and sent over a single TCP
//! connection; frames from the relay are reassembled and written back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Tunnel Controller                        │
//! │                                                               │
//! │  ┌────────────┐  read_packets   ┌───────────┐   encode        │
//! │  │  Virtual   │────────────────▶│ Forwarder │───────────┐     │
//! │  │ Interface  │◀────────────────│           │◀───────┐  │     │
//! │  └─────┬──────┘  write_packets  └───────────┘ decode │  │     │
//! │        │ fd                                          │  │     │
//! │  ┌─────▼──────┐                                      │  ▼     │
//! │  │ Core Bridge│ (external proxy engine)        ┌─────┴──────┐ │
//! │  └────────────┘                                │ TCP stream │ │
//! │                                                └─────┬──────┘ │
//! └──────────────────────────────────────────────────────│────────┘
//!                                                        │
//!                                                        ▼ TCP
//!                                             ┌────────────────────┐
//!                                             │       Relay        │
//!                                             └────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every message in either direction is `[u16 BE length][body]`, where the
//! body is `XOR(payload || padding || padding_len, key)`.
//!
//! # Session Lifecycle
//!
//! `Idle → Connecting → Authenticating → AwaitingAssignment →
//! ConfiguringInterface → Forwarding`, with `Failed` reachable from any
//! step and `Disconnecting → Idle` on stop. Failures are reported once and
//! never retried.

mod auth;
mod bridge;
mod codec;
mod config;
mod controller;
mod error;
mod forward;
mod handshake;
mod interface;
mod session;

pub use auth::{
    build_auth_frame, open_auth_payload, AuthCipher, AuthError, AuthPayload, ACTION_NEW_CONNECT,
};
pub use bridge::{
    locate_tunnel_fd, CoreBridge, CoreEngine, CoreError, TunnelFd, ENGINE_CONFIG_FILE,
    RUN_CONFIG_FILE,
};
pub use codec::{CodecError, FrameBuffer, Obfuscator, DEFAULT_MAX_PADDING, HEADER_LEN, MAX_BODY_LEN};
pub use config::{ConfigError, ConfigFormat, CoreSettings, Identity, TunnelProfile, VeilConfig};
pub use controller::TunnelController;
pub use error::{ErrorCallback, TunnelError};
pub use forward::{Forwarder, ForwardingTasks};
pub use handshake::{network_config, Assignment, Handshake};
pub use interface::{
    ChannelInterface, ChannelInterfaceHandle, ProtocolFamily, TunnelNetworkConfig,
    VirtualInterface,
};
pub use session::{TunnelSession, TunnelState, TunnelStats};
