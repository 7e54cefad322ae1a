//! Tunnel Session
//!
//! One live relay connection. A session is built per connect attempt and
//! never reused; reconnecting means building a new one.

use crate::error::{ErrorCallback, TunnelError};
use crate::interface::TunnelNetworkConfig;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No session
    Idle,
    /// TCP connect in progress
    Connecting,
    /// Sending the auth frame
    Authenticating,
    /// Waiting for the relay's address assignment
    AwaitingAssignment,
    /// Waiting for the virtual interface to apply settings
    ConfiguringInterface,
    /// Packets flowing in both directions
    Forwarding,
    /// Clean shutdown in progress
    Disconnecting,
    /// Session ended with an error
    Failed,
}

impl TunnelState {
    /// Check if packets are flowing
    pub fn is_forwarding(&self) -> bool {
        matches!(self, TunnelState::Forwarding)
    }

    /// Check if the handshake is in progress
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting
                | TunnelState::Authenticating
                | TunnelState::AwaitingAssignment
                | TunnelState::ConfiguringInterface
        )
    }

    /// Check if the session is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Idle | TunnelState::Failed)
    }
}

/// Traffic counters, updated from both forwarding directions
#[derive(Debug, Default)]
pub(crate) struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_failures: AtomicU64,
    framing_errors: AtomicU64,
}

impl TrafficCounters {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tunnel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Wire bytes sent to the relay
    pub bytes_sent: u64,
    /// Wire bytes received from the relay
    pub bytes_received: u64,
    /// Packets forwarded to the relay
    pub packets_sent: u64,
    /// Packets delivered to the virtual interface
    pub packets_received: u64,
    /// Outbound packets dropped on send failure
    pub send_failures: u64,
    /// Inbound frames dropped as malformed
    pub framing_errors: u64,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts, {} dropped), RX: {:.2}MB ({} pkts, {} malformed)",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.send_failures,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.framing_errors
        )
    }
}

/// A live relay connection
///
/// Holds the state, the handshake result and the shutdown signal shared by
/// the forwarding tasks. Socket halves and the receive buffer are owned by
/// those tasks, never by globals.
pub struct TunnelSession {
    id: u64,
    state: RwLock<TunnelState>,
    assigned: OnceLock<Ipv4Addr>,
    network: OnceLock<TunnelNetworkConfig>,
    counters: TrafficCounters,
    shutdown: watch::Sender<bool>,
    on_error: Option<ErrorCallback>,
    started_at: Instant,
}

impl TunnelSession {
    /// Create a new session in the `Idle` state
    pub fn new(id: u64, on_error: Option<ErrorCallback>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            state: RwLock::new(TunnelState::Idle),
            assigned: OnceLock::new(),
            network: OnceLock::new(),
            counters: TrafficCounters::default(),
            shutdown,
            on_error,
            started_at: Instant::now(),
        })
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub async fn state(&self) -> TunnelState {
        *self.state.read().await
    }

    /// Move to `next` unless the session failed or is shutting down
    ///
    /// Returns `false` when the transition was refused.
    pub async fn transition(&self, next: TunnelState) -> bool {
        let mut state = self.state.write().await;
        if *state == TunnelState::Failed {
            return false;
        }
        if *state == TunnelState::Disconnecting && next != TunnelState::Idle {
            return false;
        }
        debug!("Session {}: {:?} -> {:?}", self.id, *state, next);
        *state = next;
        true
    }

    /// Address assigned by the relay
    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.assigned.get().copied()
    }

    pub(crate) fn set_assigned_address(&self, addr: Ipv4Addr) {
        let _ = self.assigned.set(addr);
    }

    /// Network settings negotiated for this session
    pub fn network_config(&self) -> Option<&TunnelNetworkConfig> {
        self.network.get()
    }

    pub(crate) fn set_network_config(&self, config: TunnelNetworkConfig) {
        let _ = self.network.set(config);
    }

    pub(crate) fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    /// Snapshot of traffic statistics
    pub fn stats(&self) -> TunnelStats {
        let c = &self.counters;
        TunnelStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            framing_errors: c.framing_errors.load(Ordering::Relaxed),
        }
    }

    /// Time since the session was created
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Has the session been torn down?
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tear the session down. Idempotent.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Subscribe to the teardown signal
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Hand a non-fatal error to the error callback
    pub(crate) fn report(&self, err: TunnelError) {
        warn!("Session {}: {}", self.id, err);
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    /// End the session with `err`
    ///
    /// Reported once; ignored if the session is already cancelled or failed.
    pub(crate) async fn fail(&self, err: TunnelError) {
        if self.is_cancelled() {
            debug!("Session {}: ignoring {} after teardown", self.id, err);
            return;
        }
        {
            let mut state = self.state.write().await;
            if *state == TunnelState::Failed {
                return;
            }
            *state = TunnelState::Failed;
        }
        self.cancel();

        error!("Session {} failed: {}", self.id, err);
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("assigned", &self.assigned.get())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Resolve once the session behind `rx` is cancelled
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    // Sender lives inside the session; an Err means the session is gone.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

/// Run `fut` unless the session is cancelled first
pub(crate) async fn until_cancelled<F: Future>(
    rx: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, TunnelError> {
    tokio::select! {
        _ = wait_cancelled(rx) => Err(TunnelError::Cancelled),
        out = fut => Ok(out),
    }
}
