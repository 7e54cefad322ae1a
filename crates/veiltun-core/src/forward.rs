//! Packet Forwarding
//!
//! Two tasks per session, one per direction. Each keeps at most one socket
//! operation in flight and re-arms itself until the session is cancelled.
//!
//! ```text
//! VirtualInterface ──read_packets──▶ encode ──write──▶ relay socket
//! VirtualInterface ◀─write_packets── decode ◀──read─── relay socket
//! ```
//!
//! A failed send drops that packet and the loop continues. A failed or
//! closed receive ends the session.

use crate::codec::{FrameBuffer, Obfuscator, HEADER_LEN};
use crate::error::TunnelError;
use crate::interface::{ProtocolFamily, VirtualInterface};
use crate::session::{wait_cancelled, TunnelSession};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Handles of the two forwarding tasks
#[derive(Debug)]
pub struct ForwardingTasks {
    local_to_remote: JoinHandle<()>,
    remote_to_local: JoinHandle<()>,
}

impl ForwardingTasks {
    /// Wait for both directions to finish
    pub async fn join(self) {
        if let Err(e) = self.local_to_remote.await {
            warn!("Local-to-remote task ended abnormally: {}", e);
        }
        if let Err(e) = self.remote_to_local.await {
            warn!("Remote-to-local task ended abnormally: {}", e);
        }
    }

    /// Have both directions stopped?
    pub fn is_finished(&self) -> bool {
        self.local_to_remote.is_finished() && self.remote_to_local.is_finished()
    }
}

/// Packet forwarding engine for one session
#[derive(Clone)]
pub struct Forwarder {
    session: Arc<TunnelSession>,
    interface: Arc<dyn VirtualInterface>,
    obfuscator: Arc<Obfuscator>,
    recv_chunk_size: usize,
}

impl Forwarder {
    /// Create a forwarder
    pub fn new(
        session: Arc<TunnelSession>,
        interface: Arc<dyn VirtualInterface>,
        obfuscator: Arc<Obfuscator>,
        recv_chunk_size: usize,
    ) -> Self {
        Self {
            session,
            interface,
            obfuscator,
            recv_chunk_size: recv_chunk_size.max(HEADER_LEN),
        }
    }

    /// Spawn both directions over the split relay socket
    pub fn spawn<R, W>(self, reader: R, writer: W) -> ForwardingTasks
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("Session {}: forwarding started", self.session.id());

        let outbound = self.clone();
        ForwardingTasks {
            local_to_remote: tokio::spawn(outbound.local_to_remote(writer)),
            remote_to_local: tokio::spawn(self.remote_to_local(reader)),
        }
    }

    /// Interface → relay, one batch at a time
    pub async fn local_to_remote<W>(self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        let mut cancel = self.session.cancelled();

        loop {
            let batch = tokio::select! {
                _ = wait_cancelled(&mut cancel) => break,
                batch = self.interface.read_packets() => batch,
            };

            let packets = match batch {
                Ok(packets) => packets,
                Err(e) => {
                    self.session.fail(TunnelError::InterfaceReadFailure(e.to_string())).await;
                    break;
                }
            };

            for packet in packets {
                if self.session.is_cancelled() {
                    return;
                }
                self.send_packet(&mut writer, &packet, &mut cancel).await;
            }

            if let Err(e) = writer.flush().await {
                self.session.report(TunnelError::ForwardSendFailure(e.to_string()));
            }
        }

        debug!("Session {}: local-to-remote stopped", self.session.id());
    }

    async fn send_packet<W>(
        &self,
        writer: &mut W,
        packet: &[u8],
        cancel: &mut tokio::sync::watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin,
    {
        let counters = self.session.counters();

        let frame = match self.obfuscator.encode(packet) {
            Ok(frame) => frame,
            Err(e) => {
                counters.record_send_failure();
                self.session.report(TunnelError::ForwardSendFailure(e.to_string()));
                return;
            }
        };

        let sent = tokio::select! {
            _ = wait_cancelled(cancel) => return,
            sent = writer.write_all(&frame) => sent,
        };

        match sent {
            Ok(()) => {
                counters.record_sent(frame.len());
                trace!("Sent {} byte packet ({} on wire)", packet.len(), frame.len());
            }
            Err(e) => {
                counters.record_send_failure();
                self.session.report(TunnelError::ForwardSendFailure(e.to_string()));
            }
        }
    }

    /// Relay → interface, reassembling frames across reads
    pub async fn remote_to_local<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut cancel = self.session.cancelled();
        let mut chunk = vec![0u8; self.recv_chunk_size];
        let mut buffer = FrameBuffer::with_capacity(self.recv_chunk_size);

        loop {
            let read = tokio::select! {
                _ = wait_cancelled(&mut cancel) => break,
                read = reader.read(&mut chunk) => read,
            };

            let n = match read {
                Ok(0) => {
                    self.session
                        .fail(TunnelError::ForwardReceiveFailure("connection closed by relay".into()))
                        .await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    self.session.fail(TunnelError::ForwardReceiveFailure(e.to_string())).await;
                    break;
                }
            };

            buffer.extend(&chunk[..n]);
            let packets = self.extract_packets(&mut buffer);
            if packets.is_empty() {
                continue;
            }
            if self.session.is_cancelled() {
                break;
            }

            let families = vec![ProtocolFamily::Inet; packets.len()];
            let written = tokio::select! {
                _ = wait_cancelled(&mut cancel) => break,
                written = self.interface.write_packets(packets, families) => written,
            };
            if let Err(e) = written {
                warn!("Session {}: failed to deliver packets: {}", self.session.id(), e);
            }
        }

        debug!("Session {}: remote-to-local stopped", self.session.id());
    }

    /// Decode every complete frame currently buffered
    fn extract_packets(&self, buffer: &mut FrameBuffer) -> Vec<Bytes> {
        let counters = self.session.counters();
        let mut packets = Vec::new();

        while let Some(mut body) = buffer.next_frame() {
            let wire_len = HEADER_LEN + body.len();
            match self.obfuscator.decode_in_place(&mut body) {
                Ok(()) => {
                    counters.record_received(wire_len);
                    packets.push(body.freeze());
                }
                Err(e) => {
                    counters.record_framing_error();
                    self.session.report(TunnelError::FramingError(e));
                }
            }
        }

        packets
    }
}
