//! Tunnel Controller
//!
//! Owns at most one session at a time and coordinates the handshake, the
//! forwarding tasks and the external core engine.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = TunnelController::new(profile, identity, interface)
//!     .with_core(CoreBridge::new(engine, config.core.clone()))
//!     .on_error(Arc::new(|e| eprintln!("tunnel error: {e}")));
//!
//! controller.start().await?;   // returns once packets are flowing
//! println!("{:?}", controller.assigned_address().await);
//!
//! controller.stop().await;     // idempotent
//! ```

use crate::bridge::CoreBridge;
use crate::config::{Identity, TunnelProfile};
use crate::error::{ErrorCallback, TunnelError};
use crate::forward::{Forwarder, ForwardingTasks};
use crate::handshake::Handshake;
use crate::interface::{TunnelNetworkConfig, VirtualInterface};
use crate::session::{wait_cancelled, TunnelSession, TunnelState, TunnelStats};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session slot held by the controller
struct ActiveSession {
    session: Arc<TunnelSession>,
    tasks: Option<ForwardingTasks>,
    core_task: Option<JoinHandle<()>>,
}

/// Tunnel lifecycle controller
pub struct TunnelController {
    profile: TunnelProfile,
    identity: Identity,
    interface: Arc<dyn VirtualInterface>,
    core: Option<Arc<CoreBridge>>,
    on_error: Option<ErrorCallback>,
    active: Mutex<Option<ActiveSession>>,
    next_session_id: AtomicU64,
}

impl TunnelController {
    /// Create a controller for one relay profile
    pub fn new(
        profile: TunnelProfile,
        identity: Identity,
        interface: Arc<dyn VirtualInterface>,
    ) -> Self {
        Self {
            profile,
            identity,
            interface,
            core: None,
            on_error: None,
            active: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Start the external core engine alongside forwarding
    pub fn with_core(mut self, core: CoreBridge) -> Self {
        self.core = Some(Arc::new(core));
        self
    }

    /// Install the error callback
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Relay profile in use
    pub fn profile(&self) -> &TunnelProfile {
        &self.profile
    }

    /// Current session state (`Idle` without a session)
    pub async fn state(&self) -> TunnelState {
        match self.session().await {
            Some(session) => session.state().await,
            None => TunnelState::Idle,
        }
    }

    /// Current session, if any
    pub async fn session(&self) -> Option<Arc<TunnelSession>> {
        self.active.lock().await.as_ref().map(|a| a.session.clone())
    }

    /// Address assigned by the relay for the current session
    pub async fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.session().await?.assigned_address()
    }

    /// Network settings of the current session
    pub async fn network_config(&self) -> Option<TunnelNetworkConfig> {
        self.session().await?.network_config().cloned()
    }

    /// Traffic statistics of the current session
    pub async fn stats(&self) -> Option<TunnelStats> {
        Some(self.session().await?.stats())
    }

    /// Connect, authenticate, configure the interface and start forwarding
    ///
    /// Returns once the session reaches `Forwarding`, or with the single
    /// error that ended it. Never retries.
    ///
    /// A handshake failure is the session's one terminal error: it is
    /// returned here and is also the error delivered to the `on_error`
    /// callback. Both carry the same failure, once each. Hosts that use the
    /// callback as their single error channel can ignore the returned value.
    pub async fn start(&self) -> Result<(), TunnelError> {
        self.profile
            .validate()
            .map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        let obfuscator = Arc::new(
            self.profile
                .obfuscator()
                .map_err(|e| TunnelError::InvalidConfig(e.to_string()))?,
        );

        let session = {
            let mut active = self.active.lock().await;
            if let Some(current) = active.as_ref() {
                if !current.session.state().await.is_terminal() {
                    return Err(TunnelError::AlreadyRunning);
                }
            }
            if let Some(stale) = active.take() {
                Self::teardown(stale, self.core.clone()).await;
            }

            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let session = TunnelSession::new(id, self.on_error.clone());
            *active = Some(ActiveSession {
                session: session.clone(),
                tasks: None,
                core_task: None,
            });
            session
        };

        info!("Starting tunnel session {} ({})", session.id(), self.profile.name);

        let handshake = Handshake::new(&session, &self.profile, &self.identity, &obfuscator);
        let (stream, _config) = match handshake.run(self.interface.as_ref()).await {
            Ok(up) => up,
            Err(TunnelError::Cancelled) => {
                debug!("Session {} cancelled during handshake", session.id());
                return Err(TunnelError::Cancelled);
            }
            Err(e) => {
                session.fail(e.clone()).await;
                return Err(e);
            }
        };

        let mut active = self.active.lock().await;
        let slot = match active.as_mut() {
            Some(slot) if Arc::ptr_eq(&slot.session, &session) && !session.is_cancelled() => slot,
            _ => {
                debug!("Session {} stopped before forwarding", session.id());
                return Err(TunnelError::Cancelled);
            }
        };

        let (reader, writer) = stream.into_split();
        let forwarder = Forwarder::new(
            session.clone(),
            self.interface.clone(),
            obfuscator,
            self.profile.recv_chunk_size,
        );
        slot.tasks = Some(forwarder.spawn(reader, writer));
        slot.core_task = self.core.as_ref().map(|core| Self::spawn_core(core.clone(), session.clone()));

        Ok(())
    }

    /// Start the core engine without holding up forwarding
    ///
    /// The engine is stopped again as soon as the session ends, whether by
    /// `stop()` or by a forwarding failure.
    fn spawn_core(core: Arc<CoreBridge>, session: Arc<TunnelSession>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut cancel = session.cancelled();
            let started = tokio::task::spawn_blocking({
                let core = core.clone();
                move || core.start()
            })
            .await;

            match started {
                Ok(Ok(())) => debug!("Core engine running for session {}", session.id()),
                Ok(Err(e)) => {
                    session.report(TunnelError::Core(e));
                    return;
                }
                Err(e) => {
                    warn!("Core engine start task failed: {}", e);
                    return;
                }
            }

            wait_cancelled(&mut cancel).await;
            debug!("Session {} ended, stopping core engine", session.id());
            if let Err(e) = tokio::task::spawn_blocking(move || core.stop()).await {
                warn!("Core engine stop task failed: {}", e);
            }
        })
    }

    /// Tear down the current session and stop the core engine. Idempotent.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        info!("Stopping tunnel session {}", active.session.id());
        Self::teardown(active, self.core.clone()).await;
    }

    async fn teardown(active: ActiveSession, core: Option<Arc<CoreBridge>>) {
        let session = active.session;
        session.transition(TunnelState::Disconnecting).await;
        session.cancel();

        if let Some(tasks) = active.tasks {
            tasks.join().await;
        }
        if let Some(core_task) = active.core_task {
            let _ = core_task.await;
        }
        if let Some(core) = core {
            if let Err(e) = tokio::task::spawn_blocking(move || core.stop()).await {
                warn!("Core engine stop task failed: {}", e);
            }
        }

        session.transition(TunnelState::Idle).await;
        info!("Session {} closed ({})", session.id(), session.stats().format());
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        // Make sure detached forwarding tasks wind down.
        if let Some(active) = self.active.get_mut().as_ref() {
            active.session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::open_auth_payload;
    use crate::bridge::{CoreEngine, CoreError, TunnelFd};
    use crate::codec::{FrameBuffer, Obfuscator};
    use crate::config::CoreSettings;
    use crate::interface::{ChannelInterface, ChannelInterfaceHandle};
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const AES_KEY: &str = "0123456789abcdef0123456789abcdef";
    const XOR_KEY: &str = "relay-xor-key";

    struct Relay {
        stream: TcpStream,
        obfs: Obfuscator,
        buffer: FrameBuffer,
    }

    impl Relay {
        /// Accept one client, check its auth frame and assign `response`
        async fn accept(listener: &TcpListener, response: &'static [u8]) -> Self {
            let (mut stream, _) = listener.accept().await.unwrap();
            let obfs = Obfuscator::new(XOR_KEY.as_bytes().to_vec(), 128).unwrap();

            let mut header = [0u8; 2];
            stream.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(header) as usize];
            stream.read_exact(&mut body).await.unwrap();
            let auth = open_auth_payload(&body, AES_KEY.as_bytes(), &obfs).unwrap();
            assert_eq!(auth.action, "new_connect");

            stream.write_all(&obfs.encode(response).unwrap()).await.unwrap();
            Self { stream, obfs, buffer: FrameBuffer::new() }
        }

        async fn send(&mut self, packet: &[u8]) {
            let frame = self.obfs.encode(packet).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Vec<u8> {
            loop {
                if let Some(body) = self.buffer.next_frame() {
                    return self.obfs.decode(&body).unwrap().to_vec();
                }
                let mut chunk = [0u8; 2048];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed");
                self.buffer.extend(&chunk[..n]);
            }
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: StdMutex<Vec<&'static str>>,
    }

    impl CoreEngine for RecordingEngine {
        fn start(&self, _config_path: &Path, _tun_fd: TunnelFd) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }

        fn stop(&self) {
            self.calls.lock().unwrap().push("stop");
        }

        fn activate(&self) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push("activate");
            Ok(())
        }
    }

    fn spawn_relay(listener: TcpListener, response: &'static [u8]) -> JoinHandle<Relay> {
        tokio::spawn(async move { Relay::accept(&listener, response).await })
    }

    async fn relay_listener() -> (TcpListener, TunnelProfile) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let profile = TunnelProfile::new("test", "127.0.0.1", port, XOR_KEY, AES_KEY);
        (listener, profile)
    }

    fn controller(profile: TunnelProfile) -> (TunnelController, ChannelInterfaceHandle) {
        let (iface, handle) = ChannelInterface::new(16);
        let controller = TunnelController::new(profile, Identity::default(), Arc::new(iface));
        (controller, handle)
    }

    #[tokio::test]
    async fn test_full_session() {
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"10.10.5.7,10.10.5.8");
        let (controller, mut handle) = controller(profile);

        controller.start().await.unwrap();
        let mut relay = relay.await.unwrap();

        assert_eq!(controller.state().await, TunnelState::Forwarding);
        assert_eq!(controller.assigned_address().await, Some(Ipv4Addr::new(10, 10, 5, 7)));
        let applied = handle.settings.recv().await.unwrap();
        assert_eq!(Some(applied), controller.network_config().await);

        // relay → interface
        relay.send(b"\x45inbound").await;
        assert_eq!(&handle.inbound.recv().await.unwrap()[..], b"\x45inbound");

        // interface → relay
        handle.outbound.send(vec![Bytes::from_static(b"\x45outbound")]).await.unwrap();
        assert_eq!(relay.recv().await, b"\x45outbound");

        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.state().await, TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_already_running() {
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"10.0.0.2");
        let (controller, _handle) = controller(profile);

        controller.start().await.unwrap();
        let _relay = relay.await.unwrap();

        assert!(matches!(controller.start().await, Err(TunnelError::AlreadyRunning)));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failure_reported_once() {
        let (listener, profile) = relay_listener().await;
        drop(listener);

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let (controller, _handle) = controller(profile);
        let controller = controller.on_error(Arc::new(move |e| sink.lock().unwrap().push(e)));

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectFailure { .. }));
        assert_eq!(controller.state().await, TunnelState::Failed);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_assignment_fails() {
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"garbage");
        let (controller, _handle) = controller(profile);

        let err = controller.start().await.unwrap_err();
        let _relay = relay.await.unwrap();
        assert!(matches!(err, TunnelError::InvalidAssignment(_)));
        assert_eq!(controller.state().await, TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_restart_after_failure_builds_new_session() {
        let (listener, profile) = relay_listener().await;
        let (hangup_tx, hangup_rx) = tokio::sync::oneshot::channel::<()>();
        let relay = tokio::spawn(async move {
            let first = Relay::accept(&listener, b"10.0.0.2").await;
            let _ = hangup_rx.await;
            drop(first);
            Relay::accept(&listener, b"10.0.0.3").await
        });
        let (controller, _handle) = controller(profile);

        controller.start().await.unwrap();
        let first_id = controller.session().await.unwrap().id();
        hangup_tx.send(()).unwrap();

        // the relay hung up; the receive loop fails the session
        for _ in 0..200 {
            if controller.state().await == TunnelState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.state().await, TunnelState::Failed);

        controller.start().await.unwrap();
        let _relay = relay.await.unwrap();

        let session = controller.session().await.unwrap();
        assert_ne!(session.id(), first_id);
        assert_eq!(session.assigned_address(), Some(Ipv4Addr::new(10, 0, 0, 3)));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_core_engine_started_and_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"10.0.0.2");

        let engine = Arc::new(RecordingEngine::default());
        let settings = CoreSettings {
            config_dir: dir.path().to_path_buf(),
            ..CoreSettings::default()
        };
        let (controller, _handle) = controller(profile);
        let controller = controller.with_core(CoreBridge::new(engine.clone(), settings).with_tunnel_fd(9));

        controller.start().await.unwrap();
        let _relay = relay.await.unwrap();
        controller.stop().await;

        assert_eq!(*engine.calls.lock().unwrap(), vec!["start", "activate", "stop"]);
    }

    #[tokio::test]
    async fn test_core_engine_stopped_when_relay_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"10.0.0.2");

        let engine = Arc::new(RecordingEngine::default());
        let settings = CoreSettings {
            config_dir: dir.path().to_path_buf(),
            ..CoreSettings::default()
        };
        let (controller, _handle) = controller(profile);
        let controller = controller.with_core(CoreBridge::new(engine.clone(), settings).with_tunnel_fd(9));

        controller.start().await.unwrap();
        drop(relay.await.unwrap());

        // no stop(): the failed session alone must shut the engine down
        for _ in 0..200 {
            if engine.calls.lock().unwrap().contains(&"stop") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(controller.state().await, TunnelState::Failed);
        assert_eq!(*engine.calls.lock().unwrap(), vec!["start", "activate", "stop"]);

        controller.stop().await;
        assert_eq!(engine.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_handshake_error_returned_and_reported_once() {
        let (listener, profile) = relay_listener().await;
        let relay = spawn_relay(listener, b"not-an-address");

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let (controller, _handle) = controller(profile);
        let controller = controller.on_error(Arc::new(move |e| sink.lock().unwrap().push(e)));

        let err = controller.start().await.unwrap_err();
        let _relay = relay.await.unwrap();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), err.to_string());
        assert!(matches!(err, TunnelError::InvalidAssignment(_)));
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let (_listener, profile) = relay_listener().await;
        let (controller, _handle) = controller(profile);
        controller.stop().await;
        assert_eq!(controller.state().await, TunnelState::Idle);
        assert!(controller.stats().await.is_none());
    }
}
