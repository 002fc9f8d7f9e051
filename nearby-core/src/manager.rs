//! Session manager: the one object an application talks to.
//!
//! The manager owns the session and wires the discovery coordinator, session tracker and
//! messaging gateway to one transport. Transport events, which may arrive on any thread,
//! are queued on a single channel and handled in order on a dedicated dispatcher thread.
//! The listener is only ever called from that thread, so it never runs concurrently with
//! itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryCoordinator;
use crate::error::SessionError;
use crate::identity::{PeerId, ServiceType};
use crate::messaging::{MessagingGateway, SendReport};
use crate::session::{ConnectionState, SessionTracker};
use crate::transport::{
    Envelope, EventSink, SecurityPolicy, SessionHandle, Transport, TransportEvent,
};

/// Receives session events. Called only from the manager's dispatcher thread.
pub trait SessionListener: Send + Sync {
    fn on_data_received(&self, payload: &[u8], from: &PeerId);

    fn on_state_changed(&self, peer: &PeerId, state: ConnectionState);

    /// Non-fatal failures (discovery, send, invitation timeout). Ignored unless overridden.
    fn on_error(&self, _error: &SessionError) {}
}

/// Shared between the manager handle and its dispatcher thread.
struct Inner {
    local: PeerId,
    transport: Arc<dyn Transport>,
    policy: SecurityPolicy,
    session: OnceLock<SessionHandle>,
    tracker: Arc<SessionTracker>,
    discovery: DiscoveryCoordinator,
    gateway: MessagingGateway,
    /// Single slot; the last registration wins.
    listener: Mutex<Option<Arc<dyn SessionListener>>>,
    events: EventSink,
}

impl Inner {
    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session.get().copied()
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Event(event) => self.handle_event(event),
            Envelope::Error(error) => {
                if let Some(listener) = self.listener() {
                    listener.on_error(&error);
                }
            }
            Envelope::Close => {}
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, info } => {
                self.discovery.on_peer_found(&peer, &info);
            }
            TransportEvent::PeerLost { peer } => self.discovery.on_peer_lost(&peer),
            TransportEvent::InvitationReceived {
                from,
                context,
                reply,
            } => {
                self.discovery
                    .on_invitation_received(&from, context.as_deref(), reply);
            }
            TransportEvent::DiscoveryFailed { role, error } => {
                let error = self.discovery.on_discovery_error(role, error);
                self.dispatch(Envelope::Error(error));
            }
            TransportEvent::InvitationTimedOut { peer } => {
                info!(%peer, "invitation timed out");
                self.dispatch(Envelope::Error(SessionError::InvitationTimeout { peer }));
            }
            TransportEvent::StateChanged { peer, state } => {
                if self.tracker.apply(&peer, state) {
                    if let Some(listener) = self.listener() {
                        listener.on_state_changed(&peer, state);
                    }
                }
            }
            TransportEvent::DataReceived { peer, payload } => {
                let payload = self.gateway.on_data_received(&payload, &peer);
                if let Some(listener) = self.listener() {
                    listener.on_data_received(payload, &peer);
                }
            }
            TransportEvent::CertificateReceived { peer, chain, reply } => {
                let accept = self.policy.accepts(&peer, &chain);
                debug!(%peer, accept, "certificate received");
                reply.decide(accept);
            }
        }
    }
}

/// Manager for one local identity's discovery and session.
///
/// Construct one per process at the composition root and share it (for example in an
/// `Arc`). Dropping it tears the session down.
pub struct SessionManager {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SessionManager {
    /// Create a manager for `local` on `transport`, using the fixed service tag.
    /// Spawns the dispatcher thread; nothing touches the transport until [`start`](Self::start).
    pub fn new(transport: Arc<dyn Transport>, local: PeerId) -> std::io::Result<Self> {
        Self::with_service(transport, local, ServiceType::default())
    }

    pub fn with_service(
        transport: Arc<dyn Transport>,
        local: PeerId,
        service: ServiceType,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(SessionTracker::new(local.clone()));
        let inner = Arc::new(Inner {
            discovery: DiscoveryCoordinator::new(transport.clone(), local.clone(), service),
            gateway: MessagingGateway::new(transport.clone(), tracker.clone()),
            local,
            transport,
            policy: SecurityPolicy::AcceptAll,
            session: OnceLock::new(),
            tracker,
            listener: Mutex::new(None),
            events: EventSink::from_sender(tx),
        });
        let dispatcher = thread::Builder::new()
            .name("nearby-dispatch".into())
            .spawn({
                let inner = inner.clone();
                move || run_dispatcher(inner, rx)
            })?;
        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// This process's identity, fixed for the manager's lifetime.
    pub fn current_identity(&self) -> &PeerId {
        &self.inner.local
    }

    /// Register the listener, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.listener_slot() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener_slot() = None;
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<Arc<dyn SessionListener>>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the session on first use and start discovery. Role failures are logged and
    /// reported to the listener's error channel; the manager counts as started regardless.
    pub fn start(&self) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("start after shutdown ignored");
            return;
        }
        let inner = &self.inner;
        let session = *inner.session.get_or_init(|| {
            let session =
                inner
                    .transport
                    .create_session(&inner.local, inner.policy, inner.events.clone());
            info!(local = %inner.local, "session created");
            session
        });
        for failure in inner.discovery.start(session, &inner.events) {
            inner.events.report(failure);
        }
    }

    /// Stop discovery. Existing links stay up.
    pub fn stop(&self) {
        self.inner.discovery.stop();
    }

    pub fn is_started(&self) -> bool {
        self.inner.discovery.is_started()
    }

    /// Send to every currently connected peer.
    pub fn send(&self, payload: &[u8]) -> SendReport {
        let inner = &self.inner;
        inner
            .gateway
            .send_to_all(inner.session(), payload, &inner.events)
    }

    pub fn send_to(&self, payload: &[u8], peer: &PeerId) -> SendReport {
        let inner = &self.inner;
        inner
            .gateway
            .send_to_one(inner.session(), payload, peer, &inner.events)
    }

    pub fn send_to_peers(&self, payload: &[u8], peers: &[PeerId]) -> SendReport {
        let inner = &self.inner;
        inner
            .gateway
            .send_to_subset(inner.session(), payload, peers, &inner.events)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.tracker.connected_peers()
    }

    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        self.inner.tracker.state_of(peer)
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.tracker.known_peers()
    }

    /// Disconnect the session, stop discovery, then let the dispatcher drain what is already
    /// queued and exit. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        if let Some(session) = inner.session() {
            inner.transport.disconnect(session);
        }
        inner.discovery.stop();
        inner.events.close();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // A listener shutting the manager down from the dispatcher cannot join itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }
        info!("session manager shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatcher(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    debug!("dispatcher running");
    while let Some(envelope) = rx.blocking_recv() {
        if matches!(envelope, Envelope::Close) {
            break;
        }
        inner.dispatch(envelope);
    }
    debug!("dispatcher stopped");
}
