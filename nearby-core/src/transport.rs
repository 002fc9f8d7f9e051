//! Transport capability consumed by the manager: discovery roles, invitations, a shared
//! session and reliable sends. Implementations live outside the session logic (the
//! in-process [`crate::loopback`] network, the LAN transport in `nearby-linux`).
//!
//! Calls never block on the network. Results that arrive later are reported as
//! [`TransportEvent`]s through the [`EventSink`] handed over when a role or session is
//! created, from whatever thread the transport happens to run on.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{DiscoveryRole, SessionError, TransportError};
use crate::identity::{PeerId, ServiceType};
use crate::session::ConnectionState;

/// Free-form key/value pairs a peer publishes alongside its advertisement.
pub type DiscoveryInfo = HashMap<String, String>;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Active advertise role.
    AdvertiseHandle
);
handle_type!(
    /// Active browse role.
    BrowseHandle
);
handle_type!(
    /// The shared multi-peer session.
    SessionHandle
);

/// How a payload is delivered. Only reliable delivery is used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Retried by the transport until acknowledged or the link is deemed failed.
    Reliable,
    Unreliable,
}

/// Certificate policy for a session. The core always runs with `AcceptAll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    #[default]
    AcceptAll,
}

impl SecurityPolicy {
    pub fn accepts(self, _peer: &PeerId, _chain: &[Vec<u8>]) -> bool {
        match self {
            SecurityPolicy::AcceptAll => true,
        }
    }
}

/// Answer to an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDecision {
    Accept(SessionHandle),
    Reject,
}

/// One-shot answer callback for an invitation. Consumed on use, so a decision can be made
/// at most once. Dropping it without deciding counts as a reject.
pub struct InvitationReply(Option<Box<dyn FnOnce(InvitationDecision) + Send>>);

impl InvitationReply {
    pub fn new(f: impl FnOnce(InvitationDecision) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn decide(mut self, decision: InvitationDecision) {
        if let Some(f) = self.0.take() {
            f(decision);
        }
    }
}

impl Drop for InvitationReply {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f(InvitationDecision::Reject);
        }
    }
}

impl fmt::Debug for InvitationReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvitationReply")
    }
}

/// One-shot answer callback for a peer certificate. Dropping it counts as a reject.
pub struct CertificateReply(Option<Box<dyn FnOnce(bool) + Send>>);

impl CertificateReply {
    pub fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn decide(mut self, accept: bool) {
        if let Some(f) = self.0.take() {
            f(accept);
        }
    }
}

impl Drop for CertificateReply {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f(false);
        }
    }
}

impl fmt::Debug for CertificateReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateReply")
    }
}

/// Everything a transport can report.
#[derive(Debug)]
pub enum TransportEvent {
    /// Browse role saw an advertisement (possibly our own).
    PeerFound { peer: PeerId, info: DiscoveryInfo },
    /// Browse role stopped seeing an advertisement. Says nothing about session state.
    PeerLost { peer: PeerId },
    /// Advertise role received an invitation to join someone's session.
    InvitationReceived {
        from: PeerId,
        context: Option<Vec<u8>>,
        reply: InvitationReply,
    },
    /// A discovery role failed after it was started.
    DiscoveryFailed {
        role: DiscoveryRole,
        error: TransportError,
    },
    /// An outgoing invitation got no answer within its timeout.
    InvitationTimedOut { peer: PeerId },
    StateChanged { peer: PeerId, state: ConnectionState },
    DataReceived { peer: PeerId, payload: Vec<u8> },
    CertificateReceived {
        peer: PeerId,
        chain: Vec<Vec<u8>>,
        reply: CertificateReply,
    },
}

/// What travels on the manager's dispatch channel.
#[derive(Debug)]
pub(crate) enum Envelope {
    Event(TransportEvent),
    Error(SessionError),
    Close,
}

/// Cloneable, thread-safe handle a transport uses to report events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    /// Standalone sink/stream pair, for driving a transport without a manager.
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, EventStream { rx })
    }

    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    /// Report an event. Returns false once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(Envelope::Event(event)).is_ok()
    }

    pub(crate) fn report(&self, error: SessionError) -> bool {
        self.tx.send(Envelope::Error(error)).is_ok()
    }

    pub(crate) fn close(&self) -> bool {
        self.tx.send(Envelope::Close).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of [`EventSink::channel`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.rx.recv().await? {
                Envelope::Event(event) => return Some(event),
                Envelope::Close => return None,
                Envelope::Error(_) => continue,
            }
        }
    }

    /// Next already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.rx.try_recv().ok()? {
                Envelope::Event(event) => return Some(event),
                Envelope::Close => return None,
                Envelope::Error(_) => continue,
            }
        }
    }
}

/// Discovery and session primitive driven by the manager.
pub trait Transport: Send + Sync {
    /// Start announcing `local` under `service`. Invitations arrive on `events`.
    fn advertise(
        &self,
        local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<AdvertiseHandle, TransportError>;

    fn stop_advertise(&self, handle: AdvertiseHandle);

    /// Start scanning for peers advertising `service`.
    fn browse(
        &self,
        local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<BrowseHandle, TransportError>;

    fn stop_browse(&self, handle: BrowseHandle);

    /// Create the session that all accepted peers join. Session events arrive on `events`.
    fn create_session(
        &self,
        local: &PeerId,
        policy: SecurityPolicy,
        events: EventSink,
    ) -> SessionHandle;

    /// Invite `peer` into `session`. Must tolerate repeated invites to the same peer.
    fn invite(
        &self,
        session: SessionHandle,
        peer: &PeerId,
        context: Option<&[u8]>,
        timeout: Duration,
    );

    fn send(
        &self,
        session: SessionHandle,
        payload: &[u8],
        peers: &[PeerId],
        mode: SendMode,
    ) -> Result<(), TransportError>;

    /// Drop every link in `session`; linked peers move to `NotConnected`.
    fn disconnect(&self, session: SessionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn dropped_invitation_rejects() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        let reply = InvitationReply::new(move |d| *seen_cb.lock().unwrap() = Some(d));
        drop(reply);
        assert_eq!(*seen.lock().unwrap(), Some(InvitationDecision::Reject));
    }

    #[test]
    fn invitation_decides_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let reply = InvitationReply::new(move |d| {
            assert_eq!(d, InvitationDecision::Accept(SessionHandle::from_raw(7)));
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });
        reply.decide(InvitationDecision::Accept(SessionHandle::from_raw(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_certificate_rejects() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        drop(CertificateReply::new(move |ok| *seen_cb.lock().unwrap() = Some(ok)));
        assert_eq!(*seen.lock().unwrap(), Some(false));
    }

    #[test]
    fn stream_skips_internal_envelopes() {
        let (sink, mut stream) = EventSink::channel();
        let peer = PeerId::new("p").unwrap();
        sink.report(SessionError::InvitationTimeout { peer: peer.clone() });
        sink.emit(TransportEvent::PeerLost { peer: peer.clone() });
        match stream.try_recv() {
            Some(TransportEvent::PeerLost { peer: p }) => assert_eq!(p, peer),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn sink_notices_dropped_stream() {
        let (sink, stream) = EventSink::channel();
        assert!(!sink.is_closed());
        drop(stream);
        assert!(sink.is_closed());
        let peer = PeerId::new("p").unwrap();
        assert!(!sink.emit(TransportEvent::PeerLost { peer }));
    }
}
