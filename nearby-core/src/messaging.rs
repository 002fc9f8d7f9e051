//! Messaging gateway: fan payloads out to session peers and hand inbound payloads over.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{SessionError, TransportError};
use crate::identity::PeerId;
use crate::session::SessionTracker;
use crate::transport::{EventSink, SendMode, SessionHandle, Transport};

/// What happened to one peer's copy of a payload.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Accepted by the transport for reliable delivery. Not an end-to-end acknowledgement.
    Sent,
    Failed(TransportError),
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent)
    }
}

/// Per-peer result of a send. Ignoring it gives the fire-and-forget behaviour.
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    outcomes: HashMap<PeerId, DeliveryOutcome>,
}

impl SendReport {
    fn all(peers: &[PeerId], outcome: DeliveryOutcome) -> Self {
        Self {
            outcomes: peers.iter().map(|p| (p.clone(), outcome.clone())).collect(),
        }
    }

    fn from_error(peers: &[PeerId], error: &TransportError) -> Self {
        let mut report = Self::all(peers, DeliveryOutcome::Sent);
        for peer in error.affected(peers) {
            report
                .outcomes
                .insert(peer.clone(), DeliveryOutcome::Failed(error.clone()));
        }
        report
    }

    /// True when nothing was targeted.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome(&self, peer: &PeerId) -> Option<&DeliveryOutcome> {
        self.outcomes.get(peer)
    }

    pub fn is_all_sent(&self) -> bool {
        self.outcomes.values().all(DeliveryOutcome::is_sent)
    }

    pub fn sent(&self) -> impl Iterator<Item = &PeerId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_sent())
            .map(|(p, _)| p)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PeerId, &TransportError)> {
        self.outcomes.iter().filter_map(|(p, o)| match o {
            DeliveryOutcome::Failed(e) => Some((p, e)),
            DeliveryOutcome::Sent => None,
        })
    }
}

pub struct MessagingGateway {
    transport: Arc<dyn Transport>,
    tracker: Arc<SessionTracker>,
}

impl MessagingGateway {
    pub fn new(transport: Arc<dyn Transport>, tracker: Arc<SessionTracker>) -> Self {
        Self { transport, tracker }
    }

    /// Send to every peer connected at the moment of the call.
    pub fn send_to_all(
        &self,
        session: Option<SessionHandle>,
        payload: &[u8],
        errors: &EventSink,
    ) -> SendReport {
        let peers = self.tracker.connected_peers();
        self.send_to_subset(session, payload, &peers, errors)
    }

    pub fn send_to_one(
        &self,
        session: Option<SessionHandle>,
        payload: &[u8],
        peer: &PeerId,
        errors: &EventSink,
    ) -> SendReport {
        self.send_to_subset(session, payload, std::slice::from_ref(peer), errors)
    }

    /// One reliable send to `peers`. Failures are logged, reported on `errors` and
    /// recorded in the returned report; they never come back as `Err`.
    pub fn send_to_subset(
        &self,
        session: Option<SessionHandle>,
        payload: &[u8],
        peers: &[PeerId],
        errors: &EventSink,
    ) -> SendReport {
        if peers.is_empty() {
            return SendReport::default();
        }
        let Some(session) = session else {
            let error = TransportError::SessionClosed;
            warn!(peers = peers.len(), "send before session exists");
            errors.report(SessionError::Send {
                peers: peers.to_vec(),
                source: error.clone(),
            });
            return SendReport::all(peers, DeliveryOutcome::Failed(error));
        };
        match self
            .transport
            .send(session, payload, peers, SendMode::Reliable)
        {
            Ok(()) => {
                debug!(bytes = payload.len(), peers = peers.len(), "payload sent");
                SendReport::all(peers, DeliveryOutcome::Sent)
            }
            Err(error) => {
                warn!(%error, bytes = payload.len(), "send failed");
                let report = SendReport::from_error(peers, &error);
                errors.report(SessionError::Send {
                    peers: error.affected(peers).into_iter().cloned().collect(),
                    source: error,
                });
                report
            }
        }
    }

    /// Inbound payloads pass through untouched.
    pub fn on_data_received<'a>(&self, payload: &'a [u8], from: &PeerId) -> &'a [u8] {
        debug!(%from, bytes = payload.len(), "payload received");
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::{Call, RecordingTransport};
    use crate::session::ConnectionState;
    use crate::transport::EventStream;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        tracker: Arc<SessionTracker>,
        gateway: MessagingGateway,
        sink: EventSink,
        stream: EventStream,
    }

    fn fixture(transport: RecordingTransport) -> Fixture {
        let transport = Arc::new(transport);
        let tracker = Arc::new(SessionTracker::new(PeerId::new("me").unwrap()));
        let gateway = MessagingGateway::new(transport.clone(), tracker.clone());
        let (sink, stream) = EventSink::channel();
        Fixture {
            transport,
            tracker,
            gateway,
            sink,
            stream,
        }
    }

    const SESSION: Option<SessionHandle> = Some(SessionHandle::from_raw(3));

    #[test]
    fn empty_subset_makes_no_calls() {
        let f = fixture(RecordingTransport::default());
        let report = f.gateway.send_to_subset(SESSION, b"hi", &[], &f.sink);
        assert!(report.is_empty());
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn send_to_all_with_nobody_connected_is_a_no_op() {
        let f = fixture(RecordingTransport::default());
        f.tracker
            .apply(&PeerId::new("half").unwrap(), ConnectionState::Connecting);
        let report = f.gateway.send_to_all(SESSION, b"hi", &f.sink);
        assert!(report.is_empty());
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn send_to_all_targets_connected_snapshot() {
        let f = fixture(RecordingTransport::default());
        let a = PeerId::new("a").unwrap();
        let b = PeerId::new("b").unwrap();
        f.tracker.apply(&a, ConnectionState::Connected);
        f.tracker.apply(&b, ConnectionState::Connecting);

        let report = f.gateway.send_to_all(SESSION, b"hello", &f.sink);
        assert!(report.is_all_sent());
        assert_eq!(report.len(), 1);
        assert_eq!(report.sent().collect::<Vec<_>>(), vec![&a]);
        assert_eq!(
            f.transport.calls(),
            vec![Call::Send {
                payload: b"hello".to_vec(),
                peers: vec![a.clone()],
                mode: SendMode::Reliable,
            }]
        );

        // Joining later does not retroactively receive the earlier payload.
        f.tracker.apply(&b, ConnectionState::Connected);
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[test]
    fn send_to_one_wraps_single_peer() {
        let f = fixture(RecordingTransport::default());
        let a = PeerId::new("a").unwrap();
        let report = f.gateway.send_to_one(SESSION, b"x", &a, &f.sink);
        assert!(report.outcome(&a).unwrap().is_sent());
        assert!(matches!(
            f.transport.calls().as_slice(),
            [Call::Send { peers, .. }] if peers == &vec![a.clone()]
        ));
    }

    #[test]
    fn failure_is_swallowed_and_reported() {
        let a = PeerId::new("a").unwrap();
        let b = PeerId::new("b").unwrap();
        let mut f = fixture(RecordingTransport {
            fail_send: Some(TransportError::Unreachable {
                peers: vec![b.clone()],
            }),
            ..Default::default()
        });
        let report = f
            .gateway
            .send_to_subset(SESSION, b"x", &[a.clone(), b.clone()], &f.sink);
        assert!(!report.is_all_sent());
        assert!(report.outcome(&a).unwrap().is_sent());
        let failed: Vec<_> = report.failures().map(|(p, _)| p.clone()).collect();
        assert_eq!(failed, vec![b.clone()]);
        // Only one attempt, no retry.
        assert_eq!(f.transport.calls().len(), 1);
        // The failure also goes out on the error channel, which is not a transport event.
        assert!(f.stream.try_recv().is_none());
    }

    #[test]
    fn send_without_session_fails_every_peer() {
        let f = fixture(RecordingTransport::default());
        let a = PeerId::new("a").unwrap();
        let report = f.gateway.send_to_subset(None, b"x", &[a.clone()], &f.sink);
        assert!(matches!(
            report.outcome(&a),
            Some(DeliveryOutcome::Failed(TransportError::SessionClosed))
        ));
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn inbound_payload_is_verbatim() {
        use rand::RngCore;
        let f = fixture(RecordingTransport::default());
        let mut payload = vec![0u8; 256];
        rand::thread_rng().fill_bytes(&mut payload);
        let from = PeerId::new("a").unwrap();
        assert_eq!(f.gateway.on_data_received(&payload, &from), payload.as_slice());
    }
}
