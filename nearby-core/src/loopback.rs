//! In-process transport: every [`LoopbackTransport`] created from one [`LoopbackNetwork`]
//! can see and connect to the others. Used by tests and by hosts that run several
//! managers in one process.
//!
//! Browsing reports every advertiser with the same service tag, including the browsing
//! node itself. Invitation timeouts are not simulated: answers are immediate, and an
//! invite to a peer that is not advertising times out straight away.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;
use crate::identity::{PeerId, ServiceType};
use crate::session::ConnectionState;
use crate::transport::{
    AdvertiseHandle, BrowseHandle, CertificateReply, DiscoveryInfo, EventSink,
    InvitationDecision, InvitationReply, SecurityPolicy, SendMode, SessionHandle, Transport,
    TransportEvent,
};

struct Role {
    peer: PeerId,
    service: ServiceType,
    events: EventSink,
}

struct Member {
    peer: PeerId,
    events: EventSink,
    links: HashSet<PeerId>,
}

#[derive(Default)]
struct Network {
    next_id: u64,
    advertisers: HashMap<u64, Role>,
    browsers: HashMap<u64, Role>,
    sessions: HashMap<u64, Member>,
}

impl Network {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn session_of(&self, peer: &PeerId) -> Option<(u64, &Member)> {
        self.sessions
            .iter()
            .find(|(_, m)| m.peer == *peer)
            .map(|(id, m)| (*id, m))
    }
}

/// Events are queued while the network lock is held and emitted after it is released, so
/// that a reply callback dropped inside a closed channel can lock the network again.
type Outbox = Vec<(EventSink, TransportEvent)>;

fn flush(outbox: Outbox) {
    for (sink, event) in outbox {
        sink.emit(event);
    }
}

fn state(peer: &PeerId, state: ConnectionState) -> TransportEvent {
    TransportEvent::StateChanged {
        peer: peer.clone(),
        state,
    }
}

/// Shared medium for loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    network: Arc<Mutex<Network>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of established links, counting each pair once.
    pub fn link_count(&self) -> usize {
        let network = self.lock();
        network.sessions.values().map(|m| m.links.len()).sum::<usize>() / 2
    }

    fn answer_invitation(&self, inviter: u64, target: PeerId, decision: InvitationDecision) {
        let mut outbox = Outbox::new();
        {
            let network = self.lock();
            let Some(from) = network.sessions.get(&inviter) else {
                return;
            };
            match decision {
                InvitationDecision::Accept(session) => match network.sessions.get(&session.raw()) {
                    Some(joining) if joining.peer == target && joining.links.contains(&from.peer) => {
                        outbox.push((from.events.clone(), state(&target, ConnectionState::Connected)));
                    }
                    Some(joining) if joining.peer == target => {
                        outbox.push((joining.events.clone(), state(&from.peer, ConnectionState::Connecting)));
                        let handle = self.clone();
                        let accepting = session.raw();
                        outbox.push((
                            joining.events.clone(),
                            TransportEvent::CertificateReceived {
                                peer: from.peer.clone(),
                                chain: Vec::new(),
                                reply: CertificateReply::new(move |ok| {
                                    handle.complete_link(inviter, accepting, ok)
                                }),
                            },
                        ));
                    }
                    _ => {
                        debug!(%target, "invitation accepted into unknown session");
                        outbox.push((from.events.clone(), state(&target, ConnectionState::NotConnected)));
                    }
                },
                InvitationDecision::Reject => {
                    debug!(%target, "invitation rejected");
                    outbox.push((from.events.clone(), state(&target, ConnectionState::NotConnected)));
                }
            }
        }
        flush(outbox);
    }

    fn complete_link(&self, inviter: u64, accepting: u64, certificate_ok: bool) {
        let mut outbox = Outbox::new();
        {
            let mut network = self.lock();
            let (Some(a), Some(b)) = (network.sessions.get(&inviter), network.sessions.get(&accepting))
            else {
                return;
            };
            let (a_peer, b_peer) = (a.peer.clone(), b.peer.clone());
            let (a_events, b_events) = (a.events.clone(), b.events.clone());
            if a.links.contains(&b_peer) {
                // A crossed invite finished first. Both sides saw `Connecting` for this
                // attempt, so confirm the existing link again.
                outbox.push((a_events, state(&b_peer, ConnectionState::Connected)));
                outbox.push((b_events, state(&a_peer, ConnectionState::Connected)));
            } else if !certificate_ok {
                outbox.push((a_events, state(&b_peer, ConnectionState::NotConnected)));
                outbox.push((b_events, state(&a_peer, ConnectionState::NotConnected)));
            } else {
                if let Some(a) = network.sessions.get_mut(&inviter) {
                    a.links.insert(b_peer.clone());
                }
                if let Some(b) = network.sessions.get_mut(&accepting) {
                    b.links.insert(a_peer.clone());
                }
                debug!(a = %a_peer, b = %b_peer, "loopback link up");
                outbox.push((a_events, state(&b_peer, ConnectionState::Connected)));
                outbox.push((b_events, state(&a_peer, ConnectionState::Connected)));
            }
        }
        flush(outbox);
    }
}

/// One node's view of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn advertise(
        &self,
        local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<AdvertiseHandle, TransportError> {
        let mut outbox = Outbox::new();
        let id = {
            let mut network = self.network.lock();
            let id = network.next_id();
            for browser in network.browsers.values().filter(|b| b.service == *service) {
                outbox.push((
                    browser.events.clone(),
                    TransportEvent::PeerFound {
                        peer: local.clone(),
                        info: DiscoveryInfo::new(),
                    },
                ));
            }
            network.advertisers.insert(
                id,
                Role {
                    peer: local.clone(),
                    service: service.clone(),
                    events,
                },
            );
            id
        };
        flush(outbox);
        Ok(AdvertiseHandle::from_raw(id))
    }

    fn stop_advertise(&self, handle: AdvertiseHandle) {
        let mut outbox = Outbox::new();
        {
            let mut network = self.network.lock();
            let Some(role) = network.advertisers.remove(&handle.raw()) else {
                return;
            };
            for browser in network.browsers.values().filter(|b| b.service == role.service) {
                outbox.push((
                    browser.events.clone(),
                    TransportEvent::PeerLost {
                        peer: role.peer.clone(),
                    },
                ));
            }
        }
        flush(outbox);
    }

    fn browse(
        &self,
        local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<BrowseHandle, TransportError> {
        let mut outbox = Outbox::new();
        let id = {
            let mut network = self.network.lock();
            let id = network.next_id();
            for advertiser in network.advertisers.values().filter(|a| a.service == *service) {
                outbox.push((
                    events.clone(),
                    TransportEvent::PeerFound {
                        peer: advertiser.peer.clone(),
                        info: DiscoveryInfo::new(),
                    },
                ));
            }
            network.browsers.insert(
                id,
                Role {
                    peer: local.clone(),
                    service: service.clone(),
                    events,
                },
            );
            id
        };
        flush(outbox);
        Ok(BrowseHandle::from_raw(id))
    }

    fn stop_browse(&self, handle: BrowseHandle) {
        self.network.lock().browsers.remove(&handle.raw());
    }

    fn create_session(
        &self,
        local: &PeerId,
        _policy: SecurityPolicy,
        events: EventSink,
    ) -> SessionHandle {
        let mut network = self.network.lock();
        let id = network.next_id();
        network.sessions.insert(
            id,
            Member {
                peer: local.clone(),
                events,
                links: HashSet::new(),
            },
        );
        SessionHandle::from_raw(id)
    }

    fn invite(
        &self,
        session: SessionHandle,
        peer: &PeerId,
        context: Option<&[u8]>,
        _timeout: Duration,
    ) {
        let mut outbox = Outbox::new();
        {
            let network = self.network.lock();
            let Some(member) = network.sessions.get(&session.raw()) else {
                return;
            };
            if member.links.contains(peer) {
                debug!(%peer, "already linked, invite ignored");
                return;
            }
            match network.advertisers.values().find(|a| a.peer == *peer) {
                Some(advertiser) => {
                    let handle = self.network.clone();
                    let inviter = session.raw();
                    let target = peer.clone();
                    outbox.push((member.events.clone(), state(peer, ConnectionState::Connecting)));
                    outbox.push((
                        advertiser.events.clone(),
                        TransportEvent::InvitationReceived {
                            from: member.peer.clone(),
                            context: context.map(<[u8]>::to_vec),
                            reply: InvitationReply::new(move |decision| {
                                handle.answer_invitation(inviter, target, decision)
                            }),
                        },
                    ));
                }
                None => {
                    outbox.push((member.events.clone(), state(peer, ConnectionState::NotConnected)));
                    outbox.push((
                        member.events.clone(),
                        TransportEvent::InvitationTimedOut { peer: peer.clone() },
                    ));
                }
            }
        }
        flush(outbox);
    }

    fn send(
        &self,
        session: SessionHandle,
        payload: &[u8],
        peers: &[PeerId],
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        let mut outbox = Outbox::new();
        let mut unreachable = Vec::new();
        {
            let network = self.network.lock();
            let sender = network
                .sessions
                .get(&session.raw())
                .ok_or(TransportError::SessionClosed)?;
            for peer in peers {
                match network.session_of(peer) {
                    Some((_, target)) if sender.links.contains(peer) => outbox.push((
                        target.events.clone(),
                        TransportEvent::DataReceived {
                            peer: sender.peer.clone(),
                            payload: payload.to_vec(),
                        },
                    )),
                    _ => unreachable.push(peer.clone()),
                }
            }
        }
        flush(outbox);
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Unreachable { peers: unreachable })
        }
    }

    fn disconnect(&self, session: SessionHandle) {
        let mut outbox = Outbox::new();
        {
            let mut network = self.network.lock();
            let Some(member) = network.sessions.remove(&session.raw()) else {
                return;
            };
            for peer in &member.links {
                outbox.push((member.events.clone(), state(peer, ConnectionState::NotConnected)));
                if let Some(other) = network.sessions.values_mut().find(|m| m.peer == *peer) {
                    other.links.remove(&member.peer);
                    outbox.push((
                        other.events.clone(),
                        state(&member.peer, ConnectionState::NotConnected),
                    ));
                }
            }
        }
        flush(outbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventStream;

    struct Node {
        id: PeerId,
        transport: LoopbackTransport,
        events: EventSink,
        stream: EventStream,
    }

    fn node(network: &LoopbackNetwork, name: &str) -> Node {
        let (events, stream) = EventSink::channel();
        Node {
            id: PeerId::new(name).unwrap(),
            transport: network.transport(),
            events,
            stream,
        }
    }

    fn drain(stream: &mut EventStream) -> Vec<TransportEvent> {
        std::iter::from_fn(|| stream.try_recv()).collect()
    }

    #[test]
    fn browsing_sees_everyone_including_self() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let b = node(&network, "b");
        let service = ServiceType::default();

        a.transport
            .advertise(&a.id, &service, a.events.clone())
            .unwrap();
        b.transport
            .advertise(&b.id, &service, b.events.clone())
            .unwrap();
        a.transport.browse(&a.id, &service, a.events.clone()).unwrap();

        let found: HashSet<PeerId> = drain(&mut a.stream)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::PeerFound { peer, .. } => Some(peer),
                _ => None,
            })
            .collect();
        assert_eq!(found, HashSet::from([a.id.clone(), b.id.clone()]));
    }

    #[test]
    fn other_service_is_invisible() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let b = node(&network, "b");
        a.transport
            .browse(&a.id, &ServiceType::default(), a.events.clone())
            .unwrap();
        b.transport
            .advertise(&b.id, &ServiceType::new("other").unwrap(), b.events.clone())
            .unwrap();
        assert!(drain(&mut a.stream).is_empty());
    }

    #[test]
    fn rejected_invite_returns_to_not_connected() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");
        let service = ServiceType::default();
        let session = a
            .transport
            .create_session(&a.id, SecurityPolicy::AcceptAll, a.events.clone());
        b.transport
            .advertise(&b.id, &service, b.events.clone())
            .unwrap();

        a.transport
            .invite(session, &b.id, None, Duration::from_secs(10));
        match drain(&mut b.stream).pop() {
            Some(TransportEvent::InvitationReceived { from, reply, .. }) => {
                assert_eq!(from, a.id);
                reply.decide(InvitationDecision::Reject);
            }
            other => panic!("expected invitation, got {other:?}"),
        }
        let states: Vec<ConnectionState> = drain(&mut a.stream)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::NotConnected]
        );
        assert_eq!(network.link_count(), 0);
    }

    #[test]
    fn invite_to_absent_peer_times_out() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let session = a
            .transport
            .create_session(&a.id, SecurityPolicy::AcceptAll, a.events.clone());
        let ghost = PeerId::new("ghost").unwrap();
        a.transport.invite(session, &ghost, None, Duration::from_secs(10));
        assert!(drain(&mut a.stream)
            .iter()
            .any(|e| matches!(e, TransportEvent::InvitationTimedOut { peer } if *peer == ghost)));
    }

    /// Accept and link a -> b by hand, answering the certificate too.
    fn link(network: &LoopbackNetwork, a: &mut Node, b: &mut Node) -> (SessionHandle, SessionHandle) {
        let service = ServiceType::default();
        let a_session = a
            .transport
            .create_session(&a.id, SecurityPolicy::AcceptAll, a.events.clone());
        let b_session = b
            .transport
            .create_session(&b.id, SecurityPolicy::AcceptAll, b.events.clone());
        b.transport
            .advertise(&b.id, &service, b.events.clone())
            .unwrap();
        a.transport
            .invite(a_session, &b.id, Some(b"hi"), Duration::from_secs(10));
        for event in drain(&mut b.stream) {
            if let TransportEvent::InvitationReceived { context, reply, .. } = event {
                assert_eq!(context.as_deref(), Some(&b"hi"[..]));
                reply.decide(InvitationDecision::Accept(b_session));
            }
        }
        for event in drain(&mut b.stream) {
            if let TransportEvent::CertificateReceived { reply, .. } = event {
                reply.decide(true);
            }
        }
        assert_eq!(network.link_count(), 1);
        (a_session, b_session)
    }

    #[test]
    fn reinvite_of_linked_peer_is_ignored() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");
        let (a_session, _) = link(&network, &mut a, &mut b);
        drain(&mut a.stream);
        drain(&mut b.stream);

        a.transport
            .invite(a_session, &b.id, None, Duration::from_secs(10));
        assert!(drain(&mut a.stream).is_empty());
        assert!(drain(&mut b.stream).is_empty());
        assert_eq!(network.link_count(), 1);
    }

    #[test]
    fn send_reaches_linked_and_flags_the_rest() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");
        let (a_session, _) = link(&network, &mut a, &mut b);
        drain(&mut b.stream);

        let stranger = PeerId::new("stranger").unwrap();
        let err = a
            .transport
            .send(
                a_session,
                b"payload",
                &[b.id.clone(), stranger.clone()],
                SendMode::Reliable,
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { peers } if peers == vec![stranger.clone()]));
        match drain(&mut b.stream).as_slice() {
            [TransportEvent::DataReceived { peer, payload }] => {
                assert_eq!(*peer, a.id);
                assert_eq!(payload, b"payload");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_drops_both_sides() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");
        let (a_session, _) = link(&network, &mut a, &mut b);
        drain(&mut a.stream);
        drain(&mut b.stream);

        a.transport.disconnect(a_session);
        assert_eq!(network.link_count(), 0);
        assert!(drain(&mut b.stream).iter().any(|e| matches!(
            e,
            TransportEvent::StateChanged { peer, state: ConnectionState::NotConnected } if *peer == a.id
        )));
        assert!(matches!(
            a.transport.send(a_session, b"x", &[b.id.clone()], SendMode::Reliable),
            Err(TransportError::SessionClosed)
        ));
    }
}
