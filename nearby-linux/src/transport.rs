//! LAN transport: multicast beacons for the discovery roles, one TCP connection per linked
//! peer for the session.
//!
//! An invite is a fresh TCP connection to the peer's advertised port carrying `Invite`;
//! the invited side answers `InviteReply` and, if accepted, the connection becomes the
//! link. When both peers invite each other, both sides keep the link initiated by the peer
//! with the smaller instance id.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nearby_core::wire::{decode_body, encode_frame, frame_len, FrameEncodeError, MAX_FRAME_LEN};
use nearby_core::{
    AdvertiseHandle, BrowseHandle, CertificateReply, ConnectionState, DiscoveryRole, EventSink,
    InvitationDecision, InvitationReply, Message, PeerId, SecurityPolicy, SendMode, ServiceType,
    SessionHandle, Transport, TransportError, TransportEvent, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{self, lock, PeerTable};

/// Bincode overhead of `Message::Data` around its payload.
const DATA_OVERHEAD: usize = 16;

#[derive(Debug, Clone)]
pub struct LanOptions {
    pub discovery_port: u16,
    /// 0 picks a free port.
    pub transport_port: u16,
    pub group: Ipv4Addr,
    /// How long an incoming connection may stay silent before its `Invite` arrives.
    pub invite_read_timeout: Duration,
}

struct Link {
    id: u64,
    initiator: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

struct Session {
    handle: SessionHandle,
    local: PeerId,
    events: EventSink,
    links: HashMap<PeerId, Link>,
    /// Outgoing invites not yet answered.
    pending: HashSet<PeerId>,
    /// Accepted incoming invites whose link is not up yet, counted per peer.
    incoming: HashMap<PeerId, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Outgoing,
    Incoming,
}

impl Session {
    fn handshaking(&self, peer: &PeerId) -> bool {
        self.pending.contains(peer) || self.incoming.contains_key(peer)
    }

    fn end_handshake(&mut self, peer: &PeerId, side: Handshake) {
        match side {
            Handshake::Outgoing => {
                self.pending.remove(peer);
            }
            Handshake::Incoming => {
                if let Some(count) = self.incoming.get_mut(peer) {
                    *count -= 1;
                    if *count == 0 {
                        self.incoming.remove(peer);
                    }
                }
            }
        }
    }

    fn emit_state(&self, peer: &PeerId, state: ConnectionState) {
        self.events.emit(state_changed(peer, state));
    }
}

struct Advertiser {
    handle: AdvertiseHandle,
    service: ServiceType,
    events: EventSink,
    task: JoinHandle<()>,
}

struct Browser {
    handle: BrowseHandle,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    /// Tag sent in invites; set by whichever role started last.
    service: Option<ServiceType>,
    session: Option<Session>,
    advertiser: Option<Advertiser>,
    browser: Option<Browser>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn session(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.handle == handle)
    }
}

struct Shared {
    runtime: Handle,
    options: LanOptions,
    listen_port: u16,
    peers: Arc<Mutex<PeerTable>>,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    // State events are emitted with the state lock held, so each peer's events are
    // ordered the same way as the link table changes that caused them.

    /// Register an accepted incoming invite. `Connecting` is only reported for a peer that
    /// has no link yet.
    fn begin_incoming(&self, handle: SessionHandle, peer: &PeerId) -> Option<(PeerId, EventSink)> {
        let mut state = self.lock();
        let s = state.session(handle)?;
        *s.incoming.entry(peer.clone()).or_insert(0) += 1;
        if !s.links.contains_key(peer) {
            s.emit_state(peer, ConnectionState::Connecting);
        }
        Some((s.local.clone(), s.events.clone()))
    }

    /// A handshake ended without a link. The peer drops to `NotConnected` only when it has
    /// no link and no other handshake in flight.
    fn fail_handshake(&self, handle: SessionHandle, peer: &PeerId, side: Handshake) {
        let mut state = self.lock();
        let Some(s) = state.session(handle) else {
            return;
        };
        s.end_handshake(peer, side);
        if !s.links.contains_key(peer) && !s.handshaking(peer) {
            s.emit_state(peer, ConnectionState::NotConnected);
        }
    }

    /// Make `stream` the link to `peer`, unless a link initiated by a smaller instance id
    /// already exists. The peer is reported `Connected` when it had no link before.
    fn install_link(
        self: &Arc<Self>,
        handle: SessionHandle,
        peer: PeerId,
        initiator: Uuid,
        stream: TcpStream,
        side: Handshake,
    ) {
        let mut state = self.lock();
        let id = state.next_id();
        let Some(session) = state.session(handle) else {
            debug!(%peer, "session gone before link came up");
            return;
        };
        session.end_handshake(&peer, side);
        let existing = session.links.get(&peer).map(|l| l.initiator);
        if existing.map_or(true, |current| initiator < current) {
            let (reader, writer) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            session.links.insert(peer.clone(), Link { id, initiator, tx });
            self.runtime.spawn(write_loop(writer, rx));
            self.runtime.spawn(read_loop(
                self.clone(),
                peer.clone(),
                id,
                reader,
                session.events.clone(),
            ));
        } else {
            debug!(%peer, "duplicate link dropped");
        }
        if existing.is_none() {
            info!(%peer, "link up");
            session.emit_state(&peer, ConnectionState::Connected);
        } else {
            debug!(%peer, "duplicate link resolved");
        }
    }

    /// Forget link `id` to `peer` if it is still the current one. While a crossed
    /// handshake with the peer is in flight the loss is not reported: that handshake
    /// either brings the replacement link up or reports the failure itself.
    fn remove_link(&self, peer: &PeerId, id: u64) {
        let mut state = self.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if !session.links.get(peer).is_some_and(|l| l.id == id) {
            return;
        }
        session.links.remove(peer);
        if session.handshaking(peer) {
            debug!(%peer, "link closed during crossed handshake");
        } else {
            info!(%peer, "link down");
            session.emit_state(peer, ConnectionState::NotConnected);
        }
    }
}

/// [`Transport`] over the local network.
#[derive(Clone)]
pub struct LanTransport {
    shared: Arc<Shared>,
}

impl LanTransport {
    /// Bind the invite listener and start accepting. Must be called inside a runtime.
    pub async fn bind(options: LanOptions) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, options.transport_port)).await?;
        let listen_port = listener.local_addr()?.port();
        let shared = Arc::new(Shared {
            runtime: Handle::current(),
            options,
            listen_port,
            peers: Arc::new(Mutex::new(PeerTable::default())),
            state: Mutex::new(State::default()),
        });
        tokio::spawn(accept_loop(listener, shared.clone()));
        info!(port = listen_port, "transport listening");
        Ok(Self { shared })
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }
}

fn state_changed(peer: &PeerId, state: ConnectionState) -> TransportEvent {
    TransportEvent::StateChanged {
        peer: peer.clone(),
        state,
    }
}

impl Transport for LanTransport {
    fn advertise(
        &self,
        local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<AdvertiseHandle, TransportError> {
        let shared = &self.shared;
        let socket = {
            let _guard = shared.runtime.enter();
            discovery::advertise_socket()?
        };
        let beacon = encode_frame(&Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service: service.as_str().to_string(),
            peer: local.clone(),
            listen_port: shared.listen_port,
            metadata: vec![("os".to_string(), std::env::consts::OS.to_string())],
        })
        .map_err(|e| TransportError::Discovery(e.to_string()))?;
        let dest = SocketAddrV4::new(shared.options.group, shared.options.discovery_port);
        let failures = events.clone();
        let task = shared.runtime.spawn(async move {
            if let Err(error) = discovery::beacon_loop(socket, beacon, dest).await {
                warn!(%error, "advertising stopped");
                failures.emit(TransportEvent::DiscoveryFailed {
                    role: DiscoveryRole::Advertise,
                    error: error.into(),
                });
            }
        });
        let mut state = shared.lock();
        let handle = AdvertiseHandle::from_raw(state.next_id());
        state.service = Some(service.clone());
        let previous = state.advertiser.replace(Advertiser {
            handle,
            service: service.clone(),
            events,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        debug!(%service, "advertising");
        Ok(handle)
    }

    fn stop_advertise(&self, handle: AdvertiseHandle) {
        let mut state = self.shared.lock();
        if state.advertiser.as_ref().is_some_and(|a| a.handle == handle) {
            if let Some(advertiser) = state.advertiser.take() {
                advertiser.task.abort();
                debug!("advertising stopped");
            }
        }
    }

    fn browse(
        &self,
        _local: &PeerId,
        service: &ServiceType,
        events: EventSink,
    ) -> Result<BrowseHandle, TransportError> {
        let shared = &self.shared;
        let socket = {
            let _guard = shared.runtime.enter();
            discovery::browse_socket(shared.options.discovery_port, shared.options.group)?
        };
        let peers = shared.peers.clone();
        let tag = service.as_str().to_string();
        let task = shared.runtime.spawn(async move {
            if let Err(error) = discovery::browse(socket, tag, peers, events.clone()).await {
                warn!(%error, "browsing stopped");
                events.emit(TransportEvent::DiscoveryFailed {
                    role: DiscoveryRole::Browse,
                    error: error.into(),
                });
            }
        });
        let mut state = shared.lock();
        let handle = BrowseHandle::from_raw(state.next_id());
        state.service = Some(service.clone());
        if let Some(previous) = state.browser.replace(Browser { handle, task }) {
            previous.task.abort();
        }
        debug!(%service, "browsing");
        Ok(handle)
    }

    fn stop_browse(&self, handle: BrowseHandle) {
        let mut state = self.shared.lock();
        if state.browser.as_ref().is_some_and(|b| b.handle == handle) {
            if let Some(browser) = state.browser.take() {
                browser.task.abort();
                lock(&self.shared.peers).clear();
                debug!("browsing stopped");
            }
        }
    }

    fn create_session(
        &self,
        local: &PeerId,
        _policy: SecurityPolicy,
        events: EventSink,
    ) -> SessionHandle {
        let mut state = self.shared.lock();
        let handle = SessionHandle::from_raw(state.next_id());
        let previous = state.session.replace(Session {
            handle,
            local: local.clone(),
            events,
            links: HashMap::new(),
            pending: HashSet::new(),
            incoming: HashMap::new(),
        });
        if previous.is_some() {
            debug!("previous session replaced");
        }
        handle
    }

    fn invite(
        &self,
        session: SessionHandle,
        peer: &PeerId,
        context: Option<&[u8]>,
        timeout: Duration,
    ) {
        let Some(addr) = lock(&self.shared.peers).addr_of(peer) else {
            debug!(%peer, "no address for peer, invite dropped");
            return;
        };
        let (local, events, service) = {
            let mut state = self.shared.lock();
            let service = state.service.clone().unwrap_or_default();
            let Some(s) = state.session(session) else {
                return;
            };
            if s.links.contains_key(peer) {
                debug!(%peer, "already linked, invite ignored");
                return;
            }
            if !s.pending.insert(peer.clone()) {
                debug!(%peer, "invite already in flight");
                return;
            }
            s.emit_state(peer, ConnectionState::Connecting);
            (s.local.clone(), s.events.clone(), service)
        };
        let invite = Message::Invite {
            protocol_version: PROTOCOL_VERSION,
            service: service.as_str().to_string(),
            from: local.clone(),
            context: context.map(<[u8]>::to_vec),
        };
        let shared = self.shared.clone();
        let peer = peer.clone();
        self.shared.runtime.spawn(async move {
            let outcome = tokio::time::timeout(timeout, send_invite(addr, &invite, &peer)).await;
            let stream = match outcome {
                Ok(Ok(Some(stream))) => stream,
                Ok(Ok(None)) => {
                    debug!(%peer, "invite declined");
                    shared.fail_handshake(session, &peer, Handshake::Outgoing);
                    return;
                }
                Ok(Err(error)) => {
                    debug!(%peer, %error, "invite failed");
                    shared.fail_handshake(session, &peer, Handshake::Outgoing);
                    return;
                }
                Err(_) => {
                    shared.fail_handshake(session, &peer, Handshake::Outgoing);
                    events.emit(TransportEvent::InvitationTimedOut { peer });
                    return;
                }
            };
            if confirm_certificate(&events, &peer).await {
                shared.install_link(session, peer, local.instance(), stream, Handshake::Outgoing);
            } else {
                let mut stream = stream;
                let _ = write_message(&mut stream, &Message::Bye).await;
                shared.fail_handshake(session, &peer, Handshake::Outgoing);
            }
        });
    }

    fn send(
        &self,
        session: SessionHandle,
        payload: &[u8],
        peers: &[PeerId],
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        if payload.len() + DATA_OVERHEAD > MAX_FRAME_LEN {
            return Err(TransportError::PayloadTooLarge { len: payload.len() });
        }
        let mut state = self.shared.lock();
        let s = state.session(session).ok_or(TransportError::SessionClosed)?;
        let unreachable: Vec<PeerId> = peers
            .iter()
            .filter(|peer| {
                let data = Message::Data {
                    payload: payload.to_vec(),
                };
                !s.links
                    .get(*peer)
                    .is_some_and(|link| link.tx.send(data).is_ok())
            })
            .cloned()
            .collect();
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Unreachable { peers: unreachable })
        }
    }

    fn disconnect(&self, session: SessionHandle) {
        let taken = {
            let mut state = self.shared.lock();
            if state.session(session).is_some() {
                state.session.take()
            } else {
                None
            }
        };
        let Some(s) = taken else {
            return;
        };
        for (peer, link) in s.links {
            let _ = link.tx.send(Message::Bye);
            s.events
                .emit(state_changed(&peer, ConnectionState::NotConnected));
        }
        info!("session disconnected");
    }
}

async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, TransportError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map_err(|e| TransportError::Protocol(e.to_string()))
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), TransportError> {
    let frame = encode_frame(msg).map_err(|e| match e {
        FrameEncodeError::TooLarge(len) => TransportError::PayloadTooLarge { len },
        other => TransportError::Protocol(other.to_string()),
    })?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Connect, invite and wait for the answer. `None` means declined.
async fn send_invite(
    addr: SocketAddr,
    invite: &Message,
    peer: &PeerId,
) -> Result<Option<TcpStream>, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, invite).await?;
    match read_message(&mut stream).await? {
        Message::InviteReply {
            peer: replier,
            accepted,
        } if replier == *peer => Ok(accepted.then_some(stream)),
        Message::InviteReply { peer: replier, .. } => Err(TransportError::Protocol(format!(
            "invited {peer} but {replier} answered"
        ))),
        other => Err(TransportError::Protocol(format!(
            "unexpected {} during invite",
            other.kind()
        ))),
    }
}

async fn confirm_certificate(events: &EventSink, peer: &PeerId) -> bool {
    let (tx, rx) = oneshot::channel();
    events.emit(TransportEvent::CertificateReceived {
        peer: peer.clone(),
        chain: Vec::new(),
        reply: CertificateReply::new(move |ok| {
            let _ = tx.send(ok);
        }),
    });
    rx.await.unwrap_or(false)
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_invite(shared, stream).await {
                        debug!(%from, %error, "incoming invite failed");
                    }
                });
            }
            Err(error) => {
                warn!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Invited side of the handshake.
async fn handle_invite(shared: Arc<Shared>, mut stream: TcpStream) -> Result<(), TransportError> {
    let first = tokio::time::timeout(shared.options.invite_read_timeout, read_message(&mut stream))
        .await
        .map_err(|_| TransportError::Protocol("no invite before timeout".into()))??;
    let Message::Invite {
        protocol_version,
        service,
        from,
        context,
    } = first
    else {
        return Err(TransportError::Protocol("expected invite".into()));
    };
    let advertiser = {
        let state = shared.lock();
        state
            .advertiser
            .as_ref()
            .filter(|a| a.service.as_str() == service && protocol_version == PROTOCOL_VERSION)
            .map(|a| a.events.clone())
    };
    // Not advertising this service: close without answering.
    let Some(advertiser) = advertiser else {
        debug!(%from, %service, "invite for a service we do not advertise");
        return Ok(());
    };

    let (decision_tx, decision_rx) = oneshot::channel();
    advertiser.emit(TransportEvent::InvitationReceived {
        from: from.clone(),
        context,
        reply: InvitationReply::new(move |decision| {
            let _ = decision_tx.send(decision);
        }),
    });
    let decision = decision_rx.await.unwrap_or(InvitationDecision::Reject);
    let joined = match decision {
        InvitationDecision::Accept(handle) => shared
            .begin_incoming(handle, &from)
            .map(|(local, events)| (handle, local, events)),
        InvitationDecision::Reject => None,
    };
    let Some((handle, local, events)) = joined else {
        let local = shared.lock().session.as_ref().map(|s| s.local.clone());
        if let Some(local) = local {
            write_message(
                &mut stream,
                &Message::InviteReply {
                    peer: local,
                    accepted: false,
                },
            )
            .await?;
        }
        return Ok(());
    };

    let accepted = confirm_certificate(&events, &from).await;
    let reply = Message::InviteReply {
        peer: local,
        accepted,
    };
    match write_message(&mut stream, &reply).await {
        Ok(()) if accepted => {
            let initiator = from.instance();
            shared.install_link(handle, from, initiator, stream, Handshake::Incoming);
            Ok(())
        }
        Ok(()) => {
            shared.fail_handshake(handle, &from, Handshake::Incoming);
            Ok(())
        }
        Err(error) => {
            shared.fail_handshake(handle, &from, Handshake::Incoming);
            Err(error)
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let bye = matches!(msg, Message::Bye);
        if let Err(error) = write_message(&mut writer, &msg).await {
            debug!(%error, "link write failed");
            break;
        }
        if bye {
            break;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    peer: PeerId,
    id: u64,
    mut reader: OwnedReadHalf,
    events: EventSink,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Message::Data { payload }) => {
                events.emit(TransportEvent::DataReceived {
                    peer: peer.clone(),
                    payload,
                });
            }
            Ok(Message::Bye) => break,
            Ok(other) => warn!(%peer, kind = other.kind(), "unexpected message on link"),
            Err(error) => {
                debug!(%peer, %error, "link read ended");
                break;
            }
        }
    }
    shared.remove_link(&peer, id);
}

#[cfg(test)]
impl LanTransport {
    fn remember(&self, peer: &PeerId, addr: SocketAddr) {
        lock(&self.shared.peers).observe(peer, addr, std::time::Instant::now());
    }

    fn linked_peers(&self) -> Vec<PeerId> {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.links.keys().cloned().collect())
            .unwrap_or_default()
    }
}
