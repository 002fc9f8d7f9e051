//! LAN discovery: UDP multicast beacons out, beacons in, silent peers expire.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nearby_core::wire::decode_frame;
use nearby_core::{DiscoveryInfo, EventSink, Message, PeerId, TransportEvent, PROTOCOL_VERSION};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::debug;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const BEACON_JITTER_MS: u64 = 500;
pub const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const SWEEP_INTERVAL: Duration = Duration::from_secs(4);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Seen {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Peers currently heard on the LAN and where to reach their invite listener.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, Seen>,
}

impl PeerTable {
    /// Record a beacon. True when the peer was not in the table.
    pub fn observe(&mut self, peer: &PeerId, addr: SocketAddr, now: Instant) -> bool {
        self.peers
            .insert(
                peer.clone(),
                Seen {
                    addr,
                    last_seen: now,
                },
            )
            .is_none()
    }

    /// Remove and return peers silent for at least [`PEER_TIMEOUT`].
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let lost: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &lost {
            self.peers.remove(peer);
        }
        lost
    }

    pub fn addr_of(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peers.get(peer).map(|s| s.addr)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Socket for the browse role: bound to the discovery port, joined to the group.
/// Must be called inside a runtime context.
pub fn browse_socket(port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Socket for the advertise role. Loopback stays on so browsers on this host hear us.
pub fn advertise_socket() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Send `beacon` to the group until a send fails.
pub async fn beacon_loop(socket: UdpSocket, beacon: Vec<u8>, dest: SocketAddrV4) -> std::io::Result<()> {
    loop {
        socket.send_to(&beacon, dest).await?;
        let jitter = rand::thread_rng().gen_range(0..=BEACON_JITTER_MS);
        tokio::time::sleep(BEACON_INTERVAL + Duration::from_millis(jitter)).await;
    }
}

/// Beacon for `service` at the current protocol version, or None.
pub fn parse_beacon(datagram: &[u8], service: &str) -> Option<(PeerId, u16, DiscoveryInfo)> {
    match decode_frame(datagram).ok()?.0 {
        Message::Beacon {
            protocol_version,
            service: announced,
            peer,
            listen_port,
            metadata,
        } if protocol_version == PROTOCOL_VERSION && announced == service => {
            Some((peer, listen_port, metadata.into_iter().collect()))
        }
        _ => None,
    }
}

/// Browse role: report new peers as found and silent ones as lost. Returns only on a
/// socket error.
pub async fn browse(
    socket: UdpSocket,
    service: String,
    peers: Arc<Mutex<PeerTable>>,
    events: EventSink,
) -> std::io::Result<()> {
    tokio::select! {
        result = recv_loop(&socket, &service, &peers, &events) => result,
        _ = expiry_loop(&peers, &events) => Ok(()),
    }
}

async fn recv_loop(
    socket: &UdpSocket,
    service: &str,
    peers: &Mutex<PeerTable>,
    events: &EventSink,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some((peer, listen_port, info)) = parse_beacon(&buf[..n], service) else {
            continue;
        };
        let addr = SocketAddr::new(from.ip(), listen_port);
        if lock(peers).observe(&peer, addr, Instant::now()) {
            debug!(%peer, %addr, "peer found");
            events.emit(TransportEvent::PeerFound { peer, info });
        }
    }
}

async fn expiry_loop(peers: &Mutex<PeerTable>, events: &EventSink) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let lost = lock(peers).expire(Instant::now());
        for peer in lost {
            debug!(%peer, "peer lost");
            events.emit(TransportEvent::PeerLost { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::wire::encode_frame;
    use nearby_core::SERVICE_TYPE;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    #[test]
    fn first_beacon_is_new_later_ones_refresh() {
        let mut table = PeerTable::default();
        let peer = PeerId::new("den").unwrap();
        let t0 = Instant::now();
        assert!(table.observe(&peer, addr(1), t0));
        assert!(!table.observe(&peer, addr(2), t0 + Duration::from_secs(10)));
        assert_eq!(table.addr_of(&peer), Some(addr(2)));
        // Refreshed at t0+10, so still present at t0+20.
        assert!(table.expire(t0 + Duration::from_secs(20)).is_empty());
    }

    #[test]
    fn silent_peer_expires_once() {
        let mut table = PeerTable::default();
        let peer = PeerId::new("den").unwrap();
        let t0 = Instant::now();
        table.observe(&peer, addr(1), t0);
        assert_eq!(table.expire(t0 + PEER_TIMEOUT), vec![peer.clone()]);
        assert!(table.expire(t0 + PEER_TIMEOUT * 2).is_empty());
        assert_eq!(table.addr_of(&peer), None);
        // Heard again after expiry: reported as new.
        assert!(table.observe(&peer, addr(1), t0 + PEER_TIMEOUT * 2));
    }

    fn beacon(version: u8, service: &str) -> Vec<u8> {
        encode_frame(&Message::Beacon {
            protocol_version: version,
            service: service.to_string(),
            peer: PeerId::new("attic").unwrap(),
            listen_port: 45681,
            metadata: vec![("os".into(), "linux".into())],
        })
        .unwrap()
    }

    #[test]
    fn beacon_for_our_service_parses() {
        let (peer, port, info) = parse_beacon(&beacon(PROTOCOL_VERSION, SERVICE_TYPE), SERVICE_TYPE).unwrap();
        assert_eq!(peer.display_name(), "attic");
        assert_eq!(port, 45681);
        assert_eq!(info.get("os").map(String::as_str), Some("linux"));
    }

    #[test]
    fn foreign_beacons_are_ignored() {
        assert!(parse_beacon(&beacon(PROTOCOL_VERSION, "other-chat"), SERVICE_TYPE).is_none());
        assert!(parse_beacon(&beacon(PROTOCOL_VERSION + 1, SERVICE_TYPE), SERVICE_TYPE).is_none());
        assert!(parse_beacon(b"\x01\x00", SERVICE_TYPE).is_none());
        let data = encode_frame(&Message::Data { payload: vec![1] }).unwrap();
        assert!(parse_beacon(&data, SERVICE_TYPE).is_none());
    }
}
