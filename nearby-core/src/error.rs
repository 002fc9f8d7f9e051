//! Error taxonomy. Nothing here is fatal: the worst outcome of any of these is a peer that
//! never reaches `Connected` or a payload that never arrives.

use std::sync::Arc;

use crate::identity::PeerId;

/// Which discovery role an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryRole {
    Browse,
    Advertise,
}

impl std::fmt::Display for DiscoveryRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryRole::Browse => f.write_str("browse"),
            DiscoveryRole::Advertise => f.write_str("advertise"),
        }
    }
}

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    /// Some of the requested peers could not be reached; the rest were accepted.
    #[error("{} peer(s) unreachable", .peers.len())]
    Unreachable { peers: Vec<PeerId> },
    #[error("session is closed")]
    SessionClosed,
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("payload of {len} bytes exceeds transport limit")]
    PayloadTooLarge { len: usize },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl TransportError {
    /// Peers this error applies to, out of the ones a send targeted.
    pub fn affected<'a>(&'a self, targeted: &'a [PeerId]) -> Vec<&'a PeerId> {
        match self {
            TransportError::NotConnected(peer) => vec![peer],
            TransportError::Unreachable { peers } => peers.iter().collect(),
            _ => targeted.iter().collect(),
        }
    }
}

/// Non-fatal failures surfaced to the optional listener error channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("{role} role failed to start: {source}")]
    DiscoveryStart {
        role: DiscoveryRole,
        source: TransportError,
    },
    #[error("send to {} peer(s) failed: {source}", .peers.len())]
    Send {
        peers: Vec<PeerId>,
        source: TransportError,
    },
    #[error("invitation to {peer} timed out")]
    InvitationTimeout { peer: PeerId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affected_narrows_to_named_peers() {
        let a = PeerId::new("a").unwrap();
        let b = PeerId::new("b").unwrap();
        let targeted = vec![a.clone(), b.clone()];

        let err = TransportError::Unreachable {
            peers: vec![b.clone()],
        };
        assert_eq!(err.affected(&targeted), vec![&b]);

        let err = TransportError::NotConnected(a.clone());
        assert_eq!(err.affected(&targeted), vec![&a]);

        let err = TransportError::SessionClosed;
        assert_eq!(err.affected(&targeted), vec![&a, &b]);
    }

    #[test]
    fn messages_name_the_role() {
        let err = SessionError::DiscoveryStart {
            role: DiscoveryRole::Advertise,
            source: TransportError::Discovery("no multicast route".into()),
        };
        assert_eq!(
            err.to_string(),
            "advertise role failed to start: discovery failed: no multicast route"
        );
    }
}
