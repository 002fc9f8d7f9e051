//! Per-peer connection state of the shared session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::identity::PeerId;

/// Connection state of one peer. Only transport events move a peer between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Peer-state map of the session. Written only from the dispatcher; read from any thread.
///
/// Entries are never removed: a peer that disconnects stays in the map as `NotConnected`.
#[derive(Debug)]
pub struct SessionTracker {
    local: PeerId,
    states: Mutex<HashMap<PeerId, ConnectionState>>,
}

impl SessionTracker {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<PeerId, ConnectionState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the state a transport reported. Returns false (and changes nothing) for
    /// events about the local identity.
    pub fn apply(&self, peer: &PeerId, state: ConnectionState) -> bool {
        if *peer == self.local {
            warn!(%peer, %state, "dropping state change for local identity");
            return false;
        }
        let previous = self.states().insert(peer.clone(), state);
        debug!(%peer, ?previous, %state, "peer state changed");
        true
    }

    /// Peers whose last reported state is `Connected`, in no particular order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.states()
            .iter()
            .filter(|(_, s)| **s == ConnectionState::Connected)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Last reported state; `NotConnected` for peers never seen.
    pub fn state_of(&self, peer: &PeerId) -> ConnectionState {
        self.states().get(peer).copied().unwrap_or_default()
    }

    /// Every peer the session has heard about, whatever its state.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.states().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[test]
    fn connected_peers_follow_last_state() {
        let tracker = SessionTracker::new(peer("me"));
        let a = peer("a");
        let b = peer("b");
        let c = peer("c");

        tracker.apply(&a, ConnectionState::Connecting);
        tracker.apply(&a, ConnectionState::Connected);
        tracker.apply(&b, ConnectionState::Connected);
        tracker.apply(&b, ConnectionState::NotConnected);
        tracker.apply(&c, ConnectionState::Connected);
        tracker.apply(&c, ConnectionState::Connecting);

        let connected: HashSet<_> = tracker.connected_peers().into_iter().collect();
        assert_eq!(connected, HashSet::from([a.clone()]));
        assert_eq!(tracker.state_of(&b), ConnectionState::NotConnected);
        assert_eq!(tracker.state_of(&c), ConnectionState::Connecting);
        // Disconnected peers keep their entry.
        assert_eq!(tracker.known_peers().len(), 3);
    }

    #[test]
    fn unknown_peer_is_not_connected() {
        let tracker = SessionTracker::new(peer("me"));
        assert_eq!(tracker.state_of(&peer("x")), ConnectionState::NotConnected);
        assert!(tracker.connected_peers().is_empty());
    }

    #[test]
    fn local_identity_never_tracked() {
        let me = peer("me");
        let tracker = SessionTracker::new(me.clone());
        assert!(!tracker.apply(&me, ConnectionState::Connected));
        assert!(tracker.known_peers().is_empty());
        assert!(tracker.connected_peers().is_empty());
    }
}
