//! LAN wire messages and version.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Carried in beacons and invites; mismatches are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: periodic multicast announcement of an advertising peer.
    Beacon {
        protocol_version: u8,
        service: String,
        peer: PeerId,
        /// TCP port accepting invites.
        listen_port: u16,
        metadata: Vec<(String, String)>,
    },
    /// First frame on a fresh TCP connection: ask the listener to join our session.
    Invite {
        protocol_version: u8,
        service: String,
        from: PeerId,
        context: Option<Vec<u8>>,
    },
    /// Answer to `Invite`. Sent by the invited peer, which identifies itself.
    InviteReply { peer: PeerId, accepted: bool },
    /// Application payload on an established link.
    Data { payload: Vec<u8> },
    /// Graceful close of a link.
    Bye,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Beacon { .. } => "beacon",
            Message::Invite { .. } => "invite",
            Message::InviteReply { .. } => "invite-reply",
            Message::Data { .. } => "data",
            Message::Bye => "bye",
        }
    }
}
