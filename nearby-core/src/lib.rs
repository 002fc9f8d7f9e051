//! Nearby peer sessions: discover peers advertising the same service tag, pull them into
//! one shared session, and exchange opaque payloads with them.
//! Transport-agnostic: the host supplies a [`Transport`] and receives events through a
//! [`SessionListener`].

pub mod discovery;
pub mod error;
pub mod identity;
pub mod loopback;
pub mod manager;
pub mod messaging;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wire;

pub use discovery::{DiscoveryCoordinator, INVITE_TIMEOUT};
pub use error::{DiscoveryRole, SessionError, TransportError};
pub use identity::{device_name, IdentityError, PeerId, ServiceType, ServiceTypeError, SERVICE_TYPE};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::{SessionListener, SessionManager};
pub use messaging::{DeliveryOutcome, MessagingGateway, SendReport};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{ConnectionState, SessionTracker};
pub use transport::{
    AdvertiseHandle, BrowseHandle, CertificateReply, DiscoveryInfo, EventSink, EventStream,
    InvitationDecision, InvitationReply, SecurityPolicy, SendMode, SessionHandle, Transport,
    TransportEvent,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
