//! Discovery coordinator: runs the browse and advertise roles and turns what they see into
//! invitations. Policy is flat: invite everyone found, accept everyone who
//! invites, except ourselves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{DiscoveryRole, SessionError, TransportError};
use crate::identity::{PeerId, ServiceType};
use crate::transport::{
    AdvertiseHandle, BrowseHandle, DiscoveryInfo, EventSink, InvitationDecision,
    InvitationReply, SessionHandle, Transport,
};

/// How long an outgoing invitation waits for an answer.
pub const INVITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Roles {
    started: bool,
    browse: Option<BrowseHandle>,
    advertise: Option<AdvertiseHandle>,
    session: Option<SessionHandle>,
}

pub struct DiscoveryCoordinator {
    transport: Arc<dyn Transport>,
    local: PeerId,
    service: ServiceType,
    roles: Mutex<Roles>,
}

impl DiscoveryCoordinator {
    pub fn new(transport: Arc<dyn Transport>, local: PeerId, service: ServiceType) -> Self {
        Self {
            transport,
            local,
            service,
            roles: Mutex::new(Roles::default()),
        }
    }

    fn roles(&self) -> MutexGuard<'_, Roles> {
        self.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start browsing and advertising for `session`. A repeat call while started is a no-op.
    ///
    /// A role that fails to start is logged and returned; the coordinator still counts as
    /// started so that `stop()` cleans up whichever role did come up.
    pub fn start(&self, session: SessionHandle, events: &EventSink) -> Vec<SessionError> {
        let mut roles = self.roles();
        if roles.started {
            debug!("discovery already started");
            return Vec::new();
        }
        roles.started = true;
        roles.session = Some(session);

        let mut failures = Vec::new();
        match self
            .transport
            .browse(&self.local, &self.service, events.clone())
        {
            Ok(handle) => roles.browse = Some(handle),
            Err(e) => failures.push(self.role_failed(DiscoveryRole::Browse, e)),
        }
        match self
            .transport
            .advertise(&self.local, &self.service, events.clone())
        {
            Ok(handle) => roles.advertise = Some(handle),
            Err(e) => failures.push(self.role_failed(DiscoveryRole::Advertise, e)),
        }
        info!(
            service = %self.service,
            local = %self.local,
            browsing = roles.browse.is_some(),
            advertising = roles.advertise.is_some(),
            "discovery started"
        );
        failures
    }

    /// Stop both roles and clear their handles. No transport calls when not started.
    pub fn stop(&self) {
        let mut roles = self.roles();
        if !roles.started {
            return;
        }
        if let Some(handle) = roles.browse.take() {
            self.transport.stop_browse(handle);
        }
        if let Some(handle) = roles.advertise.take() {
            self.transport.stop_advertise(handle);
        }
        roles.started = false;
        roles.session = None;
        info!("discovery stopped");
    }

    pub fn is_started(&self) -> bool {
        self.roles().started
    }

    pub fn is_browsing(&self) -> bool {
        self.roles().browse.is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.roles().advertise.is_some()
    }

    fn active_session(&self) -> Option<SessionHandle> {
        let roles = self.roles();
        if roles.started {
            roles.session
        } else {
            None
        }
    }

    /// Invite a newly found peer. Returns whether an invite went out.
    ///
    /// Every call for a non-self peer invites again; repeated invites are the transport's
    /// problem.
    pub fn on_peer_found(&self, peer: &PeerId, info: &DiscoveryInfo) -> bool {
        if *peer == self.local {
            debug!("ignoring our own advertisement");
            return false;
        }
        let Some(session) = self.active_session() else {
            debug!(%peer, "peer found while discovery stopped");
            return false;
        };
        debug!(%peer, ?info, "peer found, inviting");
        self.transport.invite(session, peer, None, INVITE_TIMEOUT);
        true
    }

    /// Losing sight of a peer does not mean its link is gone; state comes from the session.
    pub fn on_peer_lost(&self, peer: &PeerId) {
        debug!(%peer, "peer lost");
    }

    /// Accept any invitation that is not from ourselves.
    pub fn on_invitation_received(
        &self,
        from: &PeerId,
        context: Option<&[u8]>,
        reply: InvitationReply,
    ) -> InvitationDecision {
        let decision = if *from == self.local {
            debug!("rejecting invitation from ourselves");
            InvitationDecision::Reject
        } else {
            match self.active_session() {
                Some(session) => InvitationDecision::Accept(session),
                None => {
                    debug!(%from, "rejecting invitation while discovery stopped");
                    InvitationDecision::Reject
                }
            }
        };
        debug!(
            %from,
            context_len = context.map_or(0, <[u8]>::len),
            ?decision,
            "answering invitation"
        );
        reply.decide(decision);
        decision
    }

    /// Discovery failures are only reported; nothing is retried.
    pub fn on_discovery_error(&self, role: DiscoveryRole, error: TransportError) -> SessionError {
        self.role_failed(role, error)
    }

    fn role_failed(&self, role: DiscoveryRole, error: TransportError) -> SessionError {
        warn!(%role, %error, "discovery role failed");
        SessionError::DiscoveryStart {
            role,
            source: error,
        }
    }
}
