//! Outgoing call initiation with one proxy-authentication retry
//!
//! # Flow
//!
//! ```text
//!   INVITE ─────────────► proxy
//!          ◄───────────── 407 (Proxy-Authenticate)      ── Challenged
//!   INVITE + Proxy-Authorization ─► proxy               ── ReInitiated
//!          ◄───────────── 100 / 180 / ...               ── handle returned
//! ```
//!
//! A second 407 after the authenticated retry is a failure: the initiator
//! never sends a third INVITE.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::{build_auth_response, AuthChallenge, Credential};
use crate::error::{CallProbeError, CallProbeResult};
use crate::signaling::{status, CallLeg, InviteRequest, SipHeader, SipResponse, SipUri, UserAgent};

/// Method used for the digest of the retried request
const INVITE: &str = "INVITE";

/// Lifecycle of a call leg while it is being set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCallState {
    /// First INVITE sent
    Initiated,
    /// 407 received for the first INVITE
    Challenged,
    /// Authenticated INVITE sent
    ReInitiated,
    /// 200 received and acknowledged
    Answered,
    /// Setup gave up
    Failed,
}

impl fmt::Display for PendingCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Challenged => "challenged",
            Self::ReInitiated => "re-initiated",
            Self::Answered => "answered",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A signaling dialog in flight
///
/// Returned by [`CallInitiator::attempt_call`] and moved into the completion
/// task, which owns it until the call is connected or abandoned.
pub struct PendingCall {
    leg: Box<dyn CallLeg>,
    state: PendingCallState,
    request: InviteRequest,
    invites_sent: u8,
}

impl PendingCall {
    pub fn call_id(&self) -> &str {
        self.leg.call_id()
    }

    pub fn state(&self) -> PendingCallState {
        self.state
    }

    /// The last INVITE sent on this leg
    pub fn request(&self) -> &InviteRequest {
        &self.request
    }

    /// Number of INVITEs sent, including the authenticated retry
    pub fn invites_sent(&self) -> u8 {
        self.invites_sent
    }

    pub fn leg(&self) -> &dyn CallLeg {
        self.leg.as_ref()
    }

    pub fn leg_mut(&mut self) -> &mut dyn CallLeg {
        self.leg.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: PendingCallState) {
        debug!(call_id = %self.call_id(), from = %self.state, to = %state, "Pending call state changed");
        self.state = state;
    }

    /// Tear down the signaling dialog
    pub async fn dispose(mut self) {
        info!(call_id = %self.call_id(), state = %self.state, "Disposing call");
        self.leg.dispose().await;
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_id", &self.call_id())
            .field("state", &self.state)
            .field("invites_sent", &self.invites_sent)
            .finish()
    }
}

/// Places outgoing calls on a [`UserAgent`]
pub struct CallInitiator<'a> {
    user_agent: &'a dyn UserAgent,
    response_timeout: Duration,
}

impl<'a> CallInitiator<'a> {
    /// Default bound on each wait for a response to an INVITE
    pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(user_agent: &'a dyn UserAgent) -> Self {
        Self {
            user_agent,
            response_timeout: Self::DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Place a call, collapsing every failure into `None`
    ///
    /// The cause is logged; use [`try_attempt_call`](Self::try_attempt_call)
    /// to inspect it.
    pub async fn attempt_call(
        &self,
        request_target: &str,
        from_identity: &str,
        credential: &Credential,
        extra_headers: Vec<SipHeader>,
        session_description: Option<String>,
    ) -> Option<PendingCall> {
        match self
            .try_attempt_call(request_target, from_identity, credential, extra_headers, session_description)
            .await
        {
            Ok(call) => Some(call),
            Err(e) => {
                warn!(target_uri = %request_target, error = %e, "Call attempt failed");
                None
            }
        }
    }

    /// Place a call and report why it failed
    ///
    /// # Errors
    ///
    /// * `InvalidUri` - target or identity is not a SIP URI
    /// * `NoResponse` - nothing came back for an INVITE
    /// * `MalformedChallenge` / `UnsupportedAlgorithm` - the 407 could not be answered
    /// * `AuthenticationRejected` - the proxy challenged the authenticated retry
    /// * `Signaling` - the signaling collaborator failed to send
    pub async fn try_attempt_call(
        &self,
        request_target: &str,
        from_identity: &str,
        credential: &Credential,
        extra_headers: Vec<SipHeader>,
        session_description: Option<String>,
    ) -> CallProbeResult<PendingCall> {
        let target: SipUri = request_target.parse()?;
        let from: SipUri = from_identity.parse()?;
        let request = InviteRequest::new(target, from, extra_headers, session_description);

        let mut call = PendingCall {
            leg: self.user_agent.create_call(),
            state: PendingCallState::Initiated,
            request: request.clone(),
            invites_sent: 0,
        };

        info!(call_id = %call.call_id(), target_uri = %request.request_uri, "Sending INVITE");
        let first = self.send_and_wait(&mut call, request).await?;

        if first.status != status::PROXY_AUTHENTICATION_REQUIRED {
            debug!(call_id = %call.call_id(), response = %first, "INVITE accepted without challenge");
            return Ok(call);
        }

        call.set_state(PendingCallState::Challenged);
        let retry = match self.authenticated_retry(&call, &first, credential) {
            Ok(retry) => retry,
            Err(e) => {
                call.set_state(PendingCallState::Failed);
                return Err(e);
            }
        };

        call.set_state(PendingCallState::ReInitiated);
        info!(call_id = %call.call_id(), "Re-sending INVITE with proxy credentials");
        let second = self.send_and_wait(&mut call, retry).await?;

        if second.status == status::PROXY_AUTHENTICATION_REQUIRED {
            call.set_state(PendingCallState::Failed);
            return Err(CallProbeError::AuthenticationRejected {
                realm: AuthChallenge::from_response(&second)
                    .ok()
                    .and_then(|c| c.realm)
                    .unwrap_or_else(|| credential.realm.clone()),
            });
        }

        debug!(call_id = %call.call_id(), response = %second, "Authenticated INVITE accepted");
        Ok(call)
    }

    fn authenticated_retry(
        &self,
        call: &PendingCall,
        challenge_response: &SipResponse,
        credential: &Credential,
    ) -> CallProbeResult<InviteRequest> {
        let challenge = AuthChallenge::from_response(challenge_response)?;
        let target = call.request.request_uri.as_str();
        let auth = build_auth_response(&challenge, credential, INVITE, target)?;
        debug!(call_id = %call.call_id(), realm = %auth.realm, algorithm = %auth.algorithm, "Answering proxy challenge");
        Ok(call.request.with_header(auth.to_header()))
    }

    async fn send_and_wait(&self, call: &mut PendingCall, request: InviteRequest) -> CallProbeResult<SipResponse> {
        let outcome = async {
            call.leg.send_invite(request.clone()).await?;
            call.invites_sent += 1;
            call.request = request;
            call.leg.wait_for_response(self.response_timeout).await
        }
        .await;

        match outcome {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                call.set_state(PendingCallState::Failed);
                Err(CallProbeError::NoResponse {
                    method: INVITE.to_string(),
                })
            }
            Err(e) => {
                call.set_state(PendingCallState::Failed);
                Err(e)
            }
        }
    }
}
