//! Scripted SIP peer

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{build_auth_response, AuthChallenge, Credential, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use crate::error::{CallProbeError, CallProbeResult};
use crate::signaling::{status, CallLeg, InviteRequest, SipResponse, UserAgent};

const ANSWER_SDP: &str = "v=0\r\n\
o=loopback 2890844527 2890844527 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 8 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=sendrecv\r\n";

/// How the peer reacts once an INVITE gets through
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAnswer {
    /// 200 OK with an SDP body after `delay`
    Answer { delay: Duration },
    /// Final failure `status` after `delay`
    Reject { status: u16, delay: Duration },
    /// Never send a final response
    Silent,
}

/// Behaviour of the loopback peer
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// How many INVITEs on a leg get a 407 before one is accepted
    pub challenges: u8,
    /// `Proxy-Authenticate` value sent with each 407
    pub challenge_header: String,
    /// When set, authenticated INVITEs are checked against this credential
    /// and answered 403 on mismatch
    pub expected_credential: Option<Credential>,
    /// Drop every INVITE without any response
    pub unresponsive: bool,
    pub answer: PeerAnswer,
    pub answer_sdp: String,
    /// Answer REGISTER with 403
    pub reject_registration: bool,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            challenges: 0,
            challenge_header: format!(
                "Digest realm=\"loopback\", nonce=\"{}\", algorithm=MD5",
                Uuid::new_v4().simple()
            ),
            expected_credential: None,
            unresponsive: false,
            answer: PeerAnswer::Answer {
                delay: Duration::from_millis(50),
            },
            answer_sdp: ANSWER_SDP.to_string(),
            reject_registration: false,
        }
    }
}

impl PeerScript {
    pub fn with_challenges(mut self, challenges: u8) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn with_challenge_header(mut self, header: impl Into<String>) -> Self {
        self.challenge_header = header.into();
        self
    }

    pub fn expecting(mut self, credential: Credential) -> Self {
        self.expected_credential = Some(credential);
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    pub fn answer_after(mut self, delay: Duration) -> Self {
        self.answer = PeerAnswer::Answer { delay };
        self
    }

    pub fn reject_with(mut self, status: u16, delay: Duration) -> Self {
        self.answer = PeerAnswer::Reject { status, delay };
        self
    }

    pub fn never_answer(mut self) -> Self {
        self.answer = PeerAnswer::Silent;
        self
    }

    pub fn with_answer_sdp(mut self, sdp: impl Into<String>) -> Self {
        self.answer_sdp = sdp.into();
        self
    }

    pub fn rejecting_registration(mut self) -> Self {
        self.reject_registration = true;
        self
    }
}

/// Counters shared by every leg of a [`LoopbackUserAgent`]
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub registrations: usize,
    pub invites: usize,
    pub acks: usize,
    pub disposed: usize,
    /// INVITEs as received, oldest first
    pub requests: Vec<InviteRequest>,
}

/// A user agent talking to the scripted peer
pub struct LoopbackUserAgent {
    script: PeerScript,
    stats: Arc<Mutex<LoopbackStats>>,
}

impl LoopbackUserAgent {
    pub fn new(script: PeerScript) -> Self {
        Self {
            script,
            stats: Arc::new(Mutex::new(LoopbackStats::default())),
        }
    }

    pub fn script(&self) -> &PeerScript {
        &self.script
    }

    pub fn stats(&self) -> LoopbackStats {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl UserAgent for LoopbackUserAgent {
    async fn register(&self, credential: &Credential, expires: u32) -> CallProbeResult<()> {
        self.stats.lock().registrations += 1;
        if self.script.reject_registration {
            return Err(CallProbeError::signaling(format!(
                "REGISTER for {} rejected with 403",
                credential.user
            )));
        }
        debug!(user = %credential.user, expires, "Loopback registration accepted");
        Ok(())
    }

    fn create_call(&self) -> Box<dyn CallLeg> {
        Box::new(LoopbackCall::new(self.script.clone(), self.stats.clone()))
    }
}

/// One call leg against the scripted peer
pub struct LoopbackCall {
    call_id: String,
    script: PeerScript,
    stats: Arc<Mutex<LoopbackStats>>,
    invites: u8,
    accepted: bool,
    queued: VecDeque<SipResponse>,
    received: Vec<SipResponse>,
    acked: bool,
    disposed: bool,
}

impl LoopbackCall {
    fn new(script: PeerScript, stats: Arc<Mutex<LoopbackStats>>) -> Self {
        Self {
            call_id: format!("{}@loopback", Uuid::new_v4()),
            script,
            stats,
            invites: 0,
            accepted: false,
            queued: VecDeque::new(),
            received: Vec::new(),
            acked: false,
            disposed: false,
        }
    }

    fn respond_to_invite(&self, request: &InviteRequest) -> Option<SipResponse> {
        if self.script.unresponsive {
            return None;
        }
        if self.invites <= self.script.challenges {
            return Some(
                SipResponse::new(status::PROXY_AUTHENTICATION_REQUIRED, "Proxy Authentication Required")
                    .with_header(PROXY_AUTHENTICATE, self.script.challenge_header.clone()),
            );
        }
        if !self.authorized(request) {
            return Some(SipResponse::new(403, "Forbidden"));
        }
        Some(SipResponse::new(status::TRYING, "Trying"))
    }

    // Recompute the digest the way the proxy would
    fn authorized(&self, request: &InviteRequest) -> bool {
        let Some(expected) = &self.script.expected_credential else {
            return true;
        };
        let Some(header) = request.header(PROXY_AUTHORIZATION) else {
            return false;
        };
        let Ok(challenge) = AuthChallenge::parse(&self.script.challenge_header) else {
            return false;
        };
        match build_auth_response(&challenge, expected, "INVITE", request.request_uri.as_str()) {
            Ok(auth) => header.value == auth.to_string(),
            Err(_) => false,
        }
    }

    fn push(&mut self, response: SipResponse) {
        debug!(call_id = %self.call_id, response = %response, "Loopback response");
        self.received.push(response);
    }
}

#[async_trait]
impl CallLeg for LoopbackCall {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn send_invite(&mut self, request: InviteRequest) -> CallProbeResult<()> {
        if self.disposed {
            return Err(CallProbeError::signaling("call leg already disposed"));
        }
        self.invites += 1;
        {
            let mut stats = self.stats.lock();
            stats.invites += 1;
            stats.requests.push(request.clone());
        }
        if let Some(response) = self.respond_to_invite(&request) {
            self.accepted = response.is_provisional();
            self.queued.push_back(response);
        }
        Ok(())
    }

    async fn wait_for_response(&mut self, timeout: Duration) -> CallProbeResult<Option<SipResponse>> {
        match self.queued.pop_front() {
            Some(response) => {
                self.push(response.clone());
                Ok(Some(response))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    fn find_response(&self, status: u16) -> Option<SipResponse> {
        self.received.iter().rev().find(|r| r.status == status).cloned()
    }

    fn last_response(&self) -> Option<SipResponse> {
        self.received.last().cloned()
    }

    async fn wait_for_answer(&mut self, timeout: Duration) -> bool {
        if self.find_response(status::OK).is_some() {
            return true;
        }
        if !self.accepted {
            return false;
        }

        match self.script.answer.clone() {
            PeerAnswer::Answer { delay } if delay <= timeout => {
                tokio::time::sleep(delay).await;
                let ok = SipResponse::new(status::OK, "OK")
                    .with_header("Content-Type", "application/sdp")
                    .with_body(self.script.answer_sdp.clone());
                self.push(ok);
                true
            }
            PeerAnswer::Reject { status, delay } if delay <= timeout => {
                tokio::time::sleep(delay).await;
                self.push(SipResponse::new(status, "Rejected"));
                false
            }
            _ => {
                tokio::time::sleep(timeout).await;
                false
            }
        }
    }

    async fn send_ack(&mut self) -> CallProbeResult<()> {
        if self.find_response(status::OK).is_none() {
            return Err(CallProbeError::signaling("no 2xx response to acknowledge"));
        }
        self.acked = true;
        self.stats.lock().acks += 1;
        Ok(())
    }

    async fn dispose(&mut self) {
        if std::mem::replace(&mut self.disposed, true) {
            return;
        }
        self.stats.lock().disposed += 1;
        debug!(call_id = %self.call_id, acked = self.acked, "Loopback call disposed");
    }
}
