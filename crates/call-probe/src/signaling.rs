//! Signaling boundary for the call probe
//!
//! The probe does not implement a SIP stack. It drives one through the
//! [`UserAgent`] and [`CallLeg`] traits defined here, exchanging the small
//! set of value types the orchestration needs: URIs, headers, INVITE
//! parameters and received responses.
//!
//! # Call leg contract
//!
//! ```text
//! send_invite ──► wait_for_response ──► last_response / find_response
//!      ▲                                        │
//!      └──────── (one retry on 407) ◄───────────┘
//!
//! wait_for_answer ──► find_response(200) ──► send_ack ──► ... ──► dispose
//! ```
//!
//! A leg keeps every response it has received across INVITE attempts, so
//! `find_response` answers "the most recent response with this status"
//! while `last_response` answers "the most recent response of any status".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::auth::Credential;
use crate::error::{CallProbeError, CallProbeResult};

/// Status codes the probe reacts to
pub mod status {
    /// 100 Trying
    pub const TRYING: u16 = 100;
    /// 180 Ringing
    pub const RINGING: u16 = 180;
    /// 200 OK
    pub const OK: u16 = 200;
    /// 407 Proxy Authentication Required
    pub const PROXY_AUTHENTICATION_REQUIRED: u16 = 407;
}

/// A validated `sip:` or `sips:` URI
///
/// Parsing goes through [`url::Url`] and then checks the SIP specific parts:
/// the scheme and a non-empty host in the `user@host` section.
///
/// ```rust
/// use rvoip_call_probe::signaling::SipUri;
///
/// let uri: SipUri = "sip:10000@sipgate.de".parse().unwrap();
/// assert_eq!(uri.user(), Some("10000"));
/// assert_eq!(uri.host(), "sipgate.de");
/// assert!("http://example.com".parse::<SipUri>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SipUri {
    raw: String,
    user: Option<String>,
    host: String,
}

impl SipUri {
    /// User part, if the URI has one
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Host part, including the port when present
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The URI as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SipUri {
    type Err = CallProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let url = url::Url::parse(trimmed)
            .map_err(|e| CallProbeError::invalid_uri(trimmed, e.to_string()))?;

        if url.scheme() != "sip" && url.scheme() != "sips" {
            return Err(CallProbeError::invalid_uri(
                trimmed,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        // sip URIs have no authority component, so the whole user@host part
        // ends up in the opaque path. Strip URI parameters and headers first.
        let addr = url
            .path()
            .split(|c: char| c == ';' || c == '?')
            .next()
            .unwrap_or_default();

        let (user, host) = match addr.rsplit_once('@') {
            Some((user, host)) => {
                if user.is_empty() {
                    return Err(CallProbeError::invalid_uri(trimmed, "empty user part"));
                }
                (Some(user.to_string()), host)
            }
            None => (None, addr),
        };

        if host.is_empty() {
            return Err(CallProbeError::invalid_uri(trimmed, "missing host"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            user,
            host: host.to_string(),
        })
    }
}

impl TryFrom<String> for SipUri {
    type Error = CallProbeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SipUri> for String {
    fn from(uri: SipUri) -> Self {
        uri.raw
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single header line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `Content-Type: application/sdp`
    pub fn content_type_sdp() -> Self {
        Self::new("Content-Type", "application/sdp")
    }

    /// Case-insensitive name comparison
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for SipHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Parameters of one outgoing INVITE
#[derive(Debug, Clone, PartialEq)]
pub struct InviteRequest {
    pub request_uri: SipUri,
    pub from: SipUri,
    pub headers: Vec<SipHeader>,
    pub body: Option<String>,
}

impl InviteRequest {
    /// Build an INVITE, adding `Content-Type: application/sdp` when a body is present
    pub fn new(
        request_uri: SipUri,
        from: SipUri,
        extra_headers: Vec<SipHeader>,
        body: Option<String>,
    ) -> Self {
        let mut headers = extra_headers;
        if body.is_some() && !headers.iter().any(|h| h.is("Content-Type")) {
            headers.push(SipHeader::content_type_sdp());
        }
        Self {
            request_uri,
            from,
            headers,
            body,
        }
    }

    /// Copy of this request with one more header appended
    pub fn with_header(&self, header: SipHeader) -> Self {
        let mut request = self.clone();
        request.headers.push(header);
        request
    }

    pub fn header(&self, name: &str) -> Option<&SipHeader> {
        self.headers.iter().find(|h| h.is(name))
    }
}

/// A response received on a call leg
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<SipHeader>,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(SipHeader::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

/// One outgoing call dialog on a signaling stack
#[async_trait]
pub trait CallLeg: Send + Sync {
    /// Call-ID of the dialog
    fn call_id(&self) -> &str;

    /// Send (or re-send) the INVITE for this leg
    async fn send_invite(&mut self, request: InviteRequest) -> CallProbeResult<()>;

    /// Wait for the next response to the outstanding INVITE.
    ///
    /// Returns `None` when nothing arrives within `timeout`.
    async fn wait_for_response(&mut self, timeout: Duration) -> CallProbeResult<Option<SipResponse>>;

    /// Most recent response received with the given status
    fn find_response(&self, status: u16) -> Option<SipResponse>;

    /// Most recent response of any status
    fn last_response(&self) -> Option<SipResponse>;

    /// Wait until a final response arrives. Returns `true` only for a 2xx.
    async fn wait_for_answer(&mut self, timeout: Duration) -> bool;

    /// Acknowledge the 2xx answer
    async fn send_ack(&mut self) -> CallProbeResult<()>;

    /// Tear down the dialog and release its signaling resources
    async fn dispose(&mut self);
}

/// A registered SIP phone able to create call legs
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Register with the proxy using `credential`
    async fn register(&self, credential: &Credential, expires: u32) -> CallProbeResult<()>;

    /// Create a fresh, unsent call leg
    fn create_call(&self) -> Box<dyn CallLeg>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_host() {
        let uri: SipUri = "sip:alice@example.com:5060;transport=udp".parse().unwrap();
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com:5060");
        assert_eq!(uri.to_string(), "sip:alice@example.com:5060;transport=udp");
    }

    #[test]
    fn accepts_registrar_uri_without_user() {
        let uri: SipUri = "sips:registrar.example.com".parse().unwrap();
        assert_eq!(uri.user(), None);
        assert_eq!(uri.host(), "registrar.example.com");
    }

    #[test]
    fn rejects_malformed_uris() {
        for bad in ["", "alice@example.com", "http://example.com", "sip:", "sip:alice@", "sip:@host"] {
            assert!(bad.parse::<SipUri>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn invite_adds_sdp_content_type_only_with_body() {
        let target: SipUri = "sip:bob@example.com".parse().unwrap();
        let from: SipUri = "sip:alice@example.com".parse().unwrap();

        let with_body = InviteRequest::new(target.clone(), from.clone(), vec![], Some("v=0".into()));
        assert_eq!(
            with_body.header("content-type").map(|h| h.value.as_str()),
            Some("application/sdp")
        );

        let without_body = InviteRequest::new(target, from, vec![], None);
        assert!(without_body.header("Content-Type").is_none());
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let response = SipResponse::new(407, "Proxy Authentication Required")
            .with_header("Proxy-Authenticate", "Digest realm=\"x\", nonce=\"y\"");
        assert!(response.header("proxy-authenticate").is_some());
        assert!(response.is_final());
        assert!(!response.is_success());
    }
}
