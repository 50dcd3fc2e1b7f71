//! Proxy digest authentication
//!
//! Turns a `Proxy-Authenticate` challenge from a 407 response into the
//! `Proxy-Authorization` value for the retried INVITE. The response is the
//! plain RFC 2617 digest without `qop`:
//!
//! ```text
//! HA1      = H(username ":" realm ":" password)
//! HA2      = H(method ":" uri)
//! response = H(HA1 ":" nonce ":" HA2)
//! ```
//!
//! Everything here is a pure function of its inputs, so the same challenge,
//! credential, method and URI always produce the same header.
//!
//! ```rust
//! use rvoip_call_probe::auth::{AuthChallenge, Credential, build_auth_response};
//!
//! let challenge = AuthChallenge::parse(r#"Digest realm="sipgate.de", nonce="abc123""#).unwrap();
//! let credential = Credential::new("sipgate.de", "alice", "secret");
//! let auth = build_auth_response(&challenge, &credential, "INVITE", "sip:10000@sipgate.de").unwrap();
//!
//! assert_eq!(auth.digest, "41cda1d00248492457dfd121874cc2b3");
//! assert!(auth.to_string().starts_with("Digest username=\"alice\""));
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CallProbeError, CallProbeResult};
use crate::signaling::{SipHeader, SipResponse};

/// Header carrying the challenge in a 407
pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
/// Header carrying our answer to the challenge
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// SIP account credentials
///
/// The password is never printed by the `Debug` implementation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub realm: String,
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(realm: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("realm", &self.realm)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Digest hash algorithms we can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    /// Lower-case hex hash of `input`
    pub fn hash(&self, input: &str) -> String {
        match self {
            Self::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CallProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("MD5") {
            Ok(Self::Md5)
        } else if s.eq_ignore_ascii_case("SHA-256") {
            Ok(Self::Sha256)
        } else {
            Err(CallProbeError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
            })
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a `Proxy-Authenticate` challenge
///
/// Parsing is lenient: fields that are absent stay `None` and are only
/// required when a response is built from the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthChallenge {
    pub scheme: String,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    /// Parse a challenge header value such as
    /// `Digest realm="example.com", nonce="abc", algorithm=MD5`
    pub fn parse(header_value: &str) -> CallProbeResult<Self> {
        let trimmed = header_value.trim();
        let (scheme, params) = match trimmed.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params.trim_start()),
            None => (trimmed, ""),
        };

        if scheme.is_empty() {
            return Err(CallProbeError::malformed_challenge("missing scheme"));
        }

        let mut challenge = AuthChallenge {
            scheme: scheme.to_string(),
            ..Default::default()
        };

        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "nonce" => challenge.nonce = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                "opaque" => challenge.opaque = Some(value),
                _ => {}
            }
        }

        Ok(challenge)
    }

    /// Extract the challenge from a 407 response
    pub fn from_response(response: &SipResponse) -> CallProbeResult<Self> {
        let value = response.header(PROXY_AUTHENTICATE).ok_or_else(|| {
            CallProbeError::malformed_challenge(format!(
                "{} response without {} header",
                response.status, PROXY_AUTHENTICATE
            ))
        })?;
        Self::parse(value)
    }
}

/// A computed `Proxy-Authorization` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub scheme: String,
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub digest: String,
    pub uri: String,
    pub opaque: Option<String>,
}

impl AuthResponse {
    pub fn to_header(&self) -> SipHeader {
        SipHeader::new(PROXY_AUTHORIZATION, self.to_string())
    }
}

impl fmt::Display for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.scheme, self.username, self.realm, self.nonce, self.uri, self.digest, self.algorithm
        )?;
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        Ok(())
    }
}

/// Compute the digest response for `challenge`
///
/// # Errors
///
/// * `MalformedChallenge` - scheme is not `Digest`, or realm/nonce is missing
/// * `UnsupportedAlgorithm` - the challenge asks for anything but MD5 or SHA-256
pub fn build_auth_response(
    challenge: &AuthChallenge,
    credential: &Credential,
    method: &str,
    uri: &str,
) -> CallProbeResult<AuthResponse> {
    if !challenge.scheme.eq_ignore_ascii_case("Digest") {
        return Err(CallProbeError::malformed_challenge(format!(
            "unsupported scheme '{}'",
            challenge.scheme
        )));
    }

    let realm = challenge
        .realm
        .as_deref()
        .ok_or_else(|| CallProbeError::malformed_challenge("missing realm"))?;
    let nonce = challenge
        .nonce
        .as_deref()
        .ok_or_else(|| CallProbeError::malformed_challenge("missing nonce"))?;
    let algorithm = match challenge.algorithm.as_deref() {
        Some(name) => name.parse()?,
        None => DigestAlgorithm::default(),
    };

    let digest = compute_digest(algorithm, &credential.user, realm, &credential.password, nonce, method, uri);

    Ok(AuthResponse {
        scheme: challenge.scheme.clone(),
        username: credential.user.clone(),
        realm: realm.to_string(),
        nonce: nonce.to_string(),
        algorithm,
        digest,
        uri: uri.to_string(),
        opaque: challenge.opaque.clone(),
    })
}

/// `H(H(user:realm:password):nonce:H(method:uri))`
pub fn compute_digest(
    algorithm: DigestAlgorithm,
    user: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = algorithm.hash(&format!("{}:{}:{}", user, realm, password));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2))
}

// Split on commas that are not inside quotes
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_NONCE: &str = "dcd98b7102dd2f0e8b11d0f600bfb0c093";

    fn mufasa() -> Credential {
        Credential::new("testrealm@host.com", "Mufasa", "Circle Of Life")
    }

    fn rfc_challenge(algorithm: Option<&str>) -> AuthChallenge {
        AuthChallenge {
            scheme: "Digest".to_string(),
            realm: Some("testrealm@host.com".to_string()),
            nonce: Some(RFC_NONCE.to_string()),
            algorithm: algorithm.map(str::to_string),
            opaque: None,
        }
    }

    #[test]
    fn parse_challenge_with_quoted_commas() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="a, b", nonce="n1", algorithm=MD5, opaque="xyz", qop="auth,auth-int""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "Digest");
        assert_eq!(challenge.realm.as_deref(), Some("a, b"));
        assert_eq!(challenge.nonce.as_deref(), Some("n1"));
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn challenge_from_response_requires_header() {
        let response = SipResponse::new(407, "Proxy Authentication Required");
        assert!(matches!(
            AuthChallenge::from_response(&response),
            Err(CallProbeError::MalformedChallenge { .. })
        ));

        let response = response.with_header("proxy-authenticate", r#"Digest realm="r", nonce="n""#);
        let challenge = AuthChallenge::from_response(&response).unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("r"));
    }

    #[test]
    fn md5_digest_matches_reference_value() {
        let auth = build_auth_response(&rfc_challenge(None), &mufasa(), "GET", "/dir/index.html").unwrap();
        assert_eq!(auth.digest, "670fd8c2df070c60b045671b8b24ff02");
        assert_eq!(auth.algorithm, DigestAlgorithm::Md5);
    }

    #[test]
    fn sha256_digest_matches_reference_value() {
        let auth =
            build_auth_response(&rfc_challenge(Some("SHA-256")), &mufasa(), "GET", "/dir/index.html").unwrap();
        assert_eq!(
            auth.digest,
            "e71f89d8267982ee1cd4dfb3637698eaf2f55848fe056aee7be175262aab5d2a"
        );
        assert!(auth.to_string().contains("algorithm=SHA-256"));
    }

    #[test]
    fn digest_is_deterministic_and_input_sensitive() {
        let challenge = rfc_challenge(Some("MD5"));
        let first = build_auth_response(&challenge, &mufasa(), "INVITE", "sip:bob@host.com").unwrap();
        let second = build_auth_response(&challenge, &mufasa(), "INVITE", "sip:bob@host.com").unwrap();
        assert_eq!(first, second);

        let other_uri = build_auth_response(&challenge, &mufasa(), "INVITE", "sip:carol@host.com").unwrap();
        assert_ne!(first.digest, other_uri.digest);

        let other_method = build_auth_response(&challenge, &mufasa(), "BYE", "sip:bob@host.com").unwrap();
        assert_ne!(first.digest, other_method.digest);
    }

    #[test]
    fn missing_fields_are_malformed() {
        let mut challenge = rfc_challenge(None);
        challenge.nonce = None;
        assert!(matches!(
            build_auth_response(&challenge, &mufasa(), "INVITE", "sip:x@y"),
            Err(CallProbeError::MalformedChallenge { .. })
        ));

        let mut challenge = rfc_challenge(None);
        challenge.realm = None;
        assert!(build_auth_response(&challenge, &mufasa(), "INVITE", "sip:x@y").is_err());

        let basic = AuthChallenge::parse(r#"Basic realm="r""#).unwrap();
        assert!(build_auth_response(&basic, &mufasa(), "INVITE", "sip:x@y").is_err());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = build_auth_response(&rfc_challenge(Some("MD5-sess")), &mufasa(), "INVITE", "sip:x@y")
            .unwrap_err();
        assert!(matches!(err, CallProbeError::UnsupportedAlgorithm { .. }));
    }

    #[test]
    fn header_renders_all_fields() {
        let mut challenge = rfc_challenge(None);
        challenge.opaque = Some("5ccc".to_string());
        let header = build_auth_response(&challenge, &mufasa(), "INVITE", "sip:bob@host.com")
            .unwrap()
            .to_header();
        assert_eq!(header.name, PROXY_AUTHORIZATION);
        for needle in [
            "Digest username=\"Mufasa\"",
            "realm=\"testrealm@host.com\"",
            "uri=\"sip:bob@host.com\"",
            "algorithm=MD5",
            "opaque=\"5ccc\"",
        ] {
            assert!(header.value.contains(needle), "missing {needle} in {}", header.value);
        }
    }

    #[test]
    fn credential_debug_hides_password() {
        let rendered = format!("{:?}", mufasa());
        assert!(!rendered.contains("Circle Of Life"));
    }
}
