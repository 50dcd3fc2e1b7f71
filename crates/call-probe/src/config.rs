//! Probe configuration
//!
//! Everything a probe run needs: who calls whom, with which credential, the
//! digits to send and the media settings. Loaded from TOML (all fields
//! optional) and adjusted with the `with_*` builders, which the CLI uses to
//! apply its flags on top of the file.
//!
//! ```toml
//! target = "sip:10000@sipgate.de"
//! digits = "123"
//! answer_timeout_ms = 10000
//!
//! [credential]
//! realm = "sipgate.de"
//! user = "alice"
//! password = "secret"
//!
//! [media]
//! tone_duration_ms = 200
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::Credential;
use crate::completion::CompletionSettings;
use crate::error::{CallProbeError, CallProbeResult};
use crate::loopback::PeerScript;
use crate::media::MediaSettings;
use crate::signaling::SipUri;
use crate::tone::ToneSequence;

/// Registration lifetime requested before calling, in seconds
pub const DEFAULT_REGISTER_EXPIRES: u32 = 1800;

/// Behaviour of the loopback peer used by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// 407 challenges before the peer accepts an INVITE
    pub challenges: u8,
    /// Delay before the 200 answer
    pub answer_delay_ms: u64,
    /// Verify the digest against the probe's own credential
    pub verify_credential: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            challenges: 1,
            answer_delay_ms: 500,
            verify_credential: true,
        }
    }
}

impl PeerConfig {
    /// Script for a loopback peer behaving like this config
    pub fn script(&self, credential: &Credential) -> PeerScript {
        let script = PeerScript::default()
            .with_challenges(self.challenges)
            .with_challenge_header(format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
                credential.realm,
                uuid::Uuid::new_v4().simple()
            ))
            .answer_after(Duration::from_millis(self.answer_delay_ms));
        if self.verify_credential {
            script.expecting(credential.clone())
        } else {
            script
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Callee
    pub target: String,
    /// Caller identity, also the `From` of every INVITE
    pub from: String,
    pub credential: Credential,
    /// DTMF digits sent once the call is up
    pub digits: String,
    /// Bind address; discovered from the first non-loopback interface when unset
    pub local_address: Option<IpAddr>,
    pub register_expires: u32,
    pub answer_timeout_ms: u64,
    /// How long the call is kept up after the tones started
    pub hold_ms: u64,
    pub media: MediaSettings,
    pub peer: PeerConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: "sip:10000@sipgate.de".to_string(),
            from: "sip:probe@sipgate.de".to_string(),
            credential: Credential::new("sipgate.de", "probe", "probe"),
            digits: "123".to_string(),
            local_address: None,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            answer_timeout_ms: 10_000,
            hold_ms: 2_000,
            media: MediaSettings::default(),
            peer: PeerConfig::default(),
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing fields keep their defaults
    pub fn from_toml(document: &str) -> CallProbeResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `Configuration` when it does not
    /// parse or holds invalid values.
    pub fn load(path: impl AsRef<Path>) -> CallProbeResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading probe configuration");
        let document = std::fs::read_to_string(path)?;
        Self::from_toml(&document)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_digits(mut self, digits: impl Into<String>) -> Self {
        self.digits = digits.into();
        self
    }

    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_media(mut self, media: MediaSettings) -> Self {
        self.media = media;
        self
    }

    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Check every field that is parsed later on
    pub fn validate(&self) -> CallProbeResult<()> {
        self.target_uri()?;
        self.from_uri()?;
        self.tone_sequence()?;
        if self.credential.user.is_empty() || self.credential.realm.is_empty() {
            return Err(CallProbeError::config("credential needs a user and a realm"));
        }
        if self.answer_timeout_ms == 0 {
            return Err(CallProbeError::config("answer_timeout_ms must be positive"));
        }
        if self.media.tone_duration_ms == 0 {
            return Err(CallProbeError::config("media.tone_duration_ms must be positive"));
        }
        url::Url::parse(&self.media.audio_source_url).map_err(|e| {
            CallProbeError::config(format!("media.audio_source_url '{}': {}", self.media.audio_source_url, e))
        })?;
        Ok(())
    }

    pub fn target_uri(&self) -> CallProbeResult<SipUri> {
        self.target.parse()
    }

    pub fn from_uri(&self) -> CallProbeResult<SipUri> {
        self.from.parse()
    }

    pub fn tone_sequence(&self) -> CallProbeResult<ToneSequence> {
        self.digits.parse()
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            answer_timeout: self.answer_timeout(),
            media: self.media.clone(),
        }
    }

    /// Configured bind address, or the first non-loopback IPv4 interface
    ///
    /// Falls back to 127.0.0.1 when no interface can be found.
    pub fn resolve_local_address(&self) -> IpAddr {
        if let Some(address) = self.local_address {
            return address;
        }
        match local_ip_address::local_ip() {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "No local interface address found, using loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.register_expires, 1800);
        assert_eq!(config.answer_timeout(), Duration::from_secs(10));
        assert_eq!(config.hold(), Duration::from_secs(2));
        assert_eq!(config.media.tone_duration_ms, 200);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ProbeConfig::from_toml(
            r#"
            target = "sip:4711@example.org"
            digits = "9#"

            [credential]
            realm = "example.org"
            user = "bob"
            password = "hunter2"

            [media]
            tone_duration_ms = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.target_uri().unwrap().user(), Some("4711"));
        assert_eq!(config.tone_sequence().unwrap().len(), 2);
        assert_eq!(config.credential.user, "bob");
        assert_eq!(config.media.tone_duration_ms, 120);
        assert_eq!(config.media.audio_volume, -10);
        assert_eq!(config.hold_ms, 2_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ProbeConfig::from_toml("target = \"http://example.org\""),
            Err(CallProbeError::InvalidUri { .. })
        ));
        assert!(ProbeConfig::from_toml("digits = \"12z\"").is_err());
        assert!(matches!(
            ProbeConfig::from_toml("answer_timeout_ms = 0"),
            Err(CallProbeError::Configuration { .. })
        ));
        assert!(matches!(
            ProbeConfig::from_toml("target = 5"),
            Err(CallProbeError::Configuration { .. })
        ));
    }

    #[test]
    fn builders_override_fields() {
        let address: IpAddr = "10.0.0.7".parse().unwrap();
        let config = ProbeConfig::new()
            .with_target("sip:1@example.org")
            .with_digits("42")
            .with_local_address(address)
            .with_hold(Duration::from_millis(10));

        assert_eq!(config.target, "sip:1@example.org");
        assert_eq!(config.digits, "42");
        assert_eq!(config.resolve_local_address(), address);
        assert_eq!(config.hold_ms, 10);
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = ProbeConfig::new()
            .with_answer_timeout(Duration::MAX)
            .with_hold(Duration::MAX);

        assert_eq!(config.answer_timeout_ms, u64::MAX);
        assert_eq!(config.hold_ms, u64::MAX);
    }
}
