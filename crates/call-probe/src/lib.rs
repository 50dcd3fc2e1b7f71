//! # Call Probe - End-to-end SIP call test harness
//!
//! Places a real call through an authenticating SIP proxy and checks that
//! media flows once it is answered:
//! - **initiator**: INVITE with exactly one digest retry on `407`
//! - **completion**: background wait for the answer, ACK, media setup
//! - **media**: audio announcement path and out-of-band DTMF path
//! - **tone**: DTMF sequencing driven by generator phase changes
//!
//! Signaling and media engines are collaborators behind traits
//! ([`UserAgent`], [`MediaEngine`]); the [`loopback`] module implements both
//! in process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_call_probe::loopback::{LoopbackMediaEngine, LoopbackUserAgent};
//! use rvoip_call_probe::{run_scenario, ProbeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProbeConfig::new().with_digits("123");
//!     let user_agent = LoopbackUserAgent::new(config.peer.script(&config.credential));
//!     let engine = Arc::new(LoopbackMediaEngine::new());
//!
//!     let report = run_scenario(&config, &user_agent, engine).await?;
//!     println!("{} after {} INVITE(s)", report.outcome, report.invites_sent);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod completion;
pub mod config;
pub mod error;
pub mod initiator;
pub mod logging;
pub mod loopback;
pub mod media;
pub mod scenario;
pub mod signaling;
pub mod tone;

pub use auth::{build_auth_response, AuthChallenge, AuthResponse, Credential, DigestAlgorithm};
pub use completion::{complete_call, CallOutcome, CompletionHandle, CompletionSettings, ConnectedCall};
pub use config::ProbeConfig;
pub use error::{CallProbeError, CallProbeResult};
pub use initiator::{CallInitiator, PendingCall, PendingCallState};
pub use logging::{setup_logging, LoggingConfig};
pub use media::{ConnectionMode, MediaEngine, MediaSession, MediaSettings, RtpConnection};
pub use scenario::{run_scenario, ScenarioReport};
pub use signaling::{CallLeg, InviteRequest, SipHeader, SipResponse, SipUri, UserAgent};
pub use tone::{
    play_sequence, DtmfSymbol, ToneCanceller, ToneGenerator, ToneReport, ToneSequence, ToneSequenceHandle, ToneSequencer,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
