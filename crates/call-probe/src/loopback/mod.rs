//! In-process collaborators
//!
//! A scripted SIP peer ([`LoopbackUserAgent`]) and a simulated media engine
//! ([`LoopbackMediaEngine`]) implementing the probe's collaborator traits.
//! They let the whole call flow run without a network: the peer answers
//! INVITEs according to a [`PeerScript`], and the tone generator publishes
//! phase changes on tokio timers the way a media scheduler would.
//!
//! Both keep counters and an event log so tests can assert on exactly what
//! the orchestration did.

mod media;
mod signaling;

pub use media::{
    LoopbackAudioPlayer, LoopbackConnection, LoopbackMediaEngine, LoopbackMediaStats, LoopbackMixer,
    LoopbackToneGenerator, MediaEvent,
};
pub use signaling::{LoopbackCall, LoopbackStats, LoopbackUserAgent, PeerAnswer, PeerScript};
