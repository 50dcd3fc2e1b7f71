//! Media session construction
//!
//! The media engine (RTP connection, mixers, audio player, tone generator)
//! is a collaborator reached through the traits in this module. The probe
//! only wires those pieces together once the call is answered:
//!
//! ```text
//!                 ┌──────────── audio mixer ────────────┐
//!  RtpConnection ─┤ connection audio  +  player input   │  (started, playing)
//!                 └─────────────────────────────────────┘
//!                 ┌───────────── OOB mixer ─────────────┐
//!                 ┤ connection OOB    +  generator OOB  │  (generator idle)
//!                 └─────────────────────────────────────┘
//! ```
//!
//! Both paths need the connection in [`ConnectionMode::SendRecv`]; the
//! builders refuse to run before the remote descriptor has been bound and
//! the mode switched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CallProbeError, CallProbeResult};
use crate::tone::ToneGenerator;

/// Direction an RTP connection is allowed to carry media in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Inactive,
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::SendOnly => "SEND_ONLY",
            Self::RecvOnly => "RECV_ONLY",
            Self::SendRecv => "SEND_RECV",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Audio,
    OutOfBand,
}

/// Which way a mixer input carries data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentMode {
    pub send: bool,
    pub receive: bool,
}

impl ComponentMode {
    pub const SEND_RECV: Self = Self {
        send: true,
        receive: true,
    };
}

/// One input of a mixer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaComponent {
    pub id: String,
    pub kind: ComponentKind,
    pub mode: ComponentMode,
}

impl MediaComponent {
    pub fn new(id: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            mode: ComponentMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ComponentMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Local RTP endpoint of the call
pub trait RtpConnection: Send + Sync {
    fn id(&self) -> &str;

    /// Produce the SDP offer describing this endpoint
    fn generate_local_descriptor(&self) -> CallProbeResult<String>;

    /// Bind the remote party from the answer body
    fn bind_remote_descriptor(&self, descriptor: &[u8]) -> CallProbeResult<()>;

    fn set_mode(&self, mode: ConnectionMode) -> CallProbeResult<()>;

    fn mode(&self) -> ConnectionMode;

    fn audio_component(&self) -> MediaComponent;

    fn oob_component(&self) -> MediaComponent;

    fn close(&self);
}

/// Combines several components into one stream
pub trait Mixer: Send + Sync {
    fn add_component(&self, component: MediaComponent) -> CallProbeResult<()>;
    fn start(&self) -> CallProbeResult<()>;
    fn stop(&self);
    fn is_started(&self) -> bool;
}

/// Streams audio from a URL into the call
pub trait AudioPlayer: Send + Sync {
    fn set_volume(&self, level: i32);
    fn set_source_url(&self, url: &str) -> CallProbeResult<()>;
    fn audio_input(&self) -> MediaComponent;
    fn activate(&self) -> CallProbeResult<()>;
    fn start(&self) -> CallProbeResult<()>;
    fn stop(&self);
    fn is_started(&self) -> bool;
}

/// Factory for media resources
pub trait MediaEngine: Send + Sync {
    fn create_connection(&self) -> CallProbeResult<Arc<dyn RtpConnection>>;
    fn create_audio_player(&self, name: &str) -> CallProbeResult<Arc<dyn AudioPlayer>>;
    fn create_tone_generator(&self, name: &str) -> CallProbeResult<Arc<dyn ToneGenerator>>;
    fn create_audio_mixer(&self) -> Arc<dyn Mixer>;
    fn create_oob_mixer(&self) -> Arc<dyn Mixer>;
}

/// Settings for the audio and tone paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    /// Playback volume of the announcement
    pub audio_volume: i32,
    /// Announcement streamed into the call
    pub audio_source_url: String,
    /// Volume of the DTMF generator
    pub tone_volume: i32,
    /// How long each digit sounds, in milliseconds
    pub tone_duration_ms: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            audio_volume: -10,
            audio_source_url:
                "https://raw.githubusercontent.com/fnordian/mobicentstest/master/src/test/resources/ansage.wav"
                    .to_string(),
            tone_volume: -255,
            tone_duration_ms: 200,
        }
    }
}

impl MediaSettings {
    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_duration_ms)
    }
}

/// Announcement player and the mixer feeding it into the call
pub struct AudioPath {
    pub player: Arc<dyn AudioPlayer>,
    pub mixer: Arc<dyn Mixer>,
}

/// DTMF generator and the OOB mixer feeding it into the call
pub struct TonePath {
    pub generator: Arc<dyn ToneGenerator>,
    pub mixer: Arc<dyn Mixer>,
}

fn ensure_send_recv(connection: &dyn RtpConnection, operation: &str) -> CallProbeResult<()> {
    let mode = connection.mode();
    if mode != ConnectionMode::SendRecv {
        return Err(CallProbeError::InvalidConnectionMode {
            operation: operation.to_string(),
            required: ConnectionMode::SendRecv.to_string(),
            actual: mode.to_string(),
        });
    }
    Ok(())
}

/// Build the announcement path and start playing
///
/// The mixer is started before the player so no audio is produced into an
/// unmixed input.
pub fn build_audio_path(
    engine: &dyn MediaEngine,
    connection: &dyn RtpConnection,
    settings: &MediaSettings,
) -> CallProbeResult<AudioPath> {
    ensure_send_recv(connection, "audio path")?;

    let player = engine.create_audio_player("audio-generator")?;
    player.set_volume(settings.audio_volume);
    player.set_source_url(&settings.audio_source_url)?;

    let input = player.audio_input().with_mode(ComponentMode::SEND_RECV);
    let mixer = engine.create_audio_mixer();
    mixer.add_component(connection.audio_component())?;
    mixer.add_component(input)?;
    mixer.start()?;

    player.activate()?;
    player.start()?;

    debug!(connection = connection.id(), url = %settings.audio_source_url, "Audio path started");
    Ok(AudioPath { player, mixer })
}

/// Build the out-of-band tone path; the generator is left stopped
pub fn build_tone_path(
    engine: &dyn MediaEngine,
    connection: &dyn RtpConnection,
    settings: &MediaSettings,
) -> CallProbeResult<TonePath> {
    ensure_send_recv(connection, "tone path")?;

    let generator = engine.create_tone_generator("dtmf-generator")?;
    generator.set_volume(settings.tone_volume);

    let input = generator.oob_input().with_mode(ComponentMode::SEND_RECV);
    let mixer = engine.create_oob_mixer();
    mixer.add_component(connection.oob_component())?;
    mixer.add_component(input)?;
    mixer.start()?;

    debug!(connection = connection.id(), "Tone path ready");
    Ok(TonePath { generator, mixer })
}

/// All media resources bound to one answered call
///
/// Owned by the [`ConnectedCall`](crate::completion::ConnectedCall); released
/// by [`dispose`](Self::dispose), which is safe to call more than once.
pub struct MediaSession {
    connection: Arc<dyn RtpConnection>,
    audio: AudioPath,
    tone: TonePath,
    disposed: AtomicBool,
}

impl MediaSession {
    pub fn new(connection: Arc<dyn RtpConnection>, audio: AudioPath, tone: TonePath) -> Self {
        Self {
            connection,
            audio,
            tone,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<dyn RtpConnection> {
        &self.connection
    }

    pub fn audio_player(&self) -> &Arc<dyn AudioPlayer> {
        &self.audio.player
    }

    pub fn tone_generator(&self) -> &Arc<dyn ToneGenerator> {
        &self.tone.generator
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop sources, then mixers, then close the connection
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tone.generator.stop();
        self.tone.generator.set_symbol(None);
        self.audio.player.stop();
        self.tone.mixer.stop();
        self.audio.mixer.stop();
        self.connection.close();
        info!(connection = self.connection.id(), "Media session disposed");
    }
}

impl fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSession")
            .field("connection", &self.connection.id())
            .field("mode", &self.connection.mode())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackMediaEngine, MediaEvent};

    #[test]
    fn builders_refuse_connection_not_in_send_recv() {
        let engine = LoopbackMediaEngine::new();
        let connection = engine.create_connection().unwrap();
        let settings = MediaSettings::default();

        let err = build_audio_path(&engine, connection.as_ref(), &settings).err().unwrap();
        assert!(matches!(err, CallProbeError::InvalidConnectionMode { .. }));
        assert!(build_tone_path(&engine, connection.as_ref(), &settings).is_err());
    }

    #[test]
    fn audio_path_starts_mixer_and_player() {
        let engine = LoopbackMediaEngine::new();
        let connection = engine.create_connection().unwrap();
        connection.set_mode(ConnectionMode::SendRecv).unwrap();

        let path = build_audio_path(&engine, connection.as_ref(), &MediaSettings::default()).unwrap();

        assert!(path.mixer.is_started());
        assert!(path.player.is_started());
    }

    #[test]
    fn tone_path_leaves_generator_stopped() {
        let engine = LoopbackMediaEngine::new();
        let connection = engine.create_connection().unwrap();
        connection.set_mode(ConnectionMode::SendRecv).unwrap();

        let path = build_tone_path(&engine, connection.as_ref(), &MediaSettings::default()).unwrap();

        assert!(path.mixer.is_started());
        assert!(!path.generator.is_started());
    }

    #[test]
    fn dispose_releases_everything_once() {
        let engine = LoopbackMediaEngine::new();
        let connection = engine.create_connection().unwrap();
        connection.set_mode(ConnectionMode::SendRecv).unwrap();
        let settings = MediaSettings::default();
        let audio = build_audio_path(&engine, connection.as_ref(), &settings).unwrap();
        let tone = build_tone_path(&engine, connection.as_ref(), &settings).unwrap();
        let session = MediaSession::new(connection.clone(), audio, tone);

        session.dispose();
        session.dispose();

        assert!(session.is_disposed());
        assert!(!session.audio_player().is_started());
        assert_eq!(connection.mode(), ConnectionMode::Inactive);

        let stats = engine.stats();
        assert_eq!(stats.connections_closed, 1);
        let audio_mixer = stats
            .position(|e| *e == MediaEvent::MixerStopped(ComponentKind::Audio))
            .unwrap();
        let tone_mixer = stats
            .position(|e| *e == MediaEvent::MixerStopped(ComponentKind::OutOfBand))
            .unwrap();
        let closed = stats
            .position(|e| matches!(e, MediaEvent::ConnectionClosed(_)))
            .unwrap();
        assert!(tone_mixer < audio_mixer);
        assert!(audio_mixer < closed);
        let stops = stats
            .events
            .iter()
            .filter(|e| matches!(e, MediaEvent::MixerStopped(_)))
            .count();
        assert_eq!(stops, 2);
    }
}
