//! Simulated media engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{CallProbeError, CallProbeResult};
use crate::media::{
    AudioPlayer, ComponentKind, ConnectionMode, MediaComponent, MediaEngine, Mixer, RtpConnection,
};
use crate::tone::{DtmfSymbol, PhaseChanged, ToneGenerator};

/// Something the engine was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    ConnectionCreated(String),
    RemoteBound(String),
    ModeSet(ConnectionMode),
    PlayerCreated,
    PlayerStarted,
    GeneratorCreated,
    MixerStarted(ComponentKind),
    MixerStopped(ComponentKind),
    ConnectionClosed(String),
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackMediaStats {
    pub connections_created: usize,
    pub connections_closed: usize,
    pub events: Vec<MediaEvent>,
}

impl LoopbackMediaStats {
    /// Position of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&MediaEvent) -> bool) -> Option<usize> {
        self.events.iter().position(pred)
    }
}

type SharedStats = Arc<Mutex<LoopbackMediaStats>>;

fn record(stats: &SharedStats, event: MediaEvent) {
    trace!(?event, "Loopback media event");
    stats.lock().events.push(event);
}

/// Media engine backed by in-memory resources and tokio timers
#[derive(Default)]
pub struct LoopbackMediaEngine {
    stats: SharedStats,
    generators: Mutex<Vec<Arc<LoopbackToneGenerator>>>,
    fail_tone_generator: bool,
}

impl LoopbackMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every tone generator allocation fail
    pub fn failing_tone_generator(mut self) -> Self {
        self.fail_tone_generator = true;
        self
    }

    pub fn stats(&self) -> LoopbackMediaStats {
        self.stats.lock().clone()
    }

    /// Generators handed out so far
    pub fn tone_generators(&self) -> Vec<Arc<LoopbackToneGenerator>> {
        self.generators.lock().clone()
    }
}

impl MediaEngine for LoopbackMediaEngine {
    fn create_connection(&self) -> CallProbeResult<Arc<dyn RtpConnection>> {
        let connection = LoopbackConnection::new(self.stats.clone());
        {
            let mut stats = self.stats.lock();
            stats.connections_created += 1;
            stats.events.push(MediaEvent::ConnectionCreated(connection.id.clone()));
        }
        Ok(Arc::new(connection))
    }

    fn create_audio_player(&self, name: &str) -> CallProbeResult<Arc<dyn AudioPlayer>> {
        record(&self.stats, MediaEvent::PlayerCreated);
        Ok(Arc::new(LoopbackAudioPlayer::new(name, self.stats.clone())))
    }

    fn create_tone_generator(&self, name: &str) -> CallProbeResult<Arc<dyn ToneGenerator>> {
        if self.fail_tone_generator {
            return Err(CallProbeError::resource_unavailable(name));
        }
        record(&self.stats, MediaEvent::GeneratorCreated);
        let generator = Arc::new(LoopbackToneGenerator::new(name));
        self.generators.lock().push(generator.clone());
        Ok(generator)
    }

    fn create_audio_mixer(&self) -> Arc<dyn Mixer> {
        Arc::new(LoopbackMixer::new(ComponentKind::Audio, self.stats.clone()))
    }

    fn create_oob_mixer(&self) -> Arc<dyn Mixer> {
        Arc::new(LoopbackMixer::new(ComponentKind::OutOfBand, self.stats.clone()))
    }
}

/// RTP connection that only tracks its configuration
pub struct LoopbackConnection {
    id: String,
    mode: Mutex<ConnectionMode>,
    remote: Mutex<Option<String>>,
    closed: AtomicBool,
    stats: SharedStats,
}

impl LoopbackConnection {
    fn new(stats: SharedStats) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            mode: Mutex::new(ConnectionMode::Inactive),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    /// Remote SDP bound to this connection
    pub fn remote_descriptor(&self) -> Option<String> {
        self.remote.lock().clone()
    }
}

impl RtpConnection for LoopbackConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_local_descriptor(&self) -> CallProbeResult<String> {
        Ok(format!(
            "v=0\r\n\
o=- {id} 1 IN IP4 127.0.0.1\r\n\
s=call-probe\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 8 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n\
a=sendrecv\r\n",
            id = self.id
        ))
    }

    fn bind_remote_descriptor(&self, descriptor: &[u8]) -> CallProbeResult<()> {
        let sdp = std::str::from_utf8(descriptor)
            .map_err(|e| CallProbeError::media(format!("remote descriptor is not UTF-8: {}", e)))?;
        if !sdp.starts_with("v=0") {
            return Err(CallProbeError::media("remote descriptor is not SDP"));
        }
        *self.remote.lock() = Some(sdp.to_string());
        record(&self.stats, MediaEvent::RemoteBound(self.id.clone()));
        Ok(())
    }

    fn set_mode(&self, mode: ConnectionMode) -> CallProbeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallProbeError::media("connection closed"));
        }
        *self.mode.lock() = mode;
        record(&self.stats, MediaEvent::ModeSet(mode));
        Ok(())
    }

    fn mode(&self) -> ConnectionMode {
        *self.mode.lock()
    }

    fn audio_component(&self) -> MediaComponent {
        MediaComponent::new(format!("{}-audio", self.id), ComponentKind::Audio)
    }

    fn oob_component(&self) -> MediaComponent {
        MediaComponent::new(format!("{}-oob", self.id), ComponentKind::OutOfBand)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.mode.lock() = ConnectionMode::Inactive;
        let mut stats = self.stats.lock();
        stats.connections_closed += 1;
        stats.events.push(MediaEvent::ConnectionClosed(self.id.clone()));
    }
}

pub struct LoopbackMixer {
    kind: ComponentKind,
    components: Mutex<Vec<MediaComponent>>,
    started: AtomicBool,
    stats: SharedStats,
}

impl LoopbackMixer {
    fn new(kind: ComponentKind, stats: SharedStats) -> Self {
        Self {
            kind,
            components: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stats,
        }
    }

    pub fn components(&self) -> Vec<MediaComponent> {
        self.components.lock().clone()
    }
}

impl Mixer for LoopbackMixer {
    fn add_component(&self, component: MediaComponent) -> CallProbeResult<()> {
        if component.kind != self.kind {
            return Err(CallProbeError::media(format!(
                "{:?} component cannot join a {:?} mixer",
                component.kind, self.kind
            )));
        }
        self.components.lock().push(component);
        Ok(())
    }

    fn start(&self) -> CallProbeResult<()> {
        if self.components.lock().is_empty() {
            return Err(CallProbeError::resource_unavailable("mixer has no components"));
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            record(&self.stats, MediaEvent::MixerStarted(self.kind));
        }
        Ok(())
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            record(&self.stats, MediaEvent::MixerStopped(self.kind));
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct PlayerState {
    volume: i32,
    url: Option<String>,
    activated: bool,
    started: bool,
}

pub struct LoopbackAudioPlayer {
    name: String,
    state: Mutex<PlayerState>,
    stats: SharedStats,
}

impl LoopbackAudioPlayer {
    fn new(name: &str, stats: SharedStats) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(PlayerState::default()),
            stats,
        }
    }

    pub fn volume(&self) -> i32 {
        self.state.lock().volume
    }

    pub fn source_url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }
}

impl AudioPlayer for LoopbackAudioPlayer {
    fn set_volume(&self, level: i32) {
        self.state.lock().volume = level;
    }

    fn set_source_url(&self, url: &str) -> CallProbeResult<()> {
        url::Url::parse(url).map_err(|e| CallProbeError::media(format!("malformed source URL '{}': {}", url, e)))?;
        self.state.lock().url = Some(url.to_string());
        Ok(())
    }

    fn audio_input(&self) -> MediaComponent {
        MediaComponent::new(format!("{}-input", self.name), ComponentKind::Audio)
    }

    fn activate(&self) -> CallProbeResult<()> {
        let mut state = self.state.lock();
        if state.url.is_none() {
            return Err(CallProbeError::resource_unavailable("audio player without source"));
        }
        state.activated = true;
        Ok(())
    }

    fn start(&self) -> CallProbeResult<()> {
        {
            let mut state = self.state.lock();
            if !state.activated {
                return Err(CallProbeError::media("audio player started before activation"));
            }
            state.started = true;
        }
        record(&self.stats, MediaEvent::PlayerStarted);
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.started = false;
        state.activated = false;
    }

    fn is_started(&self) -> bool {
        self.state.lock().started
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    volume: i32,
    symbol: Option<DtmfSymbol>,
    duration: Duration,
    activated: bool,
    started: bool,
    // Bumped on every start so a stale duration timer cannot fire
    generation: u64,
    listener: Option<mpsc::UnboundedSender<PhaseChanged>>,
    played: Vec<DtmfSymbol>,
    notifications: usize,
    media_time_resets: usize,
}

/// DTMF generator driven by tokio timers
///
/// `start` plays the configured symbol; when the tone duration elapses the
/// generator publishes `started = true`. `stop` publishes `started = false`.
/// Notifications are sent after the internal lock is released.
pub struct LoopbackToneGenerator {
    name: String,
    state: Arc<Mutex<GeneratorState>>,
}

impl LoopbackToneGenerator {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(GeneratorState {
                duration: Duration::from_millis(200),
                ..Default::default()
            })),
        }
    }

    /// Symbols started so far, in order
    pub fn played(&self) -> Vec<DtmfSymbol> {
        self.state.lock().played.clone()
    }

    /// Notifications published so far
    pub fn notifications(&self) -> usize {
        self.state.lock().notifications
    }

    pub fn volume(&self) -> i32 {
        self.state.lock().volume
    }

    pub fn media_time_resets(&self) -> usize {
        self.state.lock().media_time_resets
    }

    fn notify(state: &Mutex<GeneratorState>, started: bool) {
        let listener = {
            let mut state = state.lock();
            state.notifications += 1;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            let _ = listener.send(PhaseChanged { started });
        }
    }
}

impl ToneGenerator for LoopbackToneGenerator {
    fn set_volume(&self, level: i32) {
        self.state.lock().volume = level;
    }

    fn oob_input(&self) -> MediaComponent {
        MediaComponent::new(format!("{}-oob", self.name), ComponentKind::OutOfBand)
    }

    fn set_symbol(&self, symbol: Option<DtmfSymbol>) {
        self.state.lock().symbol = symbol;
    }

    fn symbol(&self) -> Option<DtmfSymbol> {
        self.state.lock().symbol
    }

    fn set_tone_duration(&self, duration: Duration) {
        self.state.lock().duration = duration;
    }

    fn reset_media_time(&self) {
        self.state.lock().media_time_resets += 1;
    }

    fn activate(&self) -> CallProbeResult<()> {
        self.state.lock().activated = true;
        Ok(())
    }

    fn start(&self) -> CallProbeResult<()> {
        let (generation, duration) = {
            let mut state = self.state.lock();
            if !state.activated {
                return Err(CallProbeError::media("tone generator started before activation"));
            }
            let symbol = state
                .symbol
                .ok_or_else(|| CallProbeError::media("tone generator has no symbol"))?;
            state.started = true;
            state.generation += 1;
            state.played.push(symbol);
            debug!(generator = %self.name, %symbol, "Tone on");
            (state.generation, state.duration)
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let still_playing = {
                let state = state.lock();
                state.started && state.generation == generation
            };
            if still_playing {
                Self::notify(&state, true);
            }
        });
        Ok(())
    }

    fn stop(&self) {
        let was_started = {
            let mut state = self.state.lock();
            let was_started = state.started;
            state.started = false;
            state.activated = false;
            was_started
        };
        if was_started {
            debug!(generator = %self.name, "Tone off");
            Self::notify(&self.state, false);
        }
    }

    fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn set_listener(&self, listener: mpsc::UnboundedSender<PhaseChanged>) {
        self.state.lock().listener = Some(listener);
    }
}
