//! Asynchronous call completion
//!
//! Once the INVITE has been accepted by the proxy, the rest of call setup
//! runs on a worker task so the caller is free to do other work:
//!
//! 1. wait (bounded) for the 200 answer
//! 2. ACK it
//! 3. bind the answer SDP to the local RTP connection and switch it to `SEND_RECV`
//! 4. build the audio path and the (stopped) tone path
//!
//! The task never fails outright. Every way it can end is a [`CallOutcome`]
//! variant; callers that only care whether a call came up use
//! [`CompletionHandle::connected`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{CallProbeError, CallProbeResult};
use crate::initiator::{PendingCall, PendingCallState};
use crate::media::{
    build_audio_path, build_tone_path, AudioPlayer, ConnectionMode, MediaEngine, MediaSession, MediaSettings,
    RtpConnection,
};
use crate::signaling::{status, SipResponse};
use crate::tone::{play_sequence, ToneCanceller, ToneGenerator, ToneSequence, ToneSequenceHandle};

/// Settings for the completion task
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    /// How long to wait for the 200 answer
    pub answer_timeout: Duration,
    pub media: MediaSettings,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(10),
            media: MediaSettings::default(),
        }
    }
}

/// An answered call with its media session
///
/// Disposal is transitive: [`dispose`](Self::dispose) cancels a running tone
/// sequence, releases the media session and then the signaling dialog.
pub struct ConnectedCall {
    call: PendingCall,
    session: MediaSession,
    answer: SipResponse,
    tone_duration: Duration,
    tones: Mutex<Option<ToneCanceller>>,
}

impl ConnectedCall {
    pub fn call(&self) -> &PendingCall {
        &self.call
    }

    pub fn call_id(&self) -> &str {
        self.call.call_id()
    }

    pub fn session(&self) -> &MediaSession {
        &self.session
    }

    pub fn rtp_connection(&self) -> &Arc<dyn RtpConnection> {
        self.session.connection()
    }

    /// The DTMF generator, not started until a sequence is played
    pub fn tone_generator(&self) -> &Arc<dyn ToneGenerator> {
        self.session.tone_generator()
    }

    pub fn audio_player(&self) -> &Arc<dyn AudioPlayer> {
        self.session.audio_player()
    }

    /// The 200 response that answered the call
    pub fn answer(&self) -> &SipResponse {
        &self.answer
    }

    /// Play `sequence` on this call's tone generator
    ///
    /// A sequence still running from an earlier call is cancelled first.
    pub fn play_tones(&self, sequence: ToneSequence) -> CallProbeResult<ToneSequenceHandle> {
        let mut running = self.tones.lock();
        if let Some(previous) = running.take() {
            previous.cancel();
        }
        let handle = play_sequence(self.tone_generator().clone(), sequence, self.tone_duration)?;
        *running = Some(handle.canceller());
        Ok(handle)
    }

    /// Cancel any tone sequence, release the media session, then the call
    pub async fn dispose(self) {
        let running = self.tones.lock().take();
        if let Some(tones) = running {
            tones.cancel();
        }
        self.session.dispose();
        self.call.dispose().await;
    }
}

impl fmt::Debug for ConnectedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedCall")
            .field("call", &self.call)
            .field("session", &self.session)
            .finish()
    }
}

/// A call that never reached a usable media session
///
/// Handed back so the caller can still dispose the dialog and the connection.
pub struct UnconnectedCall {
    pub call: PendingCall,
    pub connection: Arc<dyn RtpConnection>,
}

impl UnconnectedCall {
    pub async fn dispose(self) {
        self.connection.close();
        self.call.dispose().await;
    }
}

impl fmt::Debug for UnconnectedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnconnectedCall")
            .field("call", &self.call)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// How the completion task ended
#[derive(Debug)]
pub enum CallOutcome {
    /// 200 received, acknowledged, media session up
    Answered(ConnectedCall),
    /// No answer within the timeout
    TimedOut(UnconnectedCall),
    /// A final non-2xx response ended the call
    Rejected { status: u16, call: UnconnectedCall },
    /// The answer arrived but acknowledging it or building media failed.
    /// `call` is `None` only when the task itself died.
    SetupFailed {
        reason: String,
        call: Option<UnconnectedCall>,
    },
}

impl CallOutcome {
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Answered(_) => "answered",
            Self::TimedOut(_) => "timed_out",
            Self::Rejected { .. } => "rejected",
            Self::SetupFailed { .. } => "setup_failed",
        }
    }

    /// The connected call, if any. Leftovers of a failed call are dropped undisposed.
    pub fn into_connected(self) -> Option<ConnectedCall> {
        match self {
            Self::Answered(call) => Some(call),
            _ => None,
        }
    }
}

/// Handle to a running completion task
pub struct CompletionHandle {
    task: JoinHandle<CallOutcome>,
}

impl CompletionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the tagged outcome
    pub async fn outcome(self) -> CallOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Call completion task died");
                CallOutcome::SetupFailed {
                    reason: format!("completion task failed: {}", e),
                    call: None,
                }
            }
        }
    }

    /// Wait for the outcome and keep only a connected call
    ///
    /// Leftovers of a call that did not connect are disposed here.
    pub async fn connected(self) -> Option<ConnectedCall> {
        match self.outcome().await {
            CallOutcome::Answered(call) => Some(call),
            CallOutcome::TimedOut(call)
            | CallOutcome::Rejected { call, .. }
            | CallOutcome::SetupFailed { call: Some(call), .. } => {
                call.dispose().await;
                None
            }
            CallOutcome::SetupFailed { call: None, .. } => None,
        }
    }
}

/// Spawn the completion task for `pending`
///
/// Returns immediately. Must be called from within a tokio runtime.
pub fn complete_call(
    pending: PendingCall,
    connection: Arc<dyn RtpConnection>,
    engine: Arc<dyn MediaEngine>,
    settings: CompletionSettings,
) -> CompletionHandle {
    let span = info_span!("complete_call", call_id = %pending.call_id());
    let task = tokio::spawn(run_completion(pending, connection, engine, settings).instrument(span));
    CompletionHandle { task }
}

async fn run_completion(
    mut pending: PendingCall,
    connection: Arc<dyn RtpConnection>,
    engine: Arc<dyn MediaEngine>,
    settings: CompletionSettings,
) -> CallOutcome {
    let answered = pending.leg_mut().wait_for_answer(settings.answer_timeout).await;

    let Some(answer) = pending.leg().find_response(status::OK) else {
        let last = pending.leg().last_response();
        let leftover = UnconnectedCall {
            call: pending,
            connection,
        };
        return match last {
            Some(response) if response.is_final() => {
                warn!(response = %response, "Call rejected");
                CallOutcome::Rejected {
                    status: response.status,
                    call: leftover,
                }
            }
            _ => {
                warn!(timeout_ms = settings.answer_timeout.as_millis() as u64, "No answer");
                CallOutcome::TimedOut(leftover)
            }
        };
    };

    if !answered {
        warn!("Answer wait reported no answer but a 200 is on record, continuing");
    }

    match establish_media(&mut pending, &answer, &connection, engine.as_ref(), &settings.media).await {
        Ok(session) => {
            pending.set_state(PendingCallState::Answered);
            info!(connection = connection.id(), "Call connected");
            CallOutcome::Answered(ConnectedCall {
                call: pending,
                session,
                answer,
                tone_duration: settings.media.tone_duration(),
                tones: Mutex::new(None),
            })
        }
        Err(e) => {
            error!(error = %e, "Call setup failed after answer");
            pending.set_state(PendingCallState::Failed);
            CallOutcome::SetupFailed {
                reason: e.to_string(),
                call: Some(UnconnectedCall {
                    call: pending,
                    connection,
                }),
            }
        }
    }
}

async fn establish_media(
    pending: &mut PendingCall,
    answer: &SipResponse,
    connection: &Arc<dyn RtpConnection>,
    engine: &dyn MediaEngine,
    settings: &MediaSettings,
) -> CallProbeResult<MediaSession> {
    pending.leg_mut().send_ack().await?;

    if answer.body.is_empty() {
        return Err(CallProbeError::media("answer carries no session description"));
    }
    connection.bind_remote_descriptor(&answer.body)?;
    connection.set_mode(ConnectionMode::SendRecv)?;

    let audio = build_audio_path(engine, connection.as_ref(), settings)?;
    let tone = match build_tone_path(engine, connection.as_ref(), settings) {
        Ok(tone) => tone,
        Err(e) => {
            audio.player.stop();
            audio.mixer.stop();
            return Err(e);
        }
    };

    Ok(MediaSession::new(connection.clone(), audio, tone))
}
