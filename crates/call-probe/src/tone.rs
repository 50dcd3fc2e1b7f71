//! DTMF tone sequencing over the out-of-band channel
//!
//! A [`ToneGenerator`] plays one symbol at a time and reports every phase
//! change on a channel. The [`ToneSequencer`] owns the queue of remaining
//! symbols and decides, for each notification, what the generator does next:
//!
//! ```text
//!            seed: pop, configure, start
//!   Idle ─────────────────────────────────► ActiveOn(s)
//!    ▲                                         │ started = true
//!    │ started = false, queue empty            ▼ stop, clear symbol
//!    └───────────────────────────────────── ActiveOff
//!                                              │ started = false, queue not empty
//!                                              ▼ pop, configure, reset time, start
//!                                           ActiveOn(next)
//! ```
//!
//! Every symbol costs two notifications: the stop that opens the gap and the
//! restart that plays the next symbol. A `started = false` while a symbol is
//! still sounding is a stop the sequencer did not issue; the sequence ends
//! there. The transition function is pure; the driver task applies its
//! [`ToneAction`] to the generator after the notification has been received,
//! so generator calls never run inside the generator's own notifier.
//!
//! A [`ToneCanceller`] stops the driver from outside. Once `cancel` returns
//! the driver makes no further generator calls, so the generator can be
//! stopped and released safely.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{CallProbeError, CallProbeResult};
use crate::media::MediaComponent;

/// DTMF symbol definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfSymbol {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfSymbol {
    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Digit0),
            '1' => Some(Self::Digit1),
            '2' => Some(Self::Digit2),
            '3' => Some(Self::Digit3),
            '4' => Some(Self::Digit4),
            '5' => Some(Self::Digit5),
            '6' => Some(Self::Digit6),
            '7' => Some(Self::Digit7),
            '8' => Some(Self::Digit8),
            '9' => Some(Self::Digit9),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' | 'a' => Some(Self::A),
            'B' | 'b' => Some(Self::B),
            'C' | 'c' => Some(Self::C),
            'D' | 'd' => Some(Self::D),
            _ => None,
        }
    }
}

impl fmt::Display for DtmfSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// A validated, non-empty digit sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToneSequence(VecDeque<DtmfSymbol>);

impl ToneSequence {
    pub fn parse(sequence: &str) -> CallProbeResult<Self> {
        if sequence.is_empty() {
            return Err(CallProbeError::invalid_tone_sequence(sequence, "sequence is empty"));
        }
        sequence
            .chars()
            .map(|c| {
                DtmfSymbol::from_char(c).ok_or_else(|| {
                    CallProbeError::invalid_tone_sequence(sequence, format!("'{}' is not a DTMF symbol", c))
                })
            })
            .collect::<CallProbeResult<VecDeque<_>>>()
            .map(Self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn symbols(&self) -> impl Iterator<Item = DtmfSymbol> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for ToneSequence {
    type Err = CallProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ToneSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|s| write!(f, "{}", s))
    }
}

/// Notification published by a generator whenever its phase changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChanged {
    /// Whether the generator reports itself started at the time of the change
    pub started: bool,
}

/// Out-of-band DTMF generator
///
/// Treated as a passive strategy object: the sequencer configures, starts and
/// stops it, and listens to the single [`PhaseChanged`] signal it publishes.
/// Implementations must not block in `stop` or `start` waiting for the
/// listener.
pub trait ToneGenerator: Send + Sync {
    fn set_volume(&self, level: i32);

    /// Generator output as a mixer input
    fn oob_input(&self) -> MediaComponent;

    /// Symbol played on the next start; `None` clears it
    fn set_symbol(&self, symbol: Option<DtmfSymbol>);

    fn symbol(&self) -> Option<DtmfSymbol>;

    fn set_tone_duration(&self, duration: Duration);

    /// Reset the generator timebase to zero
    fn reset_media_time(&self);

    fn activate(&self) -> CallProbeResult<()>;

    fn start(&self) -> CallProbeResult<()>;

    fn stop(&self);

    fn is_started(&self) -> bool;

    /// Register the listener receiving phase changes. Replaces any previous one.
    fn set_listener(&self, listener: mpsc::UnboundedSender<PhaseChanged>);
}

/// Where the sequencer is in the current sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Nothing playing and nothing left to play
    Idle,
    /// A symbol is sounding
    ActiveOn(DtmfSymbol),
    /// Gap between two symbols
    ActiveOff,
}

/// What the generator has to do after a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneAction {
    /// Stop the generator and clear its symbol
    Stop,
    /// Configure this symbol, reset the timebase and start
    Play(DtmfSymbol),
    /// Sequence complete
    Finish,
    /// Nothing to do
    Ignore,
}

/// State machine consuming a tone queue one symbol at a time
#[derive(Debug)]
pub struct ToneSequencer {
    queue: VecDeque<DtmfSymbol>,
    state: SequencerState,
    played: Vec<DtmfSymbol>,
    notifications: usize,
    interrupted: bool,
}

impl ToneSequencer {
    pub fn new(sequence: ToneSequence) -> Self {
        Self {
            queue: sequence.0,
            state: SequencerState::Idle,
            played: Vec::new(),
            notifications: 0,
            interrupted: false,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Symbols not yet played
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Symbols started so far, in order
    pub fn played(&self) -> &[DtmfSymbol] {
        &self.played
    }

    /// Notifications consumed so far
    pub fn notifications(&self) -> usize {
        self.notifications
    }

    /// The generator was stopped from outside while a symbol was sounding
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Pop the first symbol. Returns `None` if already seeded or the queue is empty.
    pub fn seed(&mut self) -> Option<DtmfSymbol> {
        if self.state != SequencerState::Idle || !self.played.is_empty() {
            return None;
        }
        self.pop_and_play()
    }

    /// Transition on one generator notification
    pub fn advance(&mut self, event: PhaseChanged) -> ToneAction {
        self.notifications += 1;

        if event.started {
            return match self.state {
                SequencerState::Idle => ToneAction::Ignore,
                SequencerState::ActiveOn(_) | SequencerState::ActiveOff => {
                    self.state = SequencerState::ActiveOff;
                    ToneAction::Stop
                }
            };
        }

        match self.state {
            SequencerState::Idle => ToneAction::Ignore,
            SequencerState::ActiveOn(_) => {
                self.state = SequencerState::Idle;
                self.interrupted = true;
                ToneAction::Finish
            }
            SequencerState::ActiveOff => match self.pop_and_play() {
                Some(symbol) => ToneAction::Play(symbol),
                None => {
                    self.state = SequencerState::Idle;
                    ToneAction::Finish
                }
            },
        }
    }

    fn pop_and_play(&mut self) -> Option<DtmfSymbol> {
        let symbol = self.queue.pop_front()?;
        self.state = SequencerState::ActiveOn(symbol);
        self.played.push(symbol);
        Some(symbol)
    }
}

/// Summary of a finished sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToneReport {
    /// Symbols played, in order
    pub played: String,
    /// Generator notifications consumed
    pub notifications: usize,
    /// Every symbol was played and the generator stopped by the sequencer
    pub completed: bool,
}

/// Stops a running sequence from outside its driver task
#[derive(Debug, Clone)]
pub struct ToneCanceller {
    cancelled: Arc<Mutex<bool>>,
    task: AbortHandle,
}

impl ToneCanceller {
    /// No generator call is made by the driver after this returns
    pub fn cancel(&self) {
        // Waits out an action the driver is applying right now
        *self.cancelled.lock() = true;
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }
}

/// Running tone sequence
pub struct ToneSequenceHandle {
    task: JoinHandle<CallProbeResult<ToneReport>>,
    canceller: ToneCanceller,
    generator: Arc<dyn ToneGenerator>,
}

impl ToneSequenceHandle {
    /// Wait for the last symbol to finish
    pub async fn wait(self) -> CallProbeResult<ToneReport> {
        self.task
            .await
            .map_err(|e| CallProbeError::media(format!("tone sequence task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Handle that stops the driver without consuming this one
    pub fn canceller(&self) -> ToneCanceller {
        self.canceller.clone()
    }

    /// Stop driving the sequence and silence the generator
    pub fn abort(self) {
        self.canceller.cancel();
        self.generator.stop();
        self.generator.set_symbol(None);
    }
}

/// Start playing `sequence` on `generator`
///
/// The first symbol is configured and started before this returns; the rest
/// of the sequence is driven by a spawned task reacting to the generator's
/// notifications. Must be called from within a tokio runtime.
pub fn play_sequence(
    generator: Arc<dyn ToneGenerator>,
    sequence: ToneSequence,
    tone_duration: Duration,
) -> CallProbeResult<ToneSequenceHandle> {
    let mut sequencer = ToneSequencer::new(sequence);
    let first = sequencer
        .seed()
        .ok_or_else(|| CallProbeError::invalid_tone_sequence("", "sequence is empty"))?;

    let (tx, mut rx) = mpsc::unbounded_channel();

    info!(symbol = %first, remaining = sequencer.remaining(), "Starting DTMF sequence");
    generator.set_symbol(Some(first));
    generator.set_tone_duration(tone_duration);
    generator.set_listener(tx);
    generator.activate()?;
    generator.start()?;

    let cancelled = Arc::new(Mutex::new(false));
    let gate = cancelled.clone();
    let driven = generator.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            // Held while the action is applied so a cancel cannot interleave
            let stop = gate.lock();
            if *stop {
                break;
            }

            let action = sequencer.advance(event);
            debug!(started = event.started, ?action, state = ?sequencer.state(), "DTMF generator event");

            match action {
                ToneAction::Stop => {
                    driven.stop();
                    driven.set_symbol(None);
                }
                ToneAction::Play(symbol) => {
                    debug!(symbol = %symbol, "Next DTMF symbol");
                    driven.set_symbol(Some(symbol));
                    driven.reset_media_time();
                    driven.activate()?;
                    driven.start()?;
                }
                ToneAction::Finish => break,
                ToneAction::Ignore => {}
            }
            drop(stop);
        }

        if sequencer.interrupted() {
            warn!(played = sequencer.played().len(), remaining = sequencer.remaining(), "DTMF generator stopped externally, sequence ended");
        } else if sequencer.state() != SequencerState::Idle {
            warn!(state = ?sequencer.state(), "DTMF generator went away mid-sequence");
        }

        let report = ToneReport {
            played: sequencer.played().iter().map(|s| s.to_char()).collect(),
            notifications: sequencer.notifications(),
            completed: !sequencer.interrupted()
                && sequencer.remaining() == 0
                && sequencer.state() == SequencerState::Idle,
        };
        info!(played = %report.played, completed = report.completed, "DTMF sequence finished");
        Ok::<_, CallProbeError>(report)
    });

    let canceller = ToneCanceller {
        cancelled,
        task: task.abort_handle(),
    };
    Ok(ToneSequenceHandle {
        task,
        canceller,
        generator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTED: PhaseChanged = PhaseChanged { started: true };
    const STOPPED: PhaseChanged = PhaseChanged { started: false };

    fn sequencer(digits: &str) -> ToneSequencer {
        ToneSequencer::new(ToneSequence::parse(digits).unwrap())
    }

    #[test]
    fn parse_accepts_full_alphabet() {
        let sequence = ToneSequence::parse("0123456789*#abcD").unwrap();
        assert_eq!(sequence.len(), 16);
        assert_eq!(sequence.to_string(), "0123456789*#ABCD");
    }

    #[test]
    fn parse_rejects_empty_and_foreign_symbols() {
        assert!(ToneSequence::parse("").is_err());
        assert!(matches!(
            ToneSequence::parse("12x"),
            Err(CallProbeError::InvalidToneSequence { .. })
        ));
    }

    #[test]
    fn single_symbol_takes_two_notifications() {
        let mut seq = sequencer("1");
        assert_eq!(seq.seed(), Some(DtmfSymbol::Digit1));
        assert_eq!(seq.state(), SequencerState::ActiveOn(DtmfSymbol::Digit1));
        assert_eq!(seq.remaining(), 0);

        assert_eq!(seq.advance(STARTED), ToneAction::Stop);
        assert_eq!(seq.state(), SequencerState::ActiveOff);

        assert_eq!(seq.advance(STOPPED), ToneAction::Finish);
        assert_eq!(seq.state(), SequencerState::Idle);
        assert_eq!(seq.notifications(), 2);

        // Anything after completion is ignored
        assert_eq!(seq.advance(STOPPED), ToneAction::Ignore);
        assert_eq!(seq.advance(STARTED), ToneAction::Ignore);
    }

    #[test]
    fn each_restart_plays_next_unconsumed_symbol() {
        let mut seq = sequencer("123");
        assert_eq!(seq.seed(), Some(DtmfSymbol::Digit1));

        assert_eq!(seq.advance(STARTED), ToneAction::Stop);
        assert_eq!(seq.advance(STOPPED), ToneAction::Play(DtmfSymbol::Digit2));
        assert_eq!(seq.remaining(), 1);

        assert_eq!(seq.advance(STARTED), ToneAction::Stop);
        assert_eq!(seq.advance(STOPPED), ToneAction::Play(DtmfSymbol::Digit3));
        assert_eq!(seq.remaining(), 0);

        assert_eq!(seq.advance(STARTED), ToneAction::Stop);
        assert_eq!(seq.advance(STOPPED), ToneAction::Finish);

        assert_eq!(seq.played(), &[DtmfSymbol::Digit1, DtmfSymbol::Digit2, DtmfSymbol::Digit3]);
        assert_eq!(seq.notifications(), 6);
    }

    #[test]
    fn stop_while_sounding_ends_sequence() {
        let mut seq = sequencer("1234");
        seq.seed();
        assert_eq!(seq.advance(STARTED), ToneAction::Stop);
        assert_eq!(seq.advance(STOPPED), ToneAction::Play(DtmfSymbol::Digit2));

        // Nobody asked for this stop
        assert_eq!(seq.advance(STOPPED), ToneAction::Finish);
        assert_eq!(seq.state(), SequencerState::Idle);
        assert!(seq.interrupted());
        assert_eq!(seq.remaining(), 2);
        assert_eq!(seq.played(), &[DtmfSymbol::Digit1, DtmfSymbol::Digit2]);

        assert_eq!(seq.advance(STARTED), ToneAction::Ignore);
        assert_eq!(seq.advance(STOPPED), ToneAction::Ignore);
    }

    #[test]
    fn regular_sequence_is_not_interrupted() {
        let mut seq = sequencer("1");
        seq.seed();
        seq.advance(STARTED);
        seq.advance(STOPPED);
        assert!(!seq.interrupted());
    }

    #[test]
    fn seed_only_once() {
        let mut seq = sequencer("12");
        assert!(seq.seed().is_some());
        assert!(seq.seed().is_none());
        assert_eq!(seq.remaining(), 1);
    }
}
