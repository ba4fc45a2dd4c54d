//! Events consumed by the turn state machine, the effects it emits, and the
//! notifications callers observe.

use crate::collaborators::{AudioHandle, SynthesisEvent, Transcript};
use crate::error::{CollaboratorError, TurnError};
use crate::state::{TurnId, TurnState};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One level reading from the capture collaborator, clamped to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioLevelSample {
    pub level: f32,
    pub timestamp: Instant,
}

/// Timers owned by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No speech at all since listening began
    NoSpeech,
    /// Adaptive silence window after a speech-end candidate
    Silence,
    /// Utterance length cap
    MaxSpeech,
    /// Ceiling on an outstanding transcription or generation call
    CallCeiling,
    /// Ceiling on assistant playback
    PlaybackCeiling,
    /// Delay between barge-in and listening again
    InterruptionGrace,
}

/// Inputs to the state machine, delivered one at a time
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked to start listening
    Listen,
    /// Level from the sampler started under `generation`
    Level {
        generation: u64,
        sample: AudioLevelSample,
    },
    SamplingFailed {
        generation: u64,
        error: CollaboratorError,
    },
    TimerFired {
        turn_id: TurnId,
        timer: TimerKind,
        seq: u64,
    },
    Transcribed {
        turn_id: TurnId,
        result: Result<Transcript, CollaboratorError>,
    },
    Generated {
        turn_id: TurnId,
        result: Result<String, CollaboratorError>,
    },
    Synthesis {
        turn_id: TurnId,
        event: SynthesisEvent,
    },
    /// Periodic context refresh
    ContextTick,
    Stop,
}

/// Side effects requested by the state machine, executed in order by the runner
#[derive(Debug, Clone)]
pub enum Effect {
    StartSampling { generation: u64, interval: Duration },
    StopSampling,
    ArmTimer {
        timer: TimerKind,
        turn_id: TurnId,
        seq: u64,
        after: Duration,
    },
    CancelTimer(TimerKind),
    Transcribe { turn_id: TurnId, audio: AudioHandle },
    Generate { turn_id: TurnId, transcript: String },
    Speak { turn_id: TurnId, text: String },
    StopSpeaking,
    /// Abandon every outstanding transcription/generation call
    CancelCalls,
    Notify(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionKind {
    /// The user spoke over the assistant
    User,
}

impl fmt::Display for InterruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptionKind::User => f.write_str("user"),
        }
    }
}

/// What callers get to see
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged { from: TurnState, to: TurnState },
    UserSpeechStart,
    UserSpeechEnd { transcript: String, confidence: f32 },
    AiResponseStart { text: String },
    AiResponseEnd,
    Interruption(InterruptionKind),
    AudioLevel(f32),
    Error(TurnError),
}

/// Receives session notifications. All methods default to no-ops.
///
/// Called on the session task; implementations must not block.
pub trait TurnObserver: Send + Sync {
    fn on_state_change(&self, _from: TurnState, _to: TurnState) {}
    fn on_user_speech_start(&self) {}
    fn on_user_speech_end(&self, _transcript: &str, _confidence: f32) {}
    fn on_ai_response_start(&self, _text: &str) {}
    fn on_ai_response_end(&self) {}
    fn on_interruption(&self, _kind: InterruptionKind) {}
    fn on_audio_level_update(&self, _level: f32) {}
    fn on_error(&self, _error: &TurnError) {}
}

pub type ObserverRef = Arc<dyn TurnObserver>;

/// Route a notification to the matching observer method
pub fn dispatch(observer: &dyn TurnObserver, notification: &Notification) {
    match notification {
        Notification::StateChanged { from, to } => observer.on_state_change(*from, *to),
        Notification::UserSpeechStart => observer.on_user_speech_start(),
        Notification::UserSpeechEnd {
            transcript,
            confidence,
        } => observer.on_user_speech_end(transcript, *confidence),
        Notification::AiResponseStart { text } => observer.on_ai_response_start(text),
        Notification::AiResponseEnd => observer.on_ai_response_end(),
        Notification::Interruption(kind) => observer.on_interruption(*kind),
        Notification::AudioLevel(level) => observer.on_audio_level_update(*level),
        Notification::Error(error) => observer.on_error(error),
    }
}

/// Discards everything
pub struct NullObserver;

impl TurnObserver for NullObserver {}

/// Captures every notification for later inspection
#[derive(Default)]
pub struct InMemoryObserver {
    notifications: Mutex<Vec<Notification>>,
}

impl InMemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, n: Notification) {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(n);
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Target states of every recorded transition, in order
    pub fn states(&self) -> Vec<TurnState> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Notification) -> bool) -> usize {
        self.notifications().iter().filter(|n| pred(n)).count()
    }

    pub fn clear(&self) {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl TurnObserver for InMemoryObserver {
    fn on_state_change(&self, from: TurnState, to: TurnState) {
        self.push(Notification::StateChanged { from, to });
    }

    fn on_user_speech_start(&self) {
        self.push(Notification::UserSpeechStart);
    }

    fn on_user_speech_end(&self, transcript: &str, confidence: f32) {
        self.push(Notification::UserSpeechEnd {
            transcript: transcript.to_string(),
            confidence,
        });
    }

    fn on_ai_response_start(&self, text: &str) {
        self.push(Notification::AiResponseStart {
            text: text.to_string(),
        });
    }

    fn on_ai_response_end(&self) {
        self.push(Notification::AiResponseEnd);
    }

    fn on_interruption(&self, kind: InterruptionKind) {
        self.push(Notification::Interruption(kind));
    }

    fn on_audio_level_update(&self, level: f32) {
        self.push(Notification::AudioLevel(level));
    }

    fn on_error(&self, error: &TurnError) {
        self.push(Notification::Error(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_round_trips_through_in_memory_observer() {
        let observer = InMemoryObserver::new();
        let sent = vec![
            Notification::StateChanged {
                from: TurnState::Idle,
                to: TurnState::Listening,
            },
            Notification::UserSpeechStart,
            Notification::UserSpeechEnd {
                transcript: "hello".into(),
                confidence: 0.9,
            },
            Notification::Interruption(InterruptionKind::User),
            Notification::Error(TurnError::CancelledByUser),
        ];
        for n in &sent {
            dispatch(&observer, n);
        }
        assert_eq!(observer.notifications(), sent);
        assert_eq!(observer.states(), vec![TurnState::Listening]);
        assert_eq!(
            observer.count(|n| matches!(n, Notification::Interruption(_))),
            1
        );

        observer.clear();
        assert!(observer.notifications().is_empty());
    }

    #[test]
    fn test_null_observer() {
        // Should not panic
        dispatch(&NullObserver, &Notification::AudioLevel(0.5));
    }
}
