//! Interfaces to the engines this crate coordinates but does not implement:
//! audio capture, transcription, response generation and speech synthesis.
//!
//! Implementations are handed to [`crate::TurnEngine`] at construction, so
//! tests can substitute fakes.

use crate::error::CollaboratorError;
use crate::runner::Command;
use crate::sampler::LevelSink;
use crate::events::Event;
use crate::state::TurnId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Reference to the audio captured for one utterance.
///
/// Offsets are milliseconds since the session started; the transcriber
/// resolves them against whatever buffer the capture side keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHandle {
    pub turn_id: TurnId,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
}

impl AudioHandle {
    pub fn duration_ms(&self) -> u64 {
        self.ended_at_ms.saturating_sub(self.started_at_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// Opaque playback handle returned by the synthesizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynthesisHandle(pub u64);

/// Playback lifecycle reported by the synthesizer
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started,
    Done,
    Stopped,
    Failed(CollaboratorError),
}

/// Callback channel for one `speak` call. Every report is tagged with the
/// turn it was issued for, so reports from abandoned turns are ignored.
#[derive(Debug, Clone)]
pub struct SynthesisSink {
    tx: UnboundedSender<Command>,
    turn_id: TurnId,
}

impl SynthesisSink {
    pub(crate) fn new(tx: UnboundedSender<Command>, turn_id: TurnId) -> Self {
        Self { tx, turn_id }
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Returns false once the session is gone
    pub fn report(&self, event: SynthesisEvent) -> bool {
        self.tx
            .send(Command::Event(Event::Synthesis {
                turn_id: self.turn_id,
                event,
            }))
            .is_ok()
    }

    pub fn started(&self) -> bool {
        self.report(SynthesisEvent::Started)
    }

    pub fn done(&self) -> bool {
        self.report(SynthesisEvent::Done)
    }

    pub fn stopped(&self) -> bool {
        self.report(SynthesisEvent::Stopped)
    }

    pub fn failed(&self, error: CollaboratorError) -> bool {
        self.report(SynthesisEvent::Failed(error))
    }
}

/// Produces audio levels at a requested cadence
pub trait AudioCapture: Send + Sync {
    /// Begin pushing levels into `sink` every `interval`. Replaces any
    /// previous sink.
    fn start_sampling(&self, interval: Duration, sink: LevelSink) -> Result<(), CollaboratorError>;

    fn stop_sampling(&self);
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: AudioHandle) -> Result<Transcript, CollaboratorError>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, transcript: &str) -> Result<String, CollaboratorError>;
}

pub trait SpeechSynthesizer: Send + Sync {
    /// Start playback of `text`, reporting progress through `events`
    fn speak(&self, text: &str, events: SynthesisSink) -> Result<SynthesisHandle, CollaboratorError>;

    /// Best-effort cancellation
    fn stop(&self, handle: SynthesisHandle);
}

/// The full set of collaborators a session needs
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn AudioCapture>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}
