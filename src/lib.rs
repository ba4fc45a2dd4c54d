//! Turnwise - conversational turn-taking for voice assistants
//!
//! Decides when the user has started and finished speaking, hands the
//! utterance to a transcriber and response generator, plays the reply and
//! watches for barge-in. Audio capture, speech recognition, language model
//! and speech synthesis are collaborators supplied by the caller.

#![forbid(unsafe_code)]

pub mod activity;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod fsm;
pub mod interruption;
mod runner;
pub mod sampler;
pub mod state;
pub mod timeout;

pub use collaborators::{
    AudioCapture, AudioHandle, Collaborators, ResponseGenerator, SpeechSynthesizer,
    SynthesisEvent, SynthesisHandle, SynthesisSink, Transcriber, Transcript,
};
pub use config::{ConfigPatch, DetectorConfig, TurnConfig};
pub use context::{Complexity, ConversationContext, SpeechPatterns, TurnMetric};
pub use engine::{SessionHandle, TurnEngine};
pub use error::{CollaboratorError, ConfigError, Result, Stage, TurnError};
pub use events::{InMemoryObserver, InterruptionKind, Notification, NullObserver, TurnObserver};
pub use fsm::SessionSnapshot;
pub use sampler::LevelSink;
pub use state::{TurnId, TurnState};
