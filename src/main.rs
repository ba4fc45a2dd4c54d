//! Turnwise demo - runs a conversation against simulated collaborators
//!
//! Usage: `turnwise [config.json]`. The session length in seconds comes from
//! `TURNWISE_DEMO_SECS` (default 30); log verbosity from `RUST_LOG`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use turnwise::{
    AudioCapture, AudioHandle, CollaboratorError, Collaborators, InterruptionKind, LevelSink,
    ResponseGenerator, SpeechSynthesizer, SynthesisHandle, SynthesisSink, Transcriber, Transcript,
    TurnConfig, TurnEngine, TurnError, TurnObserver, TurnState,
};

/// Room noise with a burst of "speech" every twelve seconds
struct SimulatedMic {
    origin: Instant,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedMic {
    const CYCLE_MS: u64 = 12_000;
    const SPEECH_MS: (u64, u64) = (2_000, 4_500);

    fn new() -> Self {
        Self {
            origin: Instant::now(),
            task: Mutex::new(None),
        }
    }
}

impl AudioCapture for SimulatedMic {
    fn start_sampling(&self, interval: Duration, sink: LevelSink) -> Result<(), CollaboratorError> {
        let origin = self.origin;
        let task = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(sink.generation());
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let phase = origin.elapsed().as_millis() as u64 % Self::CYCLE_MS;
                let noise: f32 = rng.random_range(0.005..0.025);
                let level = if (Self::SPEECH_MS.0..Self::SPEECH_MS.1).contains(&phase) {
                    0.45 + rng.random_range(-0.1..0.1)
                } else {
                    noise
                };
                if !sink.push(level, std::time::Instant::now()) {
                    break;
                }
            }
        });
        let mut slot = self
            .task
            .lock()
            .map_err(|_| CollaboratorError::Failed("capture state poisoned".into()))?;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        Ok(())
    }

    fn stop_sampling(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

struct CannedTranscriber {
    lines: Vec<&'static str>,
    next: Mutex<usize>,
}

#[async_trait]
impl Transcriber for CannedTranscriber {
    async fn transcribe(&self, audio: AudioHandle) -> Result<Transcript, CollaboratorError> {
        sleep(Duration::from_millis(300)).await;
        let mut next = self
            .next
            .lock()
            .map_err(|_| CollaboratorError::Failed("transcriber state poisoned".into()))?;
        let text = self.lines[*next % self.lines.len()];
        *next += 1;
        info!("(transcribed {}ms of audio)", audio.duration_ms());
        Ok(Transcript {
            text: text.to_string(),
            confidence: 0.9,
        })
    }
}

struct EchoResponder;

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn generate(&self, transcript: &str) -> Result<String, CollaboratorError> {
        sleep(Duration::from_millis(600)).await;
        Ok(format!("I heard you say \"{}\".", transcript))
    }
}

fn poisoned<T>(_: T) -> CollaboratorError {
    CollaboratorError::Failed("synthesizer state poisoned".into())
}

/// Pretends to speak at roughly sixty milliseconds per character
#[derive(Default)]
struct TimedSynth {
    playing: Mutex<Vec<(SynthesisHandle, JoinHandle<()>)>>,
    next: Mutex<u64>,
}

impl SpeechSynthesizer for TimedSynth {
    fn speak(&self, text: &str, events: SynthesisSink) -> Result<SynthesisHandle, CollaboratorError> {
        let handle = {
            let mut next = self.next.lock().map_err(poisoned)?;
            *next += 1;
            SynthesisHandle(*next)
        };
        let length = Duration::from_millis(60 * text.chars().count() as u64);
        let task = tokio::spawn(async move {
            events.started();
            sleep(length).await;
            events.done();
        });
        self.playing.lock().map_err(poisoned)?.push((handle, task));
        Ok(handle)
    }

    fn stop(&self, handle: SynthesisHandle) {
        if let Ok(mut playing) = self.playing.lock() {
            playing.retain(|(h, task)| {
                if *h == handle {
                    task.abort();
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// Logs every notification except raw levels
struct LoggingObserver;

impl TurnObserver for LoggingObserver {
    fn on_state_change(&self, from: TurnState, to: TurnState) {
        info!("state: {} -> {}", from, to);
    }

    fn on_user_speech_start(&self) {
        info!("🗣️ user started speaking");
    }

    fn on_user_speech_end(&self, transcript: &str, confidence: f32) {
        info!("🗣️ user said {:?} ({:.2})", transcript, confidence);
    }

    fn on_ai_response_start(&self, text: &str) {
        info!("🤖 assistant: {}", text);
    }

    fn on_ai_response_end(&self) {
        info!("🤖 assistant finished");
    }

    fn on_interruption(&self, kind: InterruptionKind) {
        info!("🚫 interrupted by {}", kind);
    }

    fn on_error(&self, error: &TurnError) {
        warn!("turn error: {}", error);
    }
}

fn load_config() -> Result<TurnConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(TurnConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let config: TurnConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let seconds: u64 = match std::env::var("TURNWISE_DEMO_SECS") {
        Ok(v) => v.parse().context("TURNWISE_DEMO_SECS must be a number")?,
        Err(_) => 30,
    };

    let collaborators = Collaborators {
        capture: Arc::new(SimulatedMic::new()),
        transcriber: Arc::new(CannedTranscriber {
            lines: vec![
                "what time is it",
                "tell me something interesting",
                "thanks, that's all",
            ],
            next: Mutex::new(0),
        }),
        responder: Arc::new(EchoResponder),
        synthesizer: Arc::new(TimedSynth::default()),
    };

    let mut engine = TurnEngine::new(collaborators, config)?;
    engine.set_callbacks(Arc::new(LoggingObserver));

    info!("Starting demo conversation for {}s", seconds);
    let session = engine.start_conversation()?;
    sleep(Duration::from_secs(seconds)).await;

    let snapshot = session.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    engine.stop_conversation().await;
    Ok(())
}
