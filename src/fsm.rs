//! Turn state machine - the single authority over `TurnState`
//!
//! The machine is synchronous: it consumes one [`Event`] at a time and
//! queues [`Effect`]s (timers, sampling, collaborator calls, notifications)
//! that the runner drains and executes in order. Exit effects of the old
//! state are always queued before entry effects of the new one.
//!
//! Everything asynchronous comes back tagged: results and timers with the
//! `TurnId` they were issued for (plus a sequence number for timers), levels
//! with the sampler generation. Anything that no longer matches is dropped.

use crate::activity::SpeechActivityDetector;
use crate::collaborators::{AudioHandle, SynthesisEvent, Transcript};
use crate::config::TurnConfig;
use crate::context::{ContextTracker, ConversationContext, TurnMetric};
use crate::error::{CollaboratorError, Stage, TurnError};
use crate::events::{Effect, Event, InterruptionKind, Notification, TimerKind};
use crate::interruption::InterruptionDetector;
use crate::state::{TurnId, TurnSession, TurnState};
use crate::timeout::{AdaptiveTimeoutCalculator, TimeoutBounds};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: TurnState,
    pub turn_count: u64,
    pub current_turn_id: TurnId,
    /// Offsets in ms since the session started
    pub turn_started_at_ms: Option<u64>,
    pub last_activity_at_ms: u64,
    pub context: ConversationContext,
}

/// Book-keeping for the turn in progress
#[derive(Debug, Default)]
struct TurnProgress {
    speech_started_at: Option<Instant>,
    last_voiced_at: Option<Instant>,
    speech_ended_at: Option<Instant>,
    /// Silence window chosen when speech started
    silence_timeout: Option<Duration>,
    pauses: u32,
    level_sum: f64,
    level_count: u32,
    /// Outstanding collaborator call
    awaiting: Option<Stage>,
    reply: Option<String>,
    response_ready_at: Option<Instant>,
    playback_started_at: Option<Instant>,
    synthesis_active: bool,
}

pub struct TurnFsm {
    config: TurnConfig,
    session: TurnSession,
    detector: SpeechActivityDetector,
    interruption: InterruptionDetector,
    timeouts: AdaptiveTimeoutCalculator,
    tracker: ContextTracker,
    turn: TurnProgress,

    /// Armed timers and the sequence number they were armed with
    armed: HashMap<TimerKind, u64>,
    timer_seq: u64,

    /// Current sampler generation and cadence
    sampling: Option<(u64, Duration)>,
    sampling_generation: u64,

    /// Effect queue (drained after each event)
    outbound: SmallVec<[Effect; 8]>,
}

impl TurnFsm {
    pub fn new(config: TurnConfig, now: Instant) -> Self {
        Self {
            detector: SpeechActivityDetector::new(
                config.detector.clone(),
                config.turn_end_confidence,
            ),
            interruption: InterruptionDetector::new(config.interruption_threshold),
            timeouts: AdaptiveTimeoutCalculator::new(TimeoutBounds::from_config(&config)),
            tracker: ContextTracker::default(),
            session: TurnSession::new(now),
            turn: TurnProgress::default(),
            armed: HashMap::new(),
            timer_seq: 0,
            sampling: None,
            sampling_generation: 0,
            outbound: SmallVec::new(),
            config,
        }
    }

    /// Conversation start: listen right away when auto-start is on
    pub fn start(&mut self, now: Instant) {
        info!(
            "Turn FSM started (auto start: {}, continuous: {})",
            self.config.auto_start, self.config.continuous_mode
        );
        if self.config.auto_start {
            self.transition(TurnState::Listening, now);
        }
    }

    /// Process an event and queue the resulting effects
    pub fn on_event(&mut self, event: Event, now: Instant) {
        match event {
            Event::Listen => self.listen(now),

            Event::Level { generation, sample } => self.on_level(generation, sample.level, now),

            Event::SamplingFailed { generation, error } => {
                if self.sampling.map(|(g, _)| g) == Some(generation) {
                    self.fail(TurnError::collaborator(Stage::Capture, error), now);
                } else {
                    debug!("Ignoring failure from stale sampler generation {}", generation);
                }
            }

            Event::TimerFired {
                turn_id,
                timer,
                seq,
            } => self.on_timer(turn_id, timer, seq, now),

            Event::Transcribed { turn_id, result } => self.on_transcribed(turn_id, result, now),

            Event::Generated { turn_id, result } => self.on_generated(turn_id, result, now),

            Event::Synthesis { turn_id, event } => self.on_synthesis(turn_id, event, now),

            Event::ContextTick => {
                self.tracker.refresh();
            }

            Event::Stop => self.stop(now),
        }
    }

    /// Drain all pending effects
    pub fn drain_effects(&mut self) -> SmallVec<[Effect; 8]> {
        std::mem::take(&mut self.outbound)
    }

    /// Replace the configuration. Takes effect from the next decision on.
    pub fn apply_config(&mut self, config: TurnConfig) {
        self.detector.set_end_gate(config.turn_end_confidence);
        self.interruption.set_threshold(config.interruption_threshold);
        self.timeouts.set_bounds(TimeoutBounds::from_config(&config));
        self.config = config;
        debug!("Configuration updated");
    }

    pub fn state(&self) -> TurnState {
        self.session.state()
    }

    pub fn session(&self) -> &TurnSession {
        &self.session
    }

    pub fn context(&self) -> &ConversationContext {
        self.tracker.context()
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn armed_timers(&self) -> usize {
        self.armed.len()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state(),
            turn_count: self.session.turn_count(),
            current_turn_id: self.session.current_turn_id(),
            turn_started_at_ms: self
                .session
                .turn_started_at()
                .map(|at| self.session.offset_ms(at)),
            last_activity_at_ms: self.session.offset_ms(self.session.last_activity_at()),
            context: self.tracker.context().clone(),
        }
    }

    // === Event handlers ===

    fn listen(&mut self, now: Instant) {
        match self.session.state() {
            TurnState::Idle => self.transition(TurnState::Listening, now),
            other => debug!("Listen request ignored in {}", other),
        }
    }

    /// Explicit stop: always ends in Idle with nothing armed
    fn stop(&mut self, now: Instant) {
        info!("⏹️ Stop requested in {}", self.session.state());
        if self.session.state() != TurnState::Idle {
            debug!("{}", TurnError::CancelledByUser);
            self.transition(TurnState::Idle, now);
        } else {
            self.disarm_all();
            self.stop_sampling();
        }
        self.tracker.reset();
    }

    fn on_level(&mut self, generation: u64, level: f32, now: Instant) {
        if self.sampling.map(|(g, _)| g) != Some(generation) {
            trace!("Dropping level from sampler generation {}", generation);
            return;
        }
        self.notify(Notification::AudioLevel(level));

        match self.session.state() {
            TurnState::Listening => self.on_listening_level(level, now),
            TurnState::Speaking => {
                let turn_id = self.session.current_turn_id();
                if self.interruption.observe(turn_id, level) {
                    self.on_interruption(now);
                }
            }
            _ => {}
        }
    }

    fn on_listening_level(&mut self, level: f32, now: Instant) {
        let reading = self.detector.observe(level);

        if reading.active {
            self.turn.last_voiced_at = Some(now);
            self.turn.level_sum += level as f64;
            self.turn.level_count += 1;
            self.session.touch(now);
        }

        if reading.speech_started {
            if self.turn.speech_started_at.is_none() {
                let timeout = if self.config.adaptive_silence {
                    self.timeouts.timeout(self.tracker.context())
                } else {
                    self.config.silence_timeout()
                };
                self.turn.speech_started_at = Some(now);
                self.turn.last_voiced_at = Some(now);
                self.turn.silence_timeout = Some(timeout);

                self.disarm(TimerKind::NoSpeech);
                self.arm(TimerKind::MaxSpeech, self.config.max_speech_duration());

                info!(
                    "🎤 User speech started on {} (silence window {}ms)",
                    self.session.current_turn_id(),
                    timeout.as_millis()
                );
                self.notify(Notification::UserSpeechStart);
            } else if self.armed.contains_key(&TimerKind::Silence) {
                self.disarm(TimerKind::Silence);
                self.turn.pauses += 1;
                debug!("Speech resumed after a pause ({} so far)", self.turn.pauses);
            }
        }

        if reading.end_candidate && self.turn.speech_started_at.is_some() {
            let after = self
                .turn
                .silence_timeout
                .unwrap_or_else(|| self.config.silence_timeout());
            debug!("Speech end candidate, waiting {}ms of silence", after.as_millis());
            self.arm(TimerKind::Silence, after);
        }
    }

    fn on_timer(&mut self, turn_id: TurnId, timer: TimerKind, seq: u64, now: Instant) {
        if !self.accept(turn_id, "timer") {
            return;
        }
        if self.armed.get(&timer) != Some(&seq) {
            debug!("Dropping cancelled {:?} timer (seq {})", timer, seq);
            return;
        }
        self.armed.remove(&timer);

        match (self.session.state(), timer) {
            (TurnState::Listening, TimerKind::NoSpeech) => {
                info!(
                    "⏱️ {}, back to idle",
                    TurnError::NoSpeechDetected(self.config.no_speech_timeout())
                );
                self.transition(TurnState::Idle, now);
            }
            (TurnState::Listening, TimerKind::Silence) => self.finish_utterance(now),
            (TurnState::Listening, TimerKind::MaxSpeech) => {
                info!("⏱️ Maximum speech duration reached, closing the utterance");
                self.finish_utterance(now);
            }
            (TurnState::Processing, TimerKind::CallCeiling) => {
                let stage = self.turn.awaiting.unwrap_or(Stage::Transcription);
                let error = TurnError::collaborator(
                    stage,
                    CollaboratorError::TimedOut(self.config.call_timeout()),
                );
                self.fail(error, now);
            }
            (TurnState::Speaking, TimerKind::PlaybackCeiling) => {
                let error = TurnError::collaborator(
                    Stage::Synthesis,
                    CollaboratorError::TimedOut(self.config.playback_timeout()),
                );
                self.fail(error, now);
            }
            (TurnState::Interrupted, TimerKind::InterruptionGrace) => {
                self.transition(TurnState::Listening, now);
            }
            (state, timer) => debug!("Ignoring {:?} timer in {}", timer, state),
        }
    }

    /// Silence or length cap closed the utterance
    fn finish_utterance(&mut self, now: Instant) {
        let (Some(started), Some(last_voiced)) =
            (self.turn.speech_started_at, self.turn.last_voiced_at)
        else {
            debug!("Utterance closed without confirmed speech");
            return;
        };

        let duration = last_voiced.saturating_duration_since(started);
        if duration < Duration::from_millis(self.config.min_speech_duration) {
            let noise = TurnError::InvalidTranscript {
                duration_ms: duration.as_millis() as u64,
            };
            debug!("{}; still listening", noise);
            self.disarm_all();
            self.turn = TurnProgress::default();
            self.detector.reset_speech();
            self.arm(TimerKind::NoSpeech, self.config.no_speech_timeout());
            return;
        }

        self.turn.speech_ended_at = Some(now);
        self.transition(TurnState::Processing, now);
    }

    fn on_transcribed(
        &mut self,
        turn_id: TurnId,
        result: Result<Transcript, CollaboratorError>,
        now: Instant,
    ) {
        if !self.accept(turn_id, "transcript") {
            return;
        }
        if self.session.state() != TurnState::Processing
            || self.turn.awaiting != Some(Stage::Transcription)
        {
            debug!("Unexpected transcript in {}", self.session.state());
            return;
        }
        self.turn.awaiting = None;
        self.disarm(TimerKind::CallCeiling);

        match result {
            Ok(transcript) => {
                self.notify(Notification::UserSpeechEnd {
                    transcript: transcript.text.clone(),
                    confidence: transcript.confidence,
                });
                let text = transcript.text.trim();
                if text.is_empty() {
                    info!("Empty transcript on {}, ending turn", turn_id);
                    self.end_turn(now);
                    return;
                }
                info!("📝 Transcript for {}: {:?}", turn_id, text);
                self.turn.awaiting = Some(Stage::ResponseGeneration);
                self.push(Effect::Generate {
                    turn_id,
                    transcript: text.to_string(),
                });
                self.arm(TimerKind::CallCeiling, self.config.call_timeout());
            }
            Err(e) => self.fail(TurnError::collaborator(Stage::Transcription, e), now),
        }
    }

    fn on_generated(
        &mut self,
        turn_id: TurnId,
        result: Result<String, CollaboratorError>,
        now: Instant,
    ) {
        if !self.accept(turn_id, "reply") {
            return;
        }
        if self.session.state() != TurnState::Processing
            || self.turn.awaiting != Some(Stage::ResponseGeneration)
        {
            debug!("Unexpected reply in {}", self.session.state());
            return;
        }
        self.turn.awaiting = None;
        self.disarm(TimerKind::CallCeiling);

        match result {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.is_empty() {
                    info!("Empty reply on {}, nothing to say", turn_id);
                    self.end_turn(now);
                    return;
                }
                self.turn.reply = Some(reply.to_string());
                self.turn.response_ready_at = Some(now);
                self.transition(TurnState::Speaking, now);
            }
            Err(e) => self.fail(TurnError::collaborator(Stage::ResponseGeneration, e), now),
        }
    }

    fn on_synthesis(&mut self, turn_id: TurnId, event: SynthesisEvent, now: Instant) {
        if !self.accept(turn_id, "synthesis report") {
            return;
        }
        if self.session.state() != TurnState::Speaking {
            debug!("Ignoring {:?} in {}", event, self.session.state());
            return;
        }

        match event {
            SynthesisEvent::Started => {
                if self.turn.playback_started_at.is_none() {
                    self.turn.playback_started_at = Some(now);
                }
                debug!("🔊 Playback started on {}", turn_id);
            }
            SynthesisEvent::Done | SynthesisEvent::Stopped => {
                self.turn.synthesis_active = false;
                self.notify(Notification::AiResponseEnd);
                self.record_metric(now, false);
                self.end_turn(now);
            }
            SynthesisEvent::Failed(e) => {
                self.turn.synthesis_active = false;
                self.fail(TurnError::collaborator(Stage::Synthesis, e), now);
            }
        }
    }

    fn on_interruption(&mut self, now: Instant) {
        self.notify(Notification::Interruption(InterruptionKind::User));
        self.record_metric(now, true);
        self.transition(TurnState::Interrupted, now);
    }

    // === Transitions ===

    fn transition(&mut self, to: TurnState, now: Instant) {
        let from = self.session.state();
        if from == to {
            return;
        }
        self.exit_state(from, to);
        self.session.set_state(to, now);
        info!(
            "🔄 {} -> {} ({})",
            from,
            to,
            self.session.current_turn_id()
        );
        self.notify(Notification::StateChanged { from, to });
        self.enter_state(to, now);
    }

    fn exit_state(&mut self, from: TurnState, to: TurnState) {
        self.disarm_all();
        match from {
            TurnState::Processing => {
                if self.turn.awaiting.take().is_some() {
                    self.push(Effect::CancelCalls);
                }
            }
            TurnState::Speaking => {
                self.interruption.disarm();
                if self.turn.synthesis_active {
                    self.turn.synthesis_active = false;
                    self.push(Effect::StopSpeaking);
                }
            }
            _ => {}
        }
        trace!("Exited {} towards {}", from, to);
    }

    fn enter_state(&mut self, to: TurnState, now: Instant) {
        match to {
            TurnState::Idle => {
                self.stop_sampling();
                self.session.advance_turn(now);
                self.turn = TurnProgress::default();
                self.detector.reset_speech();
            }
            TurnState::Listening => {
                let turn_id = self.session.advance_turn(now);
                self.turn = TurnProgress::default();
                self.detector.reset_speech();
                self.detector
                    .set_volume_hint(self.tracker.context().user_speech_patterns.average_volume);
                self.start_sampling(self.config.sample_interval());
                self.arm(TimerKind::NoSpeech, self.config.no_speech_timeout());
                debug!("Listening for {}", turn_id);
            }
            TurnState::Processing => {
                let turn_id = self.session.current_turn_id();
                let started = self.turn.speech_started_at.unwrap_or(now);
                let ended = self.turn.last_voiced_at.unwrap_or(now);
                let audio = AudioHandle {
                    turn_id,
                    started_at_ms: self.session.offset_ms(started),
                    ended_at_ms: self.session.offset_ms(ended),
                };
                self.turn.awaiting = Some(Stage::Transcription);
                self.push(Effect::Transcribe { turn_id, audio });
                self.arm(TimerKind::CallCeiling, self.config.call_timeout());
            }
            TurnState::Speaking => {
                let turn_id = self.session.current_turn_id();
                let text = self.turn.reply.clone().unwrap_or_default();
                self.turn.synthesis_active = true;
                self.push(Effect::Speak {
                    turn_id,
                    text: text.clone(),
                });
                self.notify(Notification::AiResponseStart { text });
                self.interruption.arm(turn_id);
                self.start_sampling(self.config.interruption_sample_interval());
                self.arm(TimerKind::PlaybackCeiling, self.config.playback_timeout());
            }
            TurnState::Interrupted => {
                self.arm(TimerKind::InterruptionGrace, self.config.interruption_grace());
            }
            TurnState::Error | TurnState::Waiting => {}
        }
    }

    /// A completed turn: back to idle, and straight into listening when continuous
    fn end_turn(&mut self, now: Instant) {
        self.transition(TurnState::Idle, now);
        if self.config.continuous_mode {
            self.transition(TurnState::Listening, now);
        }
    }

    /// Irrecoverable failure for this turn; the session survives in Idle
    fn fail(&mut self, error: TurnError, now: Instant) {
        warn!("❌ {} on {}", error, self.session.current_turn_id());
        self.transition(TurnState::Error, now);
        self.notify(Notification::Error(error));
        self.transition(TurnState::Idle, now);
    }

    fn record_metric(&mut self, now: Instant, interrupted: bool) {
        let (Some(started), Some(ended)) = (self.turn.speech_started_at, self.turn.speech_ended_at)
        else {
            return;
        };
        let last_voiced = self.turn.last_voiced_at.unwrap_or(ended);
        let ready = self.turn.response_ready_at.unwrap_or(now);
        let playback = self.turn.playback_started_at.unwrap_or(ready);

        let metric = TurnMetric {
            turn_id: self.session.current_turn_id(),
            speech_duration_ms: last_voiced.saturating_duration_since(started).as_millis() as u64,
            processing_time_ms: ready.saturating_duration_since(ended).as_millis() as u64,
            response_time_ms: playback.saturating_duration_since(ended).as_millis() as u64,
            started_at_ms: self.session.offset_ms(started),
            ended_at_ms: self.session.offset_ms(now),
            pause_count: self.turn.pauses,
            average_level: (self.turn.level_count > 0)
                .then(|| (self.turn.level_sum / self.turn.level_count as f64) as f32),
            interrupted,
        };
        self.tracker.record(metric);
        self.session.complete_turn();
    }

    // === Helpers ===

    fn accept(&self, turn_id: TurnId, what: &str) -> bool {
        if self.session.is_current(turn_id) {
            return true;
        }
        debug!(
            "Dropping stale {} for {} (current {})",
            what,
            turn_id,
            self.session.current_turn_id()
        );
        false
    }

    fn arm(&mut self, timer: TimerKind, after: Duration) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        self.armed.insert(timer, seq);
        self.push(Effect::ArmTimer {
            timer,
            turn_id: self.session.current_turn_id(),
            seq,
            after,
        });
    }

    fn disarm(&mut self, timer: TimerKind) {
        if self.armed.remove(&timer).is_some() {
            self.push(Effect::CancelTimer(timer));
        }
    }

    fn disarm_all(&mut self) {
        let timers: Vec<TimerKind> = self.armed.drain().map(|(timer, _)| timer).collect();
        for timer in timers {
            self.push(Effect::CancelTimer(timer));
        }
    }

    fn start_sampling(&mut self, interval: Duration) {
        if let Some((_, current)) = self.sampling {
            if current == interval {
                return;
            }
        }
        self.sampling_generation += 1;
        let generation = self.sampling_generation;
        self.sampling = Some((generation, interval));
        self.push(Effect::StartSampling {
            generation,
            interval,
        });
    }

    fn stop_sampling(&mut self) {
        if self.sampling.take().is_some() {
            self.push(Effect::StopSampling);
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.push(Effect::Notify(notification));
    }

    fn push(&mut self, effect: Effect) {
        self.outbound.push(effect);
    }
}
