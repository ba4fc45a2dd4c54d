//! Session runner - connects collaborators, timers and the caller to the FSM
//!
//! One task per conversation. Every input (levels, timer firings,
//! collaborator results, caller commands) arrives through a single mailbox,
//! so the FSM sees a totally ordered event stream. The task ends only on
//! `Command::Stop`.

use crate::collaborators::{Collaborators, SynthesisEvent, SynthesisHandle, SynthesisSink};
use crate::config::TurnConfig;
use crate::events::{dispatch, Effect, Event, ObserverRef, TimerKind};
use crate::fsm::{SessionSnapshot, TurnFsm};
use crate::sampler::AudioLevelSampler;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Mailbox messages of a session task
pub(crate) enum Command {
    Event(Event),
    UpdateConfig(TurnConfig),
    SetObserver(ObserverRef),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Stop(oneshot::Sender<()>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Event(e) => f.debug_tuple("Event").field(e).finish(),
            Command::UpdateConfig(_) => f.write_str("UpdateConfig"),
            Command::SetObserver(_) => f.write_str("SetObserver"),
            Command::Snapshot(_) => f.write_str("Snapshot"),
            Command::Stop(_) => f.write_str("Stop"),
        }
    }
}

/// Spawn a session task. Returns its mailbox and join handle.
pub(crate) fn spawn(
    collaborators: Collaborators,
    config: TurnConfig,
    observer: ObserverRef,
) -> (UnboundedSender<Command>, JoinHandle<()>) {
    static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
    let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);

    let (tx, rx) = mpsc::unbounded_channel();
    let runner = SessionRunner::new(collaborators, config, observer, tx.clone());
    let task = tokio::spawn(runner.run(rx).instrument(info_span!("session", id)));
    (tx, task)
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn refresh_interval(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

struct SessionRunner {
    fsm: TurnFsm,
    collaborators: Collaborators,
    sampler: AudioLevelSampler,
    observer: ObserverRef,
    tx: UnboundedSender<Command>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    /// Cancels outstanding transcription/generation calls
    calls: CancellationToken,
    playback: Option<SynthesisHandle>,
}

impl SessionRunner {
    fn new(
        collaborators: Collaborators,
        config: TurnConfig,
        observer: ObserverRef,
        tx: UnboundedSender<Command>,
    ) -> Self {
        Self {
            fsm: TurnFsm::new(config, now()),
            sampler: AudioLevelSampler::new(collaborators.capture.clone()),
            collaborators,
            observer,
            tx,
            timers: HashMap::new(),
            calls: CancellationToken::new(),
            playback: None,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        let mut period = self.fsm.config().context_refresh_interval();
        let mut refresh = refresh_interval(period);

        info!("Session started");
        self.fsm.start(now());
        self.apply_effects();

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    self.fsm.on_event(Event::ContextTick, now());
                    self.apply_effects();
                }

                Some(cmd) = rx.recv() => {
                    match cmd {
                        Command::Event(event) => {
                            self.fsm.on_event(event, now());
                            self.apply_effects();
                        }
                        Command::UpdateConfig(config) => {
                            let next = config.context_refresh_interval();
                            self.fsm.apply_config(config);
                            if next != period {
                                period = next;
                                refresh = refresh_interval(period);
                            }
                        }
                        Command::SetObserver(observer) => {
                            self.observer = observer;
                        }
                        Command::Snapshot(reply) => {
                            let _ = reply.send(self.fsm.snapshot());
                        }
                        Command::Stop(ack) => {
                            self.fsm.on_event(Event::Stop, now());
                            self.apply_effects();
                            self.shutdown();
                            rx.close();
                            let _ = ack.send(());
                            info!("Session stopped");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Execute queued effects in order
    fn apply_effects(&mut self) {
        for effect in self.fsm.drain_effects() {
            match effect {
                Effect::StartSampling {
                    generation,
                    interval,
                } => {
                    if let Err(error) = self.sampler.start(generation, interval, &self.tx) {
                        warn!("Failed to start sampling: {}", error);
                        let _ = self
                            .tx
                            .send(Command::Event(Event::SamplingFailed { generation, error }));
                    }
                }

                Effect::StopSampling => self.sampler.stop(),

                Effect::ArmTimer {
                    timer,
                    turn_id,
                    seq,
                    after,
                } => {
                    self.cancel_timer(timer);
                    let tx = self.tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Command::Event(Event::TimerFired {
                            turn_id,
                            timer,
                            seq,
                        }));
                    });
                    self.timers.insert(timer, handle);
                }

                Effect::CancelTimer(timer) => self.cancel_timer(timer),

                Effect::Transcribe { turn_id, audio } => {
                    let transcriber = self.collaborators.transcriber.clone();
                    let token = self.calls.clone();
                    let tx = self.tx.clone();
                    debug!("📤 Transcribing {}ms of audio for {}", audio.duration_ms(), turn_id);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!("Transcription for {} abandoned", turn_id);
                            }
                            result = transcriber.transcribe(audio) => {
                                let _ = tx.send(Command::Event(Event::Transcribed { turn_id, result }));
                            }
                        }
                    });
                }

                Effect::Generate {
                    turn_id,
                    transcript,
                } => {
                    let responder = self.collaborators.responder.clone();
                    let token = self.calls.clone();
                    let tx = self.tx.clone();
                    debug!("📤 Requesting reply for {}", turn_id);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {
                                debug!("Generation for {} abandoned", turn_id);
                            }
                            result = responder.generate(&transcript) => {
                                let _ = tx.send(Command::Event(Event::Generated { turn_id, result }));
                            }
                        }
                    });
                }

                Effect::Speak { turn_id, text } => {
                    let sink = SynthesisSink::new(self.tx.clone(), turn_id);
                    match self.collaborators.synthesizer.speak(&text, sink) {
                        Ok(handle) => self.playback = Some(handle),
                        Err(error) => {
                            warn!("Synthesizer refused {}: {}", turn_id, error);
                            let _ = self.tx.send(Command::Event(Event::Synthesis {
                                turn_id,
                                event: SynthesisEvent::Failed(error),
                            }));
                        }
                    }
                }

                Effect::StopSpeaking => {
                    if let Some(handle) = self.playback.take() {
                        debug!("🔇 Stopping playback {:?}", handle);
                        self.collaborators.synthesizer.stop(handle);
                    }
                }

                Effect::CancelCalls => {
                    self.calls.cancel();
                    self.calls = CancellationToken::new();
                }

                Effect::Notify(notification) => dispatch(self.observer.as_ref(), &notification),
            }
        }
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        if let Some(handle) = self.timers.remove(&timer) {
            handle.abort();
        }
    }

    /// Release everything the session holds
    fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.calls.cancel();
        self.sampler.stop();
        if let Some(handle) = self.playback.take() {
            self.collaborators.synthesizer.stop(handle);
        }
    }
}
