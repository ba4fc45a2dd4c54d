//! Audio level sampler - thin adapter over the capture collaborator
//!
//! The capture side pushes scalar levels into a [`LevelSink`]; the sink
//! sanitizes them and forwards them into the session mailbox tagged with the
//! sampler generation, so levels from a stopped or restarted sampler are
//! recognizable as stale.

use crate::collaborators::AudioCapture;
use crate::error::CollaboratorError;
use crate::events::{AudioLevelSample, Event};
use crate::runner::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace};

/// Root-mean-square level of a 16-bit PCM chunk, normalized to [0, 1]
pub fn rms_level(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = pcm
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum_sq / pcm.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

/// Where the capture collaborator delivers levels
#[derive(Debug, Clone)]
pub struct LevelSink {
    tx: UnboundedSender<Command>,
    generation: u64,
}

impl LevelSink {
    pub(crate) fn new(tx: UnboundedSender<Command>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver one level. Non-finite values are dropped, the rest clamped to
    /// [0, 1]. Returns false once the session is gone.
    pub fn push(&self, level: f32, timestamp: Instant) -> bool {
        if !level.is_finite() {
            trace!("dropping non-finite level {}", level);
            return !self.tx.is_closed();
        }
        let sample = AudioLevelSample {
            level: level.clamp(0.0, 1.0),
            timestamp,
        };
        self.tx
            .send(Command::Event(Event::Level {
                generation: self.generation,
                sample,
            }))
            .is_ok()
    }

    /// Convenience for captures that hold raw PCM
    pub fn push_pcm(&self, pcm: &[i16], timestamp: Instant) -> bool {
        self.push(rms_level(pcm), timestamp)
    }

    /// Report that capture broke down
    pub fn fail(&self, error: CollaboratorError) -> bool {
        self.tx
            .send(Command::Event(Event::SamplingFailed {
                generation: self.generation,
                error,
            }))
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Starts and stops the capture collaborator on behalf of a session
pub struct AudioLevelSampler {
    capture: Arc<dyn AudioCapture>,
    running: Option<(u64, Duration)>,
}

impl AudioLevelSampler {
    pub fn new(capture: Arc<dyn AudioCapture>) -> Self {
        Self {
            capture,
            running: None,
        }
    }

    pub(crate) fn start(
        &mut self,
        generation: u64,
        interval: Duration,
        tx: &UnboundedSender<Command>,
    ) -> Result<(), CollaboratorError> {
        if self.running == Some((generation, interval)) {
            return Ok(());
        }
        if self.running.take().is_some() {
            self.capture.stop_sampling();
        }
        self.capture
            .start_sampling(interval, LevelSink::new(tx.clone(), generation))?;
        info!(
            "🎤 Sampling levels every {}ms (generation {})",
            interval.as_millis(),
            generation
        );
        self.running = Some((generation, interval));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some((generation, _)) = self.running.take() {
            debug!("Stopping level sampling (generation {})", generation);
            self.capture.stop_sampling();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for AudioLevelSampler {
    fn drop(&mut self) {
        self.stop();
    }
}
