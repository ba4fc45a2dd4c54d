//! Adaptive silence timeout
//!
//! `timeout = base × volume × pattern × history`, clamped to the configured
//! bounds. Each multiplier is neutral (1.0) until the context has evidence.

use crate::config::TurnConfig;
use crate::context::ConversationContext;
use std::time::Duration;
use tracing::debug;

/// Completed turns required before speech duration history is trusted
pub const MIN_HISTORY_TURNS: u64 = 3;

/// Average speech duration (ms) above which a speaker counts as verbose
const VERBOSE_SPEECH_MS: f64 = 5000.0;
/// Average speech duration (ms) below which a speaker counts as terse
const TERSE_SPEECH_MS: f64 = 2000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutBounds {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimeoutBounds {
    pub fn from_config(cfg: &TurnConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.silence_timeout),
            min: Duration::from_millis(cfg.min_timeout),
            max: Duration::from_millis(cfg.max_timeout),
        }
    }
}

/// The factors behind one timeout decision, kept for logging and tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutBreakdown {
    pub volume: f64,
    pub pattern: f64,
    pub history: f64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AdaptiveTimeoutCalculator {
    bounds: TimeoutBounds,
}

impl AdaptiveTimeoutCalculator {
    pub fn new(bounds: TimeoutBounds) -> Self {
        Self { bounds }
    }

    pub fn set_bounds(&mut self, bounds: TimeoutBounds) {
        self.bounds = bounds;
    }

    pub fn bounds(&self) -> TimeoutBounds {
        self.bounds
    }

    pub fn timeout(&self, ctx: &ConversationContext) -> Duration {
        self.breakdown(ctx).timeout
    }

    pub fn breakdown(&self, ctx: &ConversationContext) -> TimeoutBreakdown {
        let volume = volume_multiplier(ctx);
        let pattern = pattern_multiplier(ctx);
        let history = history_multiplier(ctx);

        let raw_ms = self.bounds.base.as_millis() as f64 * volume * pattern * history;
        let min_ms = self.bounds.min.as_millis() as f64;
        let max_ms = self.bounds.max.as_millis() as f64;
        let clamped = if raw_ms.is_finite() {
            raw_ms.max(min_ms).min(max_ms)
        } else {
            max_ms
        };
        let timeout = Duration::from_millis(clamped.round() as u64);

        debug!(
            "silence timeout {}ms (volume x{:.2}, pattern x{:.2}, history x{:.2})",
            timeout.as_millis(),
            volume,
            pattern,
            history
        );

        TimeoutBreakdown {
            volume,
            pattern,
            history,
            timeout,
        }
    }
}

/// Quiet speakers get longer windows, loud speakers shorter ones
pub fn volume_multiplier(ctx: &ConversationContext) -> f64 {
    match ctx.user_speech_patterns.average_volume {
        Some(v) if v.is_finite() => {
            let v = v as f64;
            if v < 0.1 {
                1.3
            } else if v < 0.2 {
                1.15
            } else if v > 0.6 {
                0.85
            } else if v > 0.4 {
                0.95
            } else {
                1.0
            }
        }
        _ => 1.0,
    }
}

/// Speakers who pause a lot mid-utterance get longer windows
pub fn pattern_multiplier(ctx: &ConversationContext) -> f64 {
    let pauses = ctx.user_speech_patterns.pause_frequency;
    if !pauses.is_finite() || pauses <= 0.0 {
        return 1.0;
    }
    1.0 + 0.1 * pauses.min(5.0)
}

/// Verbose speakers get longer windows, terse speakers shorter ones
pub fn history_multiplier(ctx: &ConversationContext) -> f64 {
    if ctx.turn_count < MIN_HISTORY_TURNS {
        return 1.0;
    }
    let avg = ctx.user_speech_patterns.average_duration_ms;
    if !avg.is_finite() {
        return 1.0;
    }
    if avg > VERBOSE_SPEECH_MS {
        1.0 + ((avg - VERBOSE_SPEECH_MS) / 10_000.0).min(0.5)
    } else if avg < TERSE_SPEECH_MS {
        1.0 - ((TERSE_SPEECH_MS - avg) / TERSE_SPEECH_MS * 0.2).min(0.2)
    } else {
        1.0
    }
}
