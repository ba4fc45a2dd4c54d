//! Conversation context: per-turn metrics and the running aggregates built from them

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::state::TurnId;

/// Number of completed turns kept for trend aggregation
pub const HISTORY_CAPACITY: usize = 20;

/// Average response time (ms) below which a conversation counts as simple
const SIMPLE_RESPONSE_MS: f64 = 1500.0;
/// Average response time (ms) below which a conversation counts as medium
const MEDIUM_RESPONSE_MS: f64 = 4000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn from_response_time(average_response_time_ms: f64) -> Self {
        if average_response_time_ms < SIMPLE_RESPONSE_MS {
            Complexity::Simple
        } else if average_response_time_ms < MEDIUM_RESPONSE_MS {
            Complexity::Medium
        } else {
            Complexity::Complex
        }
    }
}

/// How the user tends to speak
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechPatterns {
    pub average_duration_ms: f64,
    /// Mean number of mid-utterance pauses per turn
    pub pause_frequency: f64,
    /// Fraction of turns that ended in barge-in
    pub interruption_rate: f64,
    /// Mean level of voiced samples, unknown until a turn has been measured
    pub average_volume: Option<f32>,
}

/// Running aggregates over the recent turn history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub turn_count: u64,
    pub average_response_time_ms: f64,
    pub user_speech_patterns: SpeechPatterns,
    pub complexity: Complexity,
}

/// Measurements for one completed turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetric {
    pub turn_id: TurnId,
    pub speech_duration_ms: u64,
    /// End of user speech until the reply was ready
    pub processing_time_ms: u64,
    /// End of user speech until playback began
    pub response_time_ms: u64,
    /// Offsets from session start
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub pause_count: u32,
    pub average_level: Option<f32>,
    pub interrupted: bool,
}

/// Owns the metric history and keeps the context current
#[derive(Debug)]
pub struct ContextTracker {
    history: VecDeque<TurnMetric>,
    capacity: usize,
    context: ConversationContext,
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl ContextTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            context: ConversationContext::default(),
        }
    }

    /// Append a completed turn and recompute the moving averages
    pub fn record(&mut self, metric: TurnMetric) {
        debug!(
            "recording {}: speech {}ms, response {}ms, {} pauses{}",
            metric.turn_id,
            metric.speech_duration_ms,
            metric.response_time_ms,
            metric.pause_count,
            if metric.interrupted { ", interrupted" } else { "" }
        );
        self.history.push_back(metric);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        self.context.turn_count += 1;
        self.recompute();
    }

    fn recompute(&mut self) {
        let n = self.history.len();
        if n == 0 {
            return;
        }
        let n_f = n as f64;

        let total_response: u64 = self.history.iter().map(|m| m.response_time_ms).sum();
        let total_duration: u64 = self.history.iter().map(|m| m.speech_duration_ms).sum();
        let total_pauses: u64 = self.history.iter().map(|m| m.pause_count as u64).sum();
        let interrupted = self.history.iter().filter(|m| m.interrupted).count();

        let levels: Vec<f32> = self
            .history
            .iter()
            .filter_map(|m| m.average_level)
            .collect();
        let average_volume = if levels.is_empty() {
            None
        } else {
            Some(levels.iter().sum::<f32>() / levels.len() as f32)
        };

        self.context.average_response_time_ms = total_response as f64 / n_f;
        self.context.user_speech_patterns = SpeechPatterns {
            average_duration_ms: total_duration as f64 / n_f,
            pause_frequency: total_pauses as f64 / n_f,
            interruption_rate: interrupted as f64 / n_f,
            average_volume,
        };
    }

    /// Periodic refresh of the complexity class. Returns true when it changed.
    pub fn refresh(&mut self) -> bool {
        let next = Complexity::from_response_time(self.context.average_response_time_ms);
        if next != self.context.complexity {
            info!(
                "conversation complexity {:?} -> {:?} (avg response {:.0}ms)",
                self.context.complexity, next, self.context.average_response_time_ms
            );
            self.context.complexity = next;
            return true;
        }
        false
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn history(&self) -> impl Iterator<Item = &TurnMetric> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.context = ConversationContext::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(id: u64, speech_ms: u64, response_ms: u64) -> TurnMetric {
        TurnMetric {
            turn_id: TurnId(id),
            speech_duration_ms: speech_ms,
            processing_time_ms: response_ms / 2,
            response_time_ms: response_ms,
            started_at_ms: id * 10_000,
            ended_at_ms: id * 10_000 + speech_ms + response_ms,
            pause_count: 0,
            average_level: None,
            interrupted: false,
        }
    }

    #[test]
    fn test_moving_averages() {
        let mut tracker = ContextTracker::default();
        tracker.record(metric(1, 6000, 1000));
        tracker.record(metric(2, 7000, 2000));
        tracker.record(metric(3, 6500, 3000));

        let ctx = tracker.context();
        assert_eq!(ctx.turn_count, 3);
        assert_eq!(ctx.user_speech_patterns.average_duration_ms, 6500.0);
        assert_eq!(ctx.average_response_time_ms, 2000.0);
        assert_eq!(ctx.user_speech_patterns.average_volume, None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = ContextTracker::new(3);
        for id in 1..=5 {
            tracker.record(metric(id, id * 1000, 500));
        }
        assert_eq!(tracker.history_len(), 3);
        let ids: Vec<u64> = tracker.history().map(|m| m.turn_id.0).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        // average over the trimmed window only
        assert_eq!(tracker.context().user_speech_patterns.average_duration_ms, 4000.0);
        assert_eq!(tracker.context().turn_count, 5);
    }

    #[test]
    fn test_interruption_rate_and_pauses() {
        let mut tracker = ContextTracker::default();
        let mut first = metric(1, 2000, 800);
        first.interrupted = true;
        first.pause_count = 3;
        first.average_level = Some(0.2);
        let mut second = metric(2, 2000, 800);
        second.pause_count = 1;
        second.average_level = Some(0.4);
        tracker.record(first);
        tracker.record(second);

        let patterns = &tracker.context().user_speech_patterns;
        assert_eq!(patterns.interruption_rate, 0.5);
        assert_eq!(patterns.pause_frequency, 2.0);
        let volume = patterns.average_volume.unwrap();
        assert!((volume - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_complexity_refresh() {
        let mut tracker = ContextTracker::default();
        assert!(!tracker.refresh());
        assert_eq!(tracker.context().complexity, Complexity::Simple);

        tracker.record(metric(1, 3000, 2500));
        // aggregates move immediately, the class only on refresh
        assert_eq!(tracker.context().complexity, Complexity::Simple);
        assert!(tracker.refresh());
        assert_eq!(tracker.context().complexity, Complexity::Medium);

        tracker.record(metric(2, 3000, 9500));
        tracker.refresh();
        assert_eq!(tracker.context().complexity, Complexity::Complex);
    }

    #[test]
    fn test_reset_clears_context() {
        let mut tracker = ContextTracker::default();
        tracker.record(metric(1, 3000, 2500));
        tracker.reset();
        assert_eq!(tracker.history_len(), 0);
        assert_eq!(tracker.context(), &ConversationContext::default());
    }
}
