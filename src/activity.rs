//! Speech activity detection on scalar audio levels
//!
//! Each level is compared against thresholds derived from a sliding window of
//! recent levels. Two leaky confidence scores provide hysteresis so that a
//! single loud sample cannot start an utterance and a single quiet one cannot
//! end it.

use crate::config::DetectorConfig;
use std::collections::VecDeque;
use tracing::debug;

/// Decision boundaries recomputed on every sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityThresholds {
    pub speech: f32,
    pub silence: f32,
}

/// Hysteresis state, always within [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfidenceScore {
    pub speech_start: f32,
    pub speech_end: f32,
}

impl ConfidenceScore {
    fn clamp(&mut self) {
        self.speech_start = self.speech_start.clamp(0.0, 1.0);
        self.speech_end = self.speech_end.clamp(0.0, 1.0);
    }
}

/// How a single level compares to the current thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not enough history to decide yet
    Inconclusive,
    /// Above the speech threshold
    Speech,
    /// Below the silence threshold
    Silence,
    /// Between the two thresholds
    Ambiguous,
}

/// Result of feeding one level to the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityReading {
    pub level: f32,
    pub classification: Classification,
    pub thresholds: Option<ActivityThresholds>,
    pub confidence: ConfidenceScore,
    /// Level is above threshold and the start confidence passed its gate
    pub active: bool,
    /// First active sample of an utterance
    pub speech_started: bool,
    /// The end confidence crossed its gate while an utterance was in progress
    pub end_candidate: bool,
}

/// Compute thresholds for a window of levels.
///
/// `speech_ceiling` caps the mean-derived speech term; taking a `min` with a
/// constant keeps both thresholds non-decreasing in the window mean.
pub fn compute_thresholds(
    window: &VecDeque<f32>,
    cfg: &DetectorConfig,
    speech_ceiling: f32,
) -> Option<ActivityThresholds> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().sum::<f32>() / window.len() as f32;

    let speech = (mean * cfg.speech_factor)
        .min(speech_ceiling)
        .max(cfg.speech_floor);
    let silence = (mean * cfg.silence_factor)
        .min(cfg.silence_ceiling)
        .max(cfg.silence_floor)
        .min(speech);

    Some(ActivityThresholds { speech, silence })
}

/// Adaptive-threshold speech detector
#[derive(Debug)]
pub struct SpeechActivityDetector {
    cfg: DetectorConfig,
    /// End confidence required for an end candidate
    end_gate: f32,
    window: VecDeque<f32>,
    confidence: ConfidenceScore,
    thresholds: Option<ActivityThresholds>,
    in_speech: bool,
    /// Ceiling learned from the speaker's average voiced level
    volume_ceiling: Option<f32>,
}

impl SpeechActivityDetector {
    pub fn new(cfg: DetectorConfig, end_gate: f32) -> Self {
        let capacity = cfg.window_size;
        Self {
            cfg,
            end_gate,
            window: VecDeque::with_capacity(capacity),
            confidence: ConfidenceScore::default(),
            thresholds: None,
            in_speech: false,
            volume_ceiling: None,
        }
    }

    /// Feed one level and classify it
    pub fn observe(&mut self, level: f32) -> ActivityReading {
        if self.window.len() == self.cfg.window_size {
            self.window.pop_front();
        }
        self.window.push_back(level);

        if self.window.len() < self.cfg.min_samples {
            return ActivityReading {
                level,
                classification: Classification::Inconclusive,
                thresholds: None,
                confidence: self.confidence,
                active: false,
                speech_started: false,
                end_candidate: false,
            };
        }

        let Some(thresholds) = compute_thresholds(&self.window, &self.cfg, self.speech_ceiling())
        else {
            // unreachable with a non-empty window
            return ActivityReading {
                level,
                classification: Classification::Inconclusive,
                thresholds: None,
                confidence: self.confidence,
                active: false,
                speech_started: false,
                end_candidate: false,
            };
        };
        self.thresholds = Some(thresholds);

        let classification = if level > thresholds.speech {
            Classification::Speech
        } else if level <= thresholds.silence {
            Classification::Silence
        } else {
            Classification::Ambiguous
        };

        let c = &mut self.confidence;
        match classification {
            Classification::Speech => {
                c.speech_start += self.cfg.start_rise * (1.0 - c.speech_start);
                c.speech_end *= 1.0 - self.cfg.end_decay;
            }
            Classification::Silence => {
                c.speech_start *= 1.0 - self.cfg.start_decay;
                c.speech_end += self.cfg.end_rise * (1.0 - c.speech_end);
            }
            Classification::Ambiguous | Classification::Inconclusive => {
                c.speech_start *= 1.0 - self.cfg.start_decay;
                c.speech_end *= 1.0 - self.cfg.start_decay;
            }
        }
        c.clamp();

        let active =
            classification == Classification::Speech && c.speech_start > self.cfg.start_gate;

        let mut speech_started = false;
        let mut end_candidate = false;
        if active && !self.in_speech {
            self.in_speech = true;
            c.speech_end = 0.0;
            speech_started = true;
            debug!(
                "speech start (level {:.3} > {:.3}, confidence {:.2})",
                level, thresholds.speech, c.speech_start
            );
        } else if self.in_speech && !active && c.speech_end >= self.end_gate {
            self.in_speech = false;
            end_candidate = true;
            debug!(
                "speech end candidate (level {:.3}, end confidence {:.2})",
                level, c.speech_end
            );
        }

        ActivityReading {
            level,
            classification,
            thresholds: Some(thresholds),
            confidence: *c,
            active,
            speech_started,
            end_candidate,
        }
    }

    fn speech_ceiling(&self) -> f32 {
        match self.volume_ceiling {
            Some(v) => self.cfg.speech_ceiling.min(v),
            None => self.cfg.speech_ceiling,
        }
    }

    /// Use the speaker's average voiced level to keep quiet voices detectable
    pub fn set_volume_hint(&mut self, average_volume: Option<f32>) {
        self.volume_ceiling = average_volume
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(|v| v * 0.5);
    }

    /// Update the end-candidate gate (turn end confidence)
    pub fn set_end_gate(&mut self, end_gate: f32) {
        self.end_gate = end_gate;
    }

    /// Forget utterance state but keep the level history
    pub fn reset_speech(&mut self) {
        self.confidence = ConfidenceScore::default();
        self.in_speech = false;
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.window.clear();
        self.thresholds = None;
        self.reset_speech();
    }

    pub fn thresholds(&self) -> Option<ActivityThresholds> {
        self.thresholds
    }

    pub fn confidence(&self) -> ConfidenceScore {
        self.confidence
    }

    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> SpeechActivityDetector {
        SpeechActivityDetector::new(DetectorConfig::default(), 0.7)
    }

    fn feed(det: &mut SpeechActivityDetector, level: f32, n: usize) -> Vec<ActivityReading> {
        (0..n).map(|_| det.observe(level)).collect()
    }

    #[test]
    fn test_inconclusive_until_min_samples() {
        let mut det = detector();
        let readings = feed(&mut det, 0.9, 4);
        for r in &readings {
            assert_eq!(r.classification, Classification::Inconclusive);
            assert!(!r.active);
            assert!(r.thresholds.is_none());
        }
        assert_eq!(det.confidence(), ConfidenceScore::default());

        let fifth = det.observe(0.9);
        assert_ne!(fifth.classification, Classification::Inconclusive);
    }

    #[test]
    fn test_threshold_monotonic_in_mean() {
        let cfg = DetectorConfig::default();
        let mut previous = 0.0f32;
        for step in 0..=100 {
            let mean = step as f32 / 100.0;
            let window: VecDeque<f32> = std::iter::repeat(mean).take(10).collect();
            let t = compute_thresholds(&window, &cfg, cfg.speech_ceiling).unwrap();
            assert!(t.speech >= previous, "speech threshold dropped at mean {}", mean);
            assert!(t.speech >= cfg.speech_floor);
            assert!(t.silence <= t.speech);
            assert!(t.silence >= cfg.silence_floor.min(t.speech));
            previous = t.speech;
        }
    }

    #[test]
    fn test_empty_window_has_no_thresholds() {
        let cfg = DetectorConfig::default();
        assert!(compute_thresholds(&VecDeque::new(), &cfg, cfg.speech_ceiling).is_none());
    }

    #[test]
    fn test_single_spike_does_not_start_speech() {
        let mut det = detector();
        feed(&mut det, 0.02, 10);
        assert_eq!(det.confidence().speech_start, 0.0);

        let spike = det.observe(0.8);
        assert_eq!(spike.classification, Classification::Speech);
        assert!(!spike.active);
        assert!(!spike.speech_started);

        // back to silence: nothing happens
        let after = feed(&mut det, 0.02, 5);
        assert!(after.iter().all(|r| !r.speech_started));
    }

    #[test]
    fn test_consecutive_samples_cross_gate() {
        let mut det = detector();
        feed(&mut det, 0.02, 5);
        let readings = feed(&mut det, 0.6, 3);
        assert!(!readings[0].speech_started);
        assert!(!readings[1].speech_started);
        assert!(readings[2].speech_started);
        assert!(readings[2].active);
    }

    #[test]
    fn test_scenario_silence_speech_silence() {
        let mut det = detector();

        let silence = feed(&mut det, 0.02, 20);
        assert!(silence.iter().all(|r| !r.speech_started && !r.active));

        let speech = feed(&mut det, 0.6, 10);
        let first = speech.iter().position(|r| r.speech_started).unwrap();
        assert!((2..=4).contains(&first), "speech started at sample {}", first + 1);
        assert_eq!(speech.iter().filter(|r| r.speech_started).count(), 1);
        assert!(speech[first..].iter().all(|r| r.active));

        let tail = feed(&mut det, 0.01, 25);
        assert_eq!(tail.iter().filter(|r| r.end_candidate).count(), 1);
        assert!(tail.iter().all(|r| !r.speech_started));
        assert!(!det.in_speech());
    }

    #[test]
    fn test_sustained_speech_stays_active() {
        let mut det = detector();
        feed(&mut det, 0.02, 5);
        let readings = feed(&mut det, 0.5, 60);
        assert!(readings[10..].iter().all(|r| r.active));
        assert!(readings.iter().all(|r| !r.end_candidate));
    }

    #[test]
    fn test_confidence_stays_clamped() {
        let mut det = detector();
        for i in 0..200 {
            let level = if i % 7 < 4 { 1.0 } else { 0.0 };
            let r = det.observe(level);
            assert!((0.0..=1.0).contains(&r.confidence.speech_start));
            assert!((0.0..=1.0).contains(&r.confidence.speech_end));
        }
    }

    #[test]
    fn test_volume_hint_lowers_speech_threshold() {
        let mut det = detector();
        feed(&mut det, 0.2, 30);
        let loud_room = det.thresholds().unwrap().speech;

        det.set_volume_hint(Some(0.3));
        det.observe(0.2);
        let hinted = det.thresholds().unwrap().speech;
        assert!(hinted < loud_room);
        assert!((hinted - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_reset_speech_keeps_window() {
        let mut det = detector();
        feed(&mut det, 0.02, 5);
        feed(&mut det, 0.6, 4);
        assert!(det.in_speech());

        det.reset_speech();
        assert!(!det.in_speech());
        assert_eq!(det.window_len(), 9);

        det.clear();
        assert_eq!(det.window_len(), 0);
    }
}
