//! Engine configuration and partial updates
//!
//! All durations are stored in milliseconds so the whole structure maps
//! one-to-one onto JSON. [`ConfigPatch`] carries the subset of options a
//! caller may change at runtime; any other field is rejected.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the speech activity detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Number of recent levels kept for threshold estimation
    pub window_size: usize,

    /// Samples required before any classification is made
    pub min_samples: usize,

    /// Lowest allowed speech threshold
    pub speech_floor: f32,

    /// Lowest allowed silence threshold
    pub silence_floor: f32,

    /// Multiplier on the window mean for the speech threshold (k1)
    pub speech_factor: f32,

    /// Multiplier on the window mean for the silence threshold (k2, below k1)
    pub silence_factor: f32,

    /// Highest value the mean-derived speech threshold may reach
    pub speech_ceiling: f32,

    /// Highest value the mean-derived silence threshold may reach
    pub silence_ceiling: f32,

    /// Start confidence that must be exceeded before speech counts as active
    pub start_gate: f32,

    /// Rise rate of the start confidence on a sample above the speech threshold
    pub start_rise: f32,

    /// Decay rate of the start confidence otherwise
    pub start_decay: f32,

    /// Rise rate of the end confidence on a sample below the silence threshold
    pub end_rise: f32,

    /// Decay rate of the end confidence on a sample above the speech threshold
    pub end_decay: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 30,      // 3 seconds at 10Hz
            min_samples: 5,       // 500ms before the first decision
            speech_floor: 0.04,
            silence_floor: 0.02,
            speech_factor: 2.0,
            silence_factor: 1.2,
            speech_ceiling: 0.3,
            silence_ceiling: 0.15,
            start_gate: 0.6,
            start_rise: 0.35,     // three consecutive hits cross the gate
            start_decay: 0.15,
            end_rise: 0.3,
            end_decay: 0.5,
        }
    }
}

/// Configuration for a conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnConfig {
    /// Base silence window (ms) before the user is considered finished
    pub silence_timeout: u64,

    /// Longest utterance (ms) before the turn is closed regardless of silence
    pub max_speech_duration: u64,

    /// Utterances shorter than this (ms) are discarded as noise
    pub min_speech_duration: u64,

    /// Level that counts as barge-in while the assistant is speaking. Sits
    /// below the detector's speech ceiling and fires on a single sample.
    pub interruption_threshold: f32,

    /// End confidence required to raise a speech-end candidate
    pub turn_end_confidence: f32,

    /// Start listening again automatically after each completed turn
    pub continuous_mode: bool,

    /// Start listening as soon as the conversation starts
    pub auto_start: bool,

    /// Size the silence window from the conversation context
    pub adaptive_silence: bool,

    /// Time (ms) to wait for any speech after entering listening
    pub no_speech_timeout: u64,

    /// Lower bound (ms) of the adaptive silence window
    pub min_timeout: u64,

    /// Upper bound (ms) of the adaptive silence window
    pub max_timeout: u64,

    /// Delay (ms) between an interruption and listening again
    pub interruption_grace: u64,

    /// Ceiling (ms) for a single transcription or generation call
    pub call_timeout: u64,

    /// Ceiling (ms) for assistant playback
    pub playback_timeout: u64,

    /// Level sampling cadence (ms) while listening
    pub sample_interval: u64,

    /// Level sampling cadence (ms) while the assistant is speaking
    pub interruption_sample_interval: u64,

    /// How often (ms) the conversation context refreshes its complexity
    pub context_refresh_interval: u64,

    pub detector: DetectorConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_timeout: 1500,
            max_speech_duration: 30_000,
            min_speech_duration: 300,
            interruption_threshold: 0.2,
            turn_end_confidence: 0.7,
            continuous_mode: true,
            auto_start: true,
            adaptive_silence: true,
            no_speech_timeout: 8000,
            min_timeout: 600,
            max_timeout: 4000,
            interruption_grace: 300,
            call_timeout: 15_000,
            playback_timeout: 120_000,
            sample_interval: 100,              // ~10Hz
            interruption_sample_interval: 50,
            context_refresh_interval: 5000,
            detector: DetectorConfig::default(),
        }
    }
}

impl TurnConfig {
    /// Apply a patch and validate the result. `self` is left untouched on error.
    pub fn merged(&self, patch: &ConfigPatch) -> Result<TurnConfig, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.silence_timeout {
            next.silence_timeout = v;
        }
        if let Some(v) = patch.max_speech_duration {
            next.max_speech_duration = v;
        }
        if let Some(v) = patch.min_speech_duration {
            next.min_speech_duration = v;
        }
        if let Some(v) = patch.interruption_threshold {
            next.interruption_threshold = v;
        }
        if let Some(v) = patch.turn_end_confidence {
            next.turn_end_confidence = v;
        }
        if let Some(v) = patch.continuous_mode {
            next.continuous_mode = v;
        }
        if let Some(v) = patch.auto_start {
            next.auto_start = v;
        }
        if let Some(v) = patch.adaptive_silence {
            next.adaptive_silence = v;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_range("interruptionThreshold", self.interruption_threshold)?;
        unit_range("turnEndConfidence", self.turn_end_confidence)?;
        unit_range("detector.startGate", self.detector.start_gate)?;
        for (field, rate) in [
            ("detector.startRise", self.detector.start_rise),
            ("detector.startDecay", self.detector.start_decay),
            ("detector.endRise", self.detector.end_rise),
            ("detector.endDecay", self.detector.end_decay),
        ] {
            unit_range(field, rate)?;
        }

        if self.silence_timeout == 0 {
            return Err(ConfigError::Inconsistent(
                "silenceTimeout must be greater than zero".into(),
            ));
        }
        if self.min_speech_duration > self.max_speech_duration {
            return Err(ConfigError::Inconsistent(format!(
                "minSpeechDuration ({}) exceeds maxSpeechDuration ({})",
                self.min_speech_duration, self.max_speech_duration
            )));
        }
        if self.min_timeout > self.max_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "minTimeout ({}) exceeds maxTimeout ({})",
                self.min_timeout, self.max_timeout
            )));
        }
        if self.sample_interval == 0 || self.interruption_sample_interval == 0 {
            return Err(ConfigError::Inconsistent(
                "sampling intervals must be greater than zero".into(),
            ));
        }
        if self.context_refresh_interval == 0 {
            return Err(ConfigError::Inconsistent(
                "contextRefreshInterval must be greater than zero".into(),
            ));
        }

        let d = &self.detector;
        if d.min_samples == 0 || d.window_size < d.min_samples {
            return Err(ConfigError::Inconsistent(format!(
                "detector window ({}) must hold at least minSamples ({}) > 0",
                d.window_size, d.min_samples
            )));
        }
        if d.speech_factor <= d.silence_factor {
            return Err(ConfigError::Inconsistent(
                "detector speechFactor must be greater than silenceFactor".into(),
            ));
        }
        if d.speech_floor <= 0.0 || d.silence_floor <= 0.0 {
            return Err(ConfigError::Inconsistent(
                "detector floors must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout)
    }

    pub fn no_speech_timeout(&self) -> Duration {
        Duration::from_millis(self.no_speech_timeout)
    }

    pub fn max_speech_duration(&self) -> Duration {
        Duration::from_millis(self.max_speech_duration)
    }

    pub fn interruption_grace(&self) -> Duration {
        Duration::from_millis(self.interruption_grace)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_millis(self.playback_timeout)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval)
    }

    pub fn interruption_sample_interval(&self) -> Duration {
        Duration::from_millis(self.interruption_sample_interval)
    }

    pub fn context_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.context_refresh_interval)
    }
}

fn unit_range(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            field,
            min: 0.0,
            max: 1.0,
            value: value as f64,
        });
    }
    Ok(())
}

/// Options a caller may change on a live engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigPatch {
    pub silence_timeout: Option<u64>,
    pub max_speech_duration: Option<u64>,
    pub min_speech_duration: Option<u64>,
    pub interruption_threshold: Option<f32>,
    pub turn_end_confidence: Option<f32>,
    pub continuous_mode: Option<bool>,
    pub auto_start: Option<bool>,
    pub adaptive_silence: Option<bool>,
}

impl ConfigPatch {
    /// Parse a JSON object, rejecting unrecognized option names
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TurnConfig::default().validate().is_ok());
    }

    #[test]
    fn test_interruption_threshold_below_speech_ceiling() {
        let cfg = TurnConfig::default();
        assert!(cfg.interruption_threshold < cfg.detector.speech_ceiling);
        assert!(cfg.interruption_threshold > cfg.detector.speech_floor);
    }

    #[test]
    fn test_patch_from_json() {
        let patch =
            ConfigPatch::from_json(r#"{"silenceTimeout": 2000, "continuousMode": false}"#).unwrap();
        assert_eq!(patch.silence_timeout, Some(2000));
        assert_eq!(patch.continuous_mode, Some(false));
        assert_eq!(patch.auto_start, None);

        let merged = TurnConfig::default().merged(&patch).unwrap();
        assert_eq!(merged.silence_timeout, 2000);
        assert!(!merged.continuous_mode);
        assert!(merged.auto_start);
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let err = ConfigPatch::from_json(r#"{"silenceTimeout": 2000, "volume": 11}"#).unwrap_err();
        match err {
            ConfigError::Parse(msg) => assert!(msg.contains("volume")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_merge_rejects_out_of_range() {
        let patch = ConfigPatch {
            interruption_threshold: Some(1.5),
            ..Default::default()
        };
        let base = TurnConfig::default();
        assert!(matches!(
            base.merged(&patch),
            Err(ConfigError::OutOfRange { field: "interruptionThreshold", .. })
        ));
    }

    #[test]
    fn test_merge_rejects_inverted_durations() {
        let patch = ConfigPatch {
            min_speech_duration: Some(5000),
            max_speech_duration: Some(1000),
            ..Default::default()
        };
        assert!(matches!(
            TurnConfig::default().merged(&patch),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_full_config_deserializes_with_defaults() {
        let cfg: TurnConfig =
            serde_json::from_str(r#"{"noSpeechTimeout": 3000, "detector": {"windowSize": 20}}"#)
                .unwrap();
        assert_eq!(cfg.no_speech_timeout, 3000);
        assert_eq!(cfg.detector.window_size, 20);
        assert_eq!(cfg.detector.min_samples, 5);
        assert_eq!(cfg.silence_timeout, 1500);
    }
}
