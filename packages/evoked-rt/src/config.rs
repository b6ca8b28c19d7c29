//! Averaging configuration
//!
//! A single serde-backed struct holds every tunable of the engine. The
//! controller keeps the latest committed copy and hands immutable snapshots to
//! the windower, which tags each epoch with the snapshot in force when the
//! window opened.

use crate::error::{AveragingError, AveragingResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

/// How successive epochs are folded into the evoked estimate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AverageMode {
    /// Denominator capped at `num_averages`; refreshes on every epoch forever
    #[default]
    Running,

    /// Averages up to `num_averages` epochs, then starts a fresh cycle
    Cumulative,
}

/// Configuration of the averaging engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AveragingConfig {
    /// Sample rate of the incoming stream (Hz)
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Channel layout; its length is the row count of every block
    pub channel_names: Vec<String>,

    /// Samples kept before the trigger sample
    #[serde(default = "default_pre_stim")]
    pub pre_stim_samples: usize,

    /// Samples collected from the trigger sample onwards (trigger included)
    #[serde(default = "default_post_stim")]
    pub post_stim_samples: usize,

    #[serde(default = "default_num_averages")]
    pub num_averages: u32,

    #[serde(default)]
    pub average_mode: AverageMode,

    /// Rows scanned for triggers; order defines the composite code rank
    #[serde(default)]
    pub trigger_channels: Vec<usize>,

    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,

    #[serde(default)]
    pub artifact_rejection: bool,

    /// Absolute amplitude bound, in the units of the samples
    #[serde(default = "default_artifact_threshold")]
    pub artifact_threshold: f64,

    #[serde(default)]
    pub baseline_correction: bool,

    /// Baseline start relative to the trigger sample (may be negative)
    #[serde(default = "default_baseline_from")]
    pub baseline_from: i64,

    /// Baseline end (exclusive) relative to the trigger sample
    #[serde(default)]
    pub baseline_to: i64,
}

fn default_sampling_rate() -> f64 {
    1000.0
}
fn default_pre_stim() -> usize {
    100
}
fn default_post_stim() -> usize {
    400
}
fn default_num_averages() -> u32 {
    10
}
fn default_trigger_threshold() -> f64 {
    0.5
}
fn default_artifact_threshold() -> f64 {
    100.0
}
fn default_baseline_from() -> i64 {
    -100
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            channel_names: vec!["STI 001".to_string()],
            pre_stim_samples: default_pre_stim(),
            post_stim_samples: default_post_stim(),
            num_averages: default_num_averages(),
            average_mode: AverageMode::default(),
            trigger_channels: vec![0],
            trigger_threshold: default_trigger_threshold(),
            artifact_rejection: false,
            artifact_threshold: default_artifact_threshold(),
            baseline_correction: false,
            baseline_from: default_baseline_from(),
            baseline_to: 0,
        }
    }
}

impl AveragingConfig {
    /// Default settings for a named channel layout, triggering on `trigger_channel`
    pub fn for_layout(channel_names: Vec<String>, trigger_channel: usize) -> Self {
        Self {
            channel_names,
            trigger_channels: vec![trigger_channel],
            ..Default::default()
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    /// Columns of a complete epoch
    pub fn epoch_length(&self) -> usize {
        self.pre_stim_samples + self.post_stim_samples
    }

    /// Epoch-local columns covered by the baseline window
    pub fn baseline_columns(&self) -> Range<usize> {
        let origin = self.pre_stim_samples as i64;
        let start = (origin + self.baseline_from).max(0) as usize;
        let end = (origin + self.baseline_to).max(0) as usize;
        start..end
    }

    /// Convert milliseconds to a whole number of samples at the configured rate
    pub fn ms_to_samples(&self, ms: f64) -> i64 {
        (ms * self.sampling_rate / 1000.0).round() as i64
    }

    pub fn samples_to_ms(&self, samples: i64) -> f64 {
        samples as f64 * 1000.0 / self.sampling_rate
    }

    /// Check every invariant; the first violation is reported
    pub fn validate(&self) -> AveragingResult<()> {
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(invalid(format!(
                "sampling rate must be positive, got {}",
                self.sampling_rate
            )));
        }

        if self.channel_names.is_empty() {
            return Err(invalid("channel layout is empty".to_string()));
        }

        if self.pre_stim_samples == 0 {
            return Err(invalid("pre-stimulus samples must be > 0".to_string()));
        }

        if self.post_stim_samples == 0 {
            return Err(invalid("post-stimulus samples must be > 0".to_string()));
        }

        if self.num_averages == 0 {
            return Err(invalid("number of averages must be > 0".to_string()));
        }

        let mut seen = HashSet::new();
        for &ch in &self.trigger_channels {
            if ch >= self.num_channels() {
                return Err(invalid(format!(
                    "trigger channel {} out of range ({} channels)",
                    ch,
                    self.num_channels()
                )));
            }
            if !seen.insert(ch) {
                return Err(invalid(format!("trigger channel {} listed twice", ch)));
            }
        }

        if self.trigger_channels.len() > 32 {
            return Err(invalid(
                "at most 32 trigger channels fit in a composite code".to_string(),
            ));
        }

        if !self.trigger_threshold.is_finite() {
            return Err(invalid("trigger threshold must be finite".to_string()));
        }

        if !self.artifact_threshold.is_finite() || self.artifact_threshold <= 0.0 {
            return Err(invalid(format!(
                "artifact threshold must be positive, got {}",
                self.artifact_threshold
            )));
        }

        let lower = -(self.pre_stim_samples as i64);
        let upper = self.post_stim_samples as i64;
        for (name, value) in [("from", self.baseline_from), ("to", self.baseline_to)] {
            if value < lower || value >= upper {
                return Err(invalid(format!(
                    "baseline {} = {} outside epoch [{}, {})",
                    name, value, lower, upper
                )));
            }
        }

        if self.baseline_from >= self.baseline_to {
            return Err(invalid(format!(
                "baseline window [{}, {}) is empty",
                self.baseline_from, self.baseline_to
            )));
        }

        Ok(())
    }

    pub fn from_json_str(json: &str) -> AveragingResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> AveragingResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> AveragingResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn invalid(message: String) -> AveragingError {
    AveragingError::InvalidConfig(message)
}
