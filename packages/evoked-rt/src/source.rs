// Block sources feeding the engine
//
// `BlockSource` is the seam for acquisition clients. The synthetic source
// generates a deterministic stimulus paradigm: noisy data channels with a
// stimulus-locked damped oscillation and a pulse trigger channel appended as
// the last row.

use crate::config::AveragingConfig;
use crate::error::{AveragingError, AveragingResult};
use crate::types::SampleBlock;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Metadata about a block source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    pub channel_names: Vec<String>,

    /// Sample rate in Hz
    pub sampling_rate: f64,

    /// Row carrying stimulus markers, if the source has one
    pub trigger_channel: Option<usize>,
}

impl SourceMetadata {
    /// Default averaging settings for this layout
    pub fn averaging_config(&self) -> AveragingConfig {
        AveragingConfig {
            sampling_rate: self.sampling_rate,
            channel_names: self.channel_names.clone(),
            trigger_channels: self.trigger_channel.into_iter().collect(),
            ..AveragingConfig::default()
        }
    }
}

/// Producer of consecutive sample blocks
pub trait BlockSource: Send {
    fn metadata(&self) -> SourceMetadata;

    /// Next block, or None once the source is exhausted
    fn next_block(&mut self) -> AveragingResult<Option<SampleBlock>>;
}

/// Parameters of the synthetic stimulus paradigm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Data channels; the trigger channel is added after them
    #[serde(default = "default_data_channels")]
    pub data_channels: usize,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Samples between stimulus onsets
    #[serde(default = "default_stimulus_interval")]
    pub stimulus_interval: usize,

    /// Position of the first stimulus
    #[serde(default = "default_first_stimulus")]
    pub first_stimulus: usize,

    #[serde(default = "default_pulse_width")]
    pub pulse_width: usize,

    /// Peak of the evoked response on the first data channel
    #[serde(default = "default_response_amplitude")]
    pub response_amplitude: f64,

    #[serde(default = "default_response_frequency")]
    pub response_frequency: f64,

    /// Decay time constant of the response (seconds)
    #[serde(default = "default_response_decay")]
    pub response_decay: f64,

    /// Half-width of the uniform background noise
    #[serde(default = "default_noise_amplitude")]
    pub noise_amplitude: f64,

    /// Inject a spike into every n-th stimulus response
    #[serde(default)]
    pub artifact_every: Option<usize>,

    #[serde(default = "default_artifact_amplitude")]
    pub artifact_amplitude: f64,

    /// Stop after this many blocks
    #[serde(default)]
    pub max_blocks: Option<usize>,

    #[serde(default)]
    pub seed: u64,
}

fn default_sampling_rate() -> f64 {
    1000.0
}
fn default_data_channels() -> usize {
    4
}
fn default_block_size() -> usize {
    100
}
fn default_stimulus_interval() -> usize {
    700
}
fn default_first_stimulus() -> usize {
    350
}
fn default_pulse_width() -> usize {
    5
}
fn default_response_amplitude() -> f64 {
    10.0
}
fn default_response_frequency() -> f64 {
    10.0
}
fn default_response_decay() -> f64 {
    0.1
}
fn default_noise_amplitude() -> f64 {
    2.0
}
fn default_artifact_amplitude() -> f64 {
    500.0
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            data_channels: default_data_channels(),
            block_size: default_block_size(),
            stimulus_interval: default_stimulus_interval(),
            first_stimulus: default_first_stimulus(),
            pulse_width: default_pulse_width(),
            response_amplitude: default_response_amplitude(),
            response_frequency: default_response_frequency(),
            response_decay: default_response_decay(),
            noise_amplitude: default_noise_amplitude(),
            artifact_every: None,
            artifact_amplitude: default_artifact_amplitude(),
            max_blocks: None,
            seed: 0,
        }
    }
}

/// Deterministic stimulus-locked test signal
pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    position: u64,
    blocks_emitted: usize,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> AveragingResult<Self> {
        if config.data_channels == 0 || config.block_size == 0 {
            return Err(AveragingError::InvalidConfig(
                "synthetic source needs data channels and a non-empty block size".to_string(),
            ));
        }
        if config.stimulus_interval == 0 || config.pulse_width >= config.stimulus_interval {
            return Err(AveragingError::InvalidConfig(format!(
                "pulse width {} must be shorter than the stimulus interval {}",
                config.pulse_width, config.stimulus_interval
            )));
        }
        if !config.sampling_rate.is_finite() || config.sampling_rate <= 0.0 {
            return Err(AveragingError::InvalidConfig(
                "synthetic sampling rate must be positive".to_string(),
            ));
        }

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            position: 0,
            blocks_emitted: 0,
        })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    pub fn trigger_channel(&self) -> usize {
        self.config.data_channels
    }

    /// Onset positions of all stimuli before `end`
    pub fn stimulus_positions(&self, end: u64) -> Vec<u64> {
        let first = self.config.first_stimulus as u64;
        let step = self.config.stimulus_interval as u64;
        (0..)
            .map(|k| first + k * step)
            .take_while(|&p| p < end)
            .collect()
    }

    /// Noise-free response of `channel` at `elapsed` samples after onset
    pub fn response(&self, channel: usize, elapsed: u64) -> f64 {
        let t = elapsed as f64 / self.config.sampling_rate;
        let gain = 1.0 / (channel + 1) as f64;
        self.config.response_amplitude
            * gain
            * (-t / self.config.response_decay).exp()
            * (2.0 * PI * self.config.response_frequency * t).sin()
    }

    /// Stimulus index and samples since its onset, if any stimulus preceded
    fn stimulus_phase(&self, position: u64) -> Option<(u64, u64)> {
        let first = self.config.first_stimulus as u64;
        let step = self.config.stimulus_interval as u64;
        let since_first = position.checked_sub(first)?;
        Some((since_first / step, since_first % step))
    }
}

impl BlockSource for SyntheticSource {
    fn metadata(&self) -> SourceMetadata {
        let mut channel_names: Vec<String> = (0..self.config.data_channels)
            .map(|i| format!("EEG {:03}", i + 1))
            .collect();
        channel_names.push("STI 001".to_string());

        SourceMetadata {
            channel_names,
            sampling_rate: self.config.sampling_rate,
            trigger_channel: Some(self.trigger_channel()),
        }
    }

    fn next_block(&mut self) -> AveragingResult<Option<SampleBlock>> {
        if self
            .config
            .max_blocks
            .is_some_and(|max| self.blocks_emitted >= max)
        {
            return Ok(None);
        }

        let channels = self.config.data_channels;
        let width = self.config.block_size;
        let noise = self.config.noise_amplitude;
        let mut data = Array2::zeros((channels + 1, width));

        for col in 0..width {
            let position = self.position + col as u64;
            let phase = self.stimulus_phase(position);

            for ch in 0..channels {
                let mut value = match phase {
                    Some((_, elapsed)) => self.response(ch, elapsed),
                    None => 0.0,
                };
                if noise > 0.0 {
                    value += self.rng.random_range(-noise..noise);
                }
                data[[ch, col]] = value;
            }

            if let Some((index, elapsed)) = phase {
                if elapsed < self.config.pulse_width as u64 {
                    data[[channels, col]] = 1.0;
                }

                let spiked = self
                    .config
                    .artifact_every
                    .is_some_and(|n| n > 0 && index % n as u64 == n as u64 - 1);
                if spiked && elapsed == (self.config.stimulus_interval / 4) as u64 {
                    data[[0, col]] += self.config.artifact_amplitude;
                }
            }
        }

        let block = SampleBlock::new(data).with_sequence(self.blocks_emitted as u64);
        self.position += width as u64;
        self.blocks_emitted += 1;
        Ok(Some(block))
    }
}
