// Common types for the averaging engine

use crate::buffer::BufferMetrics;
use crate::config::AveragingConfig;
use crate::error::{AveragingError, AveragingResult};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One block of multichannel samples as delivered by an acquisition source
///
/// Rows are channels, columns are consecutive samples. The stream position of
/// the first column is implicit: it is the number of samples consumed before
/// this block.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    data: Array2<f64>,
    sequence: u64,
}

impl SampleBlock {
    pub fn new(data: Array2<f64>) -> Self {
        Self { data, sequence: 0 }
    }

    /// Build a block from per-channel sample vectors
    pub fn from_channel_rows(rows: &[Vec<f64>]) -> AveragingResult<Self> {
        let num_channels = rows.len();
        if num_channels == 0 {
            return Err(AveragingError::MalformedBlock(
                "block has no channels".to_string(),
            ));
        }

        let num_samples = rows[0].len();
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != num_samples)
        {
            return Err(AveragingError::MalformedBlock(format!(
                "channel {} has {} samples, expected {}",
                idx,
                row.len(),
                num_samples
            )));
        }

        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let data = Array2::from_shape_vec((num_channels, num_samples), flat)
            .map_err(|e| AveragingError::MalformedBlock(e.to_string()))?;

        Ok(Self::new(data))
    }

    /// Widen single-precision acquisition data
    pub fn from_f32(data: &Array2<f32>) -> Self {
        Self::new(data.mapv(f64::from))
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    pub fn num_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Sequence number assigned by the controller on append
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl From<Array2<f64>> for SampleBlock {
    fn from(data: Array2<f64>) -> Self {
        Self::new(data)
    }
}

/// A single rising-edge crossing on one trigger channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub channel_index: usize,
    pub offset: usize,
    pub position: u64,
    pub amplitude: f64,
}

/// All crossings at one sample folded into a single digital marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeTrigger {
    pub offset: usize,
    pub position: u64,
    /// Sum of `2^rank` over the crossed channels, rank being the position in
    /// the configured trigger list
    pub code: u32,
}

/// A completed stimulus-locked window of `pre + post` samples
#[derive(Debug, Clone)]
pub struct Epoch {
    data: Array2<f64>,
    trigger_position: u64,
    trigger_code: u32,
    config: Arc<AveragingConfig>,
}

impl Epoch {
    pub fn new(
        data: Array2<f64>,
        trigger_position: u64,
        trigger_code: u32,
        config: Arc<AveragingConfig>,
    ) -> AveragingResult<Self> {
        let expected_cols = config.epoch_length();
        if data.ncols() != expected_cols {
            return Err(AveragingError::MalformedBlock(format!(
                "epoch has {} samples, expected {}",
                data.ncols(),
                expected_cols
            )));
        }
        if data.nrows() != config.num_channels() {
            return Err(AveragingError::ChannelMismatch {
                expected: config.num_channels(),
                actual: data.nrows(),
            });
        }

        Ok(Self {
            data,
            trigger_position,
            trigger_code,
            config,
        })
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub(crate) fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    pub fn channel(&self, idx: usize) -> ArrayView1<'_, f64> {
        self.data.index_axis(Axis(0), idx)
    }

    /// Global stream position of the trigger sample
    pub fn trigger_position(&self) -> u64 {
        self.trigger_position
    }

    pub fn trigger_code(&self) -> u32 {
        self.trigger_code
    }

    /// Configuration in force when the window was opened
    pub fn config(&self) -> &Arc<AveragingConfig> {
        &self.config
    }

    pub fn pre_stim_samples(&self) -> usize {
        self.config.pre_stim_samples
    }

    pub fn post_stim_samples(&self) -> usize {
        self.config.post_stim_samples
    }

    pub fn num_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Largest absolute value over all channels and samples.
    ///
    /// Any NaN or infinite sample makes the peak infinite, so a non-finite
    /// epoch exceeds every artifact threshold.
    pub fn peak_amplitude(&self) -> f64 {
        self.data.iter().fold(0.0f64, |acc, v| {
            if v.is_finite() {
                acc.max(v.abs())
            } else {
                f64::INFINITY
            }
        })
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", content = "data")]
pub enum EngineState {
    #[default]
    Stopped,

    Running { started_at: f64 },
}

/// Counters describing the engine since construction
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub blocks_received: u64,
    pub blocks_processed: u64,
    pub samples_processed: u64,
    pub triggers_detected: u64,
    pub overlapping_triggers: u64,
    pub insufficient_history_triggers: u64,
    pub epochs_completed: u64,
    pub epochs_rejected: u64,
    pub evoked_emitted: u64,
    pub buffer: BufferMetrics,
    pub uptime_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_block_from_rows() {
        let block =
            SampleBlock::from_channel_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(block.num_channels(), 2);
        assert_eq!(block.num_samples(), 3);
        assert_eq!(block.data()[[1, 2]], 6.0);
    }

    #[test]
    fn test_block_rejects_ragged_rows() {
        let result = SampleBlock::from_channel_rows(&[vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(result, Err(AveragingError::MalformedBlock(_))));
    }

    #[test]
    fn test_epoch_shape_is_checked() {
        let config = Arc::new(AveragingConfig {
            channel_names: vec!["A".into()],
            pre_stim_samples: 2,
            post_stim_samples: 2,
            trigger_channels: vec![0],
            baseline_from: -2,
            baseline_to: 0,
            ..AveragingConfig::default()
        });

        assert!(Epoch::new(array![[1.0, 2.0, 3.0, 4.0]], 10, 1, config.clone()).is_ok());
        assert!(Epoch::new(array![[1.0, 2.0, 3.0]], 10, 1, config).is_err());
    }

    #[test]
    fn test_peak_amplitude_uses_absolute_value() {
        let config = Arc::new(AveragingConfig {
            channel_names: vec!["A".into(), "B".into()],
            pre_stim_samples: 1,
            post_stim_samples: 1,
            trigger_channels: vec![0],
            baseline_from: -1,
            baseline_to: 0,
            ..AveragingConfig::default()
        });
        let epoch = Epoch::new(array![[1.0, -7.5], [3.0, 2.0]], 0, 1, config).unwrap();
        assert_eq!(epoch.peak_amplitude(), 7.5);
    }

    #[test]
    fn test_peak_amplitude_of_non_finite_epoch_is_infinite() {
        let config = Arc::new(AveragingConfig {
            channel_names: vec!["A".into()],
            pre_stim_samples: 1,
            post_stim_samples: 2,
            trigger_channels: vec![0],
            baseline_from: -1,
            baseline_to: 0,
            ..AveragingConfig::default()
        });
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let epoch = Epoch::new(array![[bad, 1.0, 2.0]], 0, 1, config.clone()).unwrap();
            assert_eq!(epoch.peak_amplitude(), f64::INFINITY);
            let epoch = Epoch::new(array![[1.0, 2.0, bad]], 0, 1, config.clone()).unwrap();
            assert_eq!(epoch.peak_amplitude(), f64::INFINITY);
        }
    }
}
