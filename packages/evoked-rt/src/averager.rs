// Incremental evoked averaging
//
// Both modes use the incremental mean `acc += (epoch - acc) / n`. Running mode
// caps `n` at `num_averages`, so every new epoch keeps weight 1/N forever.
// This approximates a sliding window over the last N epochs without storing
// them; it is not an exact moving average. Cumulative mode grows `n` until it
// reaches N, flags that result as the end of the cycle and starts over.

use crate::config::{AverageMode, AveragingConfig};
use crate::types::Epoch;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One averaged response, emitted after every accepted epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvokedResult {
    pub id: String,
    /// channels x (pre + post) average
    pub average: Array2<f64>,
    pub sampling_rate: f64,
    pub channel_names: Vec<String>,
    pub trigger_channels: Vec<usize>,
    pub pre_stim_samples: usize,
    pub post_stim_samples: usize,
    pub count_calculated_averages: u32,
    pub num_averages: u32,
    pub average_mode: AverageMode,
    /// True on the update that completes a cumulative cycle
    pub cycle_complete: bool,
    pub trigger_position: u64,
    pub trigger_code: u32,
    pub timestamp: DateTime<Utc>,
}

impl EvokedResult {
    fn from_epoch(epoch: &Epoch, average: Array2<f64>, count: u32, cycle_complete: bool) -> Self {
        let config: &AveragingConfig = epoch.config();
        Self {
            id: Uuid::new_v4().to_string(),
            average,
            sampling_rate: config.sampling_rate,
            channel_names: config.channel_names.clone(),
            trigger_channels: config.trigger_channels.clone(),
            pre_stim_samples: config.pre_stim_samples,
            post_stim_samples: config.post_stim_samples,
            count_calculated_averages: count,
            num_averages: config.num_averages,
            average_mode: config.average_mode,
            cycle_complete,
            trigger_position: epoch.trigger_position(),
            trigger_code: epoch.trigger_code(),
            timestamp: Utc::now(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.average.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.average.ncols()
    }

    /// Time of every column in seconds, zero at the trigger sample
    pub fn times(&self) -> Vec<f64> {
        let pre = self.pre_stim_samples as f64;
        (0..self.num_samples())
            .map(|i| (i as f64 - pre) / self.sampling_rate)
            .collect()
    }
}

/// Running or cumulative average over accepted epochs
#[derive(Debug, Default)]
pub struct Averager {
    accumulated: Option<Array2<f64>>,
    count: u32,
    mode: Option<AverageMode>,
}

impl Averager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of epochs in the current estimate
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn current(&self) -> Option<&Array2<f64>> {
        self.accumulated.as_ref()
    }

    pub fn reset(&mut self) {
        self.accumulated = None;
        self.count = 0;
        self.mode = None;
    }

    /// Fold one epoch into the estimate using the epoch's own configuration
    pub fn update(&mut self, epoch: &Epoch) -> EvokedResult {
        let config = epoch.config();
        let mode = config.average_mode;
        let target = config.num_averages.max(1);

        let shape_changed = self
            .accumulated
            .as_ref()
            .is_some_and(|acc| acc.dim() != epoch.data().dim());
        if self.mode.is_some_and(|m| m != mode) || shape_changed {
            log::debug!("Averaging mode or epoch shape changed, starting a fresh cycle");
            self.accumulated = None;
            self.count = 0;
        }
        self.mode = Some(mode);

        let n = match mode {
            AverageMode::Running => (self.count + 1).min(target),
            AverageMode::Cumulative => self.count + 1,
        };

        let average = match self.accumulated.take() {
            Some(mut acc) => {
                let weight = 1.0 / f64::from(n);
                acc.zip_mut_with(&epoch.data(), |a, &x| *a += (x - *a) * weight);
                acc
            }
            None => epoch.data().to_owned(),
        };

        // A target lowered to or below the current count closes the cycle here
        let cycle_complete = mode == AverageMode::Cumulative && n >= target;
        let result = EvokedResult::from_epoch(epoch, average.clone(), n, cycle_complete);

        if cycle_complete {
            log::info!("Cumulative average of {} epochs complete", n);
            self.accumulated = None;
            self.count = 0;
        } else {
            self.accumulated = Some(average);
            self.count = n;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(mode: AverageMode, num_averages: u32, post: usize) -> Arc<AveragingConfig> {
        Arc::new(AveragingConfig {
            channel_names: vec!["EEG 001".into(), "EEG 002".into()],
            pre_stim_samples: 2,
            post_stim_samples: post,
            num_averages,
            average_mode: mode,
            trigger_channels: vec![0],
            baseline_from: -2,
            baseline_to: 0,
            ..AveragingConfig::default()
        })
    }

    fn constant(value: f64, config: &Arc<AveragingConfig>) -> Epoch {
        let data = Array2::from_elem((2, config.epoch_length()), value);
        Epoch::new(data, 0, 1, config.clone()).unwrap()
    }

    #[test]
    fn test_cumulative_mean_of_three() {
        let config = config(AverageMode::Cumulative, 3, 3);
        let mut averager = Averager::new();

        let first = averager.update(&constant(1.0, &config));
        let second = averager.update(&constant(2.0, &config));
        let third = averager.update(&constant(3.0, &config));

        assert_eq!(first.count_calculated_averages, 1);
        assert!(!first.cycle_complete);
        assert!((second.average[[0, 0]] - 1.5).abs() < 1e-12);
        assert!(third.cycle_complete);
        assert_eq!(third.count_calculated_averages, 3);
        assert!(third.average.iter().all(|v| (v - 2.0).abs() < 1e-12));

        // Cycle restarted
        assert_eq!(averager.count(), 0);
        let fresh = averager.update(&constant(10.0, &config));
        assert_eq!(fresh.count_calculated_averages, 1);
        assert_eq!(fresh.average[[1, 4]], 10.0);
    }

    #[test]
    fn test_running_caps_denominator() {
        let config = config(AverageMode::Running, 2, 3);
        let mut averager = Averager::new();

        averager.update(&constant(1.0, &config));
        averager.update(&constant(2.0, &config));
        let third = averager.update(&constant(3.0, &config));

        // 1.5 + (3 - 1.5) / 2
        assert!((third.average[[0, 0]] - 2.25).abs() < 1e-12);
        assert_eq!(third.count_calculated_averages, 2);
        assert!(!third.cycle_complete);
        assert_eq!(averager.count(), 2);
    }

    #[test]
    fn test_lowered_target_caps_running_count() {
        let mut averager = Averager::new();
        let wide = config(AverageMode::Running, 10, 3);
        for v in 0..5 {
            averager.update(&constant(v as f64, &wide));
        }
        assert_eq!(averager.count(), 5);

        let narrow = config(AverageMode::Running, 2, 3);
        let result = averager.update(&constant(100.0, &narrow));
        assert_eq!(result.count_calculated_averages, 2);
    }

    #[test]
    fn test_lowered_target_closes_cumulative_cycle() {
        let mut averager = Averager::new();
        let three = config(AverageMode::Cumulative, 3, 3);
        averager.update(&constant(1.0, &three));
        averager.update(&constant(2.0, &three));
        assert_eq!(averager.count(), 2);

        let two = config(AverageMode::Cumulative, 2, 3);
        let result = averager.update(&constant(9.0, &two));
        assert!(result.cycle_complete);
        assert_eq!(result.count_calculated_averages, 3);
        assert!(result.average.iter().all(|v| (v - 4.0).abs() < 1e-12));
        assert_eq!(averager.count(), 0);

        let next = averager.update(&constant(5.0, &two));
        assert_eq!(next.count_calculated_averages, 1);
        assert!(!next.cycle_complete);
    }

    #[test]
    fn test_lowered_target_to_one_keeps_accumulated_epochs() {
        let mut averager = Averager::new();
        let three = config(AverageMode::Cumulative, 3, 3);
        averager.update(&constant(1.0, &three));
        averager.update(&constant(2.0, &three));

        let result = averager.update(&constant(6.0, &config(AverageMode::Cumulative, 1, 3)));
        assert!(result.cycle_complete);
        assert_eq!(result.count_calculated_averages, 3);
        assert!((result.average[[0, 0]] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_mode_change_starts_fresh_cycle() {
        let mut averager = Averager::new();
        averager.update(&constant(4.0, &config(AverageMode::Running, 5, 3)));
        averager.update(&constant(6.0, &config(AverageMode::Running, 5, 3)));

        let result = averager.update(&constant(1.0, &config(AverageMode::Cumulative, 5, 3)));
        assert_eq!(result.count_calculated_averages, 1);
        assert_eq!(result.average[[0, 0]], 1.0);
    }

    #[test]
    fn test_shape_change_starts_fresh_cycle() {
        let mut averager = Averager::new();
        averager.update(&constant(4.0, &config(AverageMode::Running, 5, 3)));

        let result = averager.update(&constant(2.0, &config(AverageMode::Running, 5, 6)));
        assert_eq!(result.count_calculated_averages, 1);
        assert_eq!(result.num_samples(), 8);
    }

    #[test]
    fn test_result_metadata_and_times() {
        let config = config(AverageMode::Running, 4, 2);
        let mut averager = Averager::new();
        let result = averager.update(&constant(1.0, &config));

        assert_eq!(result.channel_names, vec!["EEG 001", "EEG 002"]);
        assert_eq!(result.pre_stim_samples, 2);
        assert_eq!(result.post_stim_samples, 2);
        assert_eq!(result.average_mode, AverageMode::Running);
        assert_eq!(result.times(), vec![-0.002, -0.001, 0.0, 0.001]);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["count_calculated_averages"], 1);
        assert_eq!(json["average_mode"], "running");
    }

    #[test]
    fn test_reset_clears_estimate() {
        let config = config(AverageMode::Running, 4, 2);
        let mut averager = Averager::new();
        averager.update(&constant(1.0, &config));
        averager.reset();

        assert_eq!(averager.count(), 0);
        assert!(averager.current().is_none());
    }
}
