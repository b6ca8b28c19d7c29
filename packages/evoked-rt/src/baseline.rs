// Baseline correction
//
// The per-channel mean over the baseline window is subtracted from every
// sample of that channel. Window bounds are relative to the trigger sample and
// translated to epoch columns with the pre-stimulus length as origin.

use crate::config::AveragingConfig;
use crate::types::Epoch;
use ndarray::{s, Axis};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct BaselineCorrector {
    enabled: bool,
    columns: Range<usize>,
}

impl BaselineCorrector {
    pub fn from_config(config: &AveragingConfig) -> Self {
        Self {
            enabled: config.baseline_correction,
            columns: config.baseline_columns(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Epoch columns averaged for the baseline
    pub fn columns(&self) -> Range<usize> {
        self.columns.clone()
    }

    pub fn apply(&self, mut epoch: Epoch) -> Epoch {
        if !self.enabled || self.columns.is_empty() || self.columns.end > epoch.num_samples() {
            return epoch;
        }

        let means = match epoch
            .data()
            .slice(s![.., self.columns.clone()])
            .mean_axis(Axis(1))
        {
            Some(means) => means,
            None => return epoch,
        };

        for (mut row, mean) in epoch.data_mut().axis_iter_mut(Axis(0)).zip(means.iter()) {
            row -= *mean;
        }

        epoch
    }
}
