// Amplitude-based artifact rejection

use crate::config::AveragingConfig;
use crate::types::Epoch;
use serde::{Deserialize, Serialize};

/// Outcome of gating one epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ArtifactVerdict {
    Pass,
    Reject { peak: f64 },
}

impl ArtifactVerdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ArtifactVerdict::Reject { .. })
    }
}

/// Rejects epochs whose absolute peak exceeds a bound
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArtifactGate {
    enabled: bool,
    threshold: f64,
}

impl ArtifactGate {
    pub fn new(enabled: bool, threshold: f64) -> Self {
        Self { enabled, threshold }
    }

    pub fn from_config(config: &AveragingConfig) -> Self {
        Self::new(config.artifact_rejection, config.artifact_threshold)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reject when enabled and any sample's magnitude is strictly above the
    /// threshold. NaN and infinite samples are always rejected.
    pub fn evaluate(&self, epoch: &Epoch) -> ArtifactVerdict {
        if !self.enabled {
            return ArtifactVerdict::Pass;
        }

        let peak = epoch.peak_amplitude();
        if peak > self.threshold {
            ArtifactVerdict::Reject { peak }
        } else {
            ArtifactVerdict::Pass
        }
    }
}
