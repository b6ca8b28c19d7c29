// Trigger detection on designated stimulus channels
//
// A trigger is a rising edge: a sample strictly above the threshold whose
// predecessor is at or below it. One column of lookback is carried between
// blocks so an edge that straddles a block boundary is seen exactly once.

use crate::config::AveragingConfig;
use crate::types::{CompositeTrigger, TriggerEvent};
use ndarray::{Array1, ArrayView1, ArrayView2};
use std::collections::BTreeMap;

/// Result of scanning one block (or block remainder)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerScan {
    /// Crossings per configured trigger channel, in sample order
    pub per_channel: BTreeMap<usize, Vec<TriggerEvent>>,

    /// One marker per sample at which any trigger channel crossed
    pub markers: Vec<CompositeTrigger>,
}

impl TriggerScan {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn total_events(&self) -> usize {
        self.per_channel.values().map(Vec::len).sum()
    }
}

/// Rising-edge detector over an ordered list of trigger channels
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    channels: Vec<usize>,
    threshold: f64,
    last_column: Option<Array1<f64>>,
}

impl TriggerDetector {
    pub fn new(channels: Vec<usize>, threshold: f64) -> Self {
        Self {
            channels,
            threshold,
            last_column: None,
        }
    }

    pub fn from_config(config: &AveragingConfig) -> Self {
        Self::new(config.trigger_channels.clone(), config.trigger_threshold)
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Change channels and threshold; the lookback column is kept
    pub fn reconfigure(&mut self, channels: Vec<usize>, threshold: f64) {
        self.channels = channels;
        self.threshold = threshold;
    }

    /// Forget the lookback column; the next sample seen cannot be an edge
    pub fn reset(&mut self) {
        self.last_column = None;
    }

    /// Last column of the previously detected block
    pub fn lookback(&self) -> Option<ArrayView1<'_, f64>> {
        self.last_column.as_ref().map(|c| c.view())
    }

    /// Scan `block` and remember its last column for the next call
    pub fn detect(&mut self, block: ArrayView2<'_, f64>, block_start: u64) -> TriggerScan {
        let scan = self.scan(block, self.lookback(), block_start);
        if block.ncols() > 0 {
            self.last_column = Some(block.column(block.ncols() - 1).to_owned());
        }
        scan
    }

    /// Scan without touching detector state
    ///
    /// `lookback` is the column immediately preceding `block` in the stream,
    /// if any. `block_start` is the global position of the first column.
    pub fn scan(
        &self,
        block: ArrayView2<'_, f64>,
        lookback: Option<ArrayView1<'_, f64>>,
        block_start: u64,
    ) -> TriggerScan {
        let mut per_channel = BTreeMap::new();
        let mut codes: BTreeMap<usize, u32> = BTreeMap::new();

        for (rank, &channel) in self.channels.iter().enumerate() {
            if channel >= block.nrows() {
                continue;
            }

            let mut events = Vec::new();
            let mut previous = lookback.as_ref().and_then(|col| col.get(channel).copied());

            for (offset, &value) in block.row(channel).iter().enumerate() {
                if let Some(prev) = previous {
                    if prev <= self.threshold && value > self.threshold {
                        events.push(TriggerEvent {
                            channel_index: channel,
                            offset,
                            position: block_start + offset as u64,
                            amplitude: value,
                        });
                        *codes.entry(offset).or_insert(0) |= 1u32 << rank;
                    }
                }
                previous = Some(value);
            }

            per_channel.insert(channel, events);
        }

        let markers = codes
            .into_iter()
            .map(|(offset, code)| CompositeTrigger {
                offset,
                position: block_start + offset as u64,
                code,
            })
            .collect();

        TriggerScan {
            per_channel,
            markers,
        }
    }
}
