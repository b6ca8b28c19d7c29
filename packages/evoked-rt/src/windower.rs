// Epoch windowing state machine
//
// Every block is fed through the trigger detector and into a history ring
// holding the last `pre + post` columns, so the pre-stimulus part of a window
// is available the moment a trigger fires. While a window is open the
// post-stimulus columns are copied into it; triggers seen meanwhile are
// queued (one slot) or dropped as overlapping.
//
// Configuration changes are requested at any time but applied only when the
// windower is idle. Each epoch carries the configuration that was active when
// its window opened.

use crate::config::AveragingConfig;
use crate::error::{AveragingError, AveragingResult};
use crate::trigger::TriggerDetector;
use crate::types::{CompositeTrigger, Epoch};
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Why a detected trigger did not produce an epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Another trigger was already queued behind the open window
    Overlapping,

    /// Fewer than `pre_stim_samples` columns precede the trigger
    InsufficientHistory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DroppedTrigger {
    pub position: u64,
    pub code: u32,
    pub reason: DropReason,
}

/// Everything one block produced
#[derive(Debug, Default)]
pub struct WindowOutput {
    pub epochs: Vec<Epoch>,
    pub dropped: Vec<DroppedTrigger>,
    pub triggers_detected: usize,
    /// A pending configuration was applied while processing the block
    pub config_applied: bool,
}

/// Externally visible windower state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum WindowerState {
    Idle,
    AccumulatingPost {
        trigger_position: u64,
        collected: usize,
        needed: usize,
    },
    Complete,
}

/// Ring of the most recent stream columns, addressed by global position
#[derive(Debug, Clone)]
struct SampleHistory {
    data: Array2<f64>,
    head: usize,
    len: usize,
    end: u64,
}

impl SampleHistory {
    fn new(num_channels: usize, capacity: usize, end: u64) -> Self {
        Self {
            data: Array2::zeros((num_channels, capacity.max(1))),
            head: 0,
            len: 0,
            end,
        }
    }

    fn capacity(&self) -> usize {
        self.data.ncols()
    }

    fn start(&self) -> u64 {
        self.end - self.len as u64
    }

    fn covers(&self, from: u64, to: u64) -> bool {
        from >= self.start() && to <= self.end && from <= to
    }

    fn slot_of(&self, position: u64) -> usize {
        let capacity = self.capacity();
        let oldest = (self.head + capacity - self.len) % capacity;
        (oldest + (position - self.start()) as usize) % capacity
    }

    fn extend(&mut self, columns: ArrayView2<'_, f64>) {
        let capacity = self.capacity();
        for column in columns.columns() {
            self.data.column_mut(self.head).assign(&column);
            self.head = (self.head + 1) % capacity;
            self.len = (self.len + 1).min(capacity);
        }
        self.end += columns.ncols() as u64;
    }

    /// Copy the columns `[from, to)` into `dest`; caller checks coverage
    fn copy_into(&self, from: u64, to: u64, mut dest: ArrayViewMut2<'_, f64>) {
        for (i, position) in (from..to).enumerate() {
            dest.column_mut(i)
                .assign(&self.data.column(self.slot_of(position)));
        }
    }

    fn column(&self, position: u64) -> Option<Array1<f64>> {
        if self.len == 0 || position < self.start() || position >= self.end {
            return None;
        }
        Some(self.data.column(self.slot_of(position)).to_owned())
    }

    /// Change capacity, keeping the most recent columns that still fit
    fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity == self.capacity() {
            return;
        }

        let keep = self.len.min(capacity);
        let mut resized = SampleHistory::new(self.data.nrows(), capacity, self.end - keep as u64);
        if keep > 0 {
            let mut recent = Array2::zeros((self.data.nrows(), keep));
            self.copy_into(self.end - keep as u64, self.end, recent.view_mut());
            resized.extend(recent.view());
        }
        *self = resized;
    }

    fn clear_at(&mut self, end: u64) {
        self.head = 0;
        self.len = 0;
        self.end = end;
    }
}

/// A window that has been opened by a trigger
#[derive(Debug)]
struct OpenWindow {
    data: Array2<f64>,
    trigger: CompositeTrigger,
    collected: usize,
    config: Arc<AveragingConfig>,
}

impl OpenWindow {
    fn needed(&self) -> usize {
        self.config.post_stim_samples
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    AccumulatingPost(OpenWindow),
    Complete(OpenWindow),
}

/// Assembles pre + post stimulus epochs from a continuous block stream
pub struct EpochWindower {
    active: Arc<AveragingConfig>,
    pending: Option<Arc<AveragingConfig>>,
    detector: TriggerDetector,
    history: SampleHistory,
    phase: Phase,
    queued: Option<CompositeTrigger>,
    position: u64,
}

impl EpochWindower {
    pub fn new(config: Arc<AveragingConfig>) -> Self {
        Self {
            detector: TriggerDetector::from_config(&config),
            history: SampleHistory::new(config.num_channels(), config.epoch_length(), 0),
            active: config,
            pending: None,
            phase: Phase::Idle,
            queued: None,
            position: 0,
        }
    }

    /// Configuration used for windows opened from now on
    pub fn active_config(&self) -> &Arc<AveragingConfig> {
        &self.active
    }

    pub fn has_pending_config(&self) -> bool {
        self.pending.is_some()
    }

    /// Global position of the next column to be processed
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn queued_trigger(&self) -> Option<CompositeTrigger> {
        self.queued
    }

    pub fn state(&self) -> WindowerState {
        match &self.phase {
            Phase::Idle => WindowerState::Idle,
            Phase::AccumulatingPost(window) => WindowerState::AccumulatingPost {
                trigger_position: window.trigger.position,
                collected: window.collected,
                needed: window.needed(),
            },
            Phase::Complete(_) => WindowerState::Complete,
        }
    }

    /// Request a new configuration
    ///
    /// Applied immediately when idle (returns true), otherwise held until the
    /// open window completes. A later request replaces an earlier pending one.
    pub fn request_config(&mut self, config: Arc<AveragingConfig>) -> bool {
        if matches!(self.phase, Phase::Idle) {
            self.pending = None;
            self.apply(config);
            true
        } else {
            log::debug!(
                "Window open at {:?}, deferring configuration change",
                self.state()
            );
            self.pending = Some(config);
            false
        }
    }

    fn apply(&mut self, config: Arc<AveragingConfig>) {
        self.detector
            .reconfigure(config.trigger_channels.clone(), config.trigger_threshold);
        self.history.resize(config.epoch_length());
        log::debug!(
            "Windower using pre={} post={} triggers={:?}",
            config.pre_stim_samples,
            config.post_stim_samples,
            config.trigger_channels
        );
        self.active = config;
    }

    fn apply_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(config) => {
                self.apply(config);
                true
            }
            None => false,
        }
    }

    /// Drop all stream state and restart positions at zero
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.queued = None;
        self.position = 0;
        self.history.clear_at(0);
        self.detector.reset();
        self.apply_pending();
    }

    /// Abandon any open window and queued trigger, keeping the stream position
    pub fn discard_in_flight(&mut self) {
        if let Phase::AccumulatingPost(window) = &self.phase {
            log::debug!(
                "Discarding partial epoch at {} ({}/{} post samples)",
                window.trigger.position,
                window.collected,
                window.needed()
            );
        }
        self.phase = Phase::Idle;
        self.queued = None;
        self.history.clear_at(self.position);
        self.detector.reset();
        self.apply_pending();
    }

    /// Feed one block through detection and windowing
    pub fn process_block(&mut self, block: ArrayView2<'_, f64>) -> AveragingResult<WindowOutput> {
        let expected = self.active.num_channels();
        if block.nrows() != expected {
            return Err(AveragingError::ChannelMismatch {
                expected,
                actual: block.nrows(),
            });
        }

        let mut output = WindowOutput::default();
        let block_start = self.position;
        let width = block.ncols();

        let lookback_before = self.detector.lookback().map(|c| c.to_owned());
        let mut markers: VecDeque<CompositeTrigger> =
            self.detector.detect(block, block_start).markers.into();
        let mut cursor = 0usize;

        loop {
            match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Idle => {
                    if self.apply_pending() {
                        output.config_applied = true;
                        markers = self.rescan(block, cursor, block_start, lookback_before.as_ref());
                    }

                    let trigger = match self.queued.take() {
                        Some(trigger) => trigger,
                        None => match markers.pop_front() {
                            Some(trigger) => {
                                output.triggers_detected += 1;
                                trigger
                            }
                            None => {
                                self.history.extend(block.slice(s![.., cursor..]));
                                break;
                            }
                        },
                    };

                    let here = block_start + cursor as u64;
                    if trigger.position > here {
                        let until = cursor + (trigger.position - here) as usize;
                        self.history.extend(block.slice(s![.., cursor..until]));
                        cursor = until;
                    }

                    match self.open_window(trigger) {
                        Some(window) => self.phase = Phase::AccumulatingPost(window),
                        None => {
                            log::debug!(
                                "Dropping trigger at {}: insufficient pre-stimulus history",
                                trigger.position
                            );
                            output.dropped.push(DroppedTrigger {
                                position: trigger.position,
                                code: trigger.code,
                                reason: DropReason::InsufficientHistory,
                            });
                        }
                    }
                }

                Phase::AccumulatingPost(mut window) => {
                    let pre = window.config.pre_stim_samples;
                    let take = (window.needed() - window.collected).min(width - cursor);
                    if take > 0 {
                        let columns = block.slice(s![.., cursor..cursor + take]);
                        let at = pre + window.collected;
                        window
                            .data
                            .slice_mut(s![.., at..at + take])
                            .assign(&columns);
                        self.history.extend(columns);
                        window.collected += take;
                        cursor += take;
                    }

                    while markers.front().is_some_and(|m| m.offset < cursor) {
                        if let Some(marker) = markers.pop_front() {
                            output.triggers_detected += 1;
                            self.queue_or_drop(marker, &mut output);
                        }
                    }

                    if window.collected == window.needed() {
                        self.phase = Phase::Complete(window);
                    } else {
                        self.phase = Phase::AccumulatingPost(window);
                        break;
                    }
                }

                Phase::Complete(window) => {
                    let epoch = Epoch::new(
                        window.data,
                        window.trigger.position,
                        window.trigger.code,
                        window.config,
                    )?;
                    output.epochs.push(epoch);
                }
            }
        }

        self.position += width as u64;
        Ok(output)
    }

    fn queue_or_drop(&mut self, marker: CompositeTrigger, output: &mut WindowOutput) {
        if self.queued.is_none() {
            self.queued = Some(marker);
        } else {
            log::debug!(
                "Dropping overlapping trigger at {} (code {})",
                marker.position,
                marker.code
            );
            output.dropped.push(DroppedTrigger {
                position: marker.position,
                code: marker.code,
                reason: DropReason::Overlapping,
            });
        }
    }

    /// Re-detect triggers in `block[cursor..]` after a reconfiguration
    fn rescan(
        &self,
        block: ArrayView2<'_, f64>,
        cursor: usize,
        block_start: u64,
        lookback_before: Option<&Array1<f64>>,
    ) -> VecDeque<CompositeTrigger> {
        let lookback = if cursor > 0 {
            Some(block.column(cursor - 1))
        } else {
            lookback_before.map(|c| c.view())
        };

        self.detector
            .scan(block.slice(s![.., cursor..]), lookback, block_start + cursor as u64)
            .markers
            .into_iter()
            .map(|m| CompositeTrigger {
                offset: m.offset + cursor,
                ..m
            })
            .collect()
    }

    /// Open a window at `trigger` from history; None if pre-stim is missing
    fn open_window(&self, trigger: CompositeTrigger) -> Option<OpenWindow> {
        let config = self.active.clone();
        let pre = config.pre_stim_samples;
        let post = config.post_stim_samples;
        let at = trigger.position;
        let from = at.checked_sub(pre as u64)?;

        if !self.history.covers(from, at) {
            return None;
        }

        let mut data = Array2::zeros((config.num_channels(), config.epoch_length()));
        self.history.copy_into(from, at, data.slice_mut(s![.., 0..pre]));

        // Columns from the trigger onwards already in history (queued triggers)
        let available = ((self.history.end - at) as usize).min(post);
        self.history.copy_into(
            at,
            at + available as u64,
            data.slice_mut(s![.., pre..pre + available]),
        );

        Some(OpenWindow {
            data,
            trigger,
            collected: available,
            config,
        })
    }

    /// Most recent column seen, if still held in history
    pub fn last_column(&self) -> Option<Array1<f64>> {
        self.history.column(self.position.checked_sub(1)?)
    }
}
