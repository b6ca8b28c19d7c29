// Averaging controller - owns the consumer thread and the engine state
//
// The controller manages:
// - Block ingestion into the bounded sample buffer
// - The consumer thread (pop -> detect -> window -> gate -> correct -> average)
// - Validated configuration changes, deferred by the windower until idle
// - Event emission and statistics
//
// Windower, averager and the committed configuration live in one struct
// behind one mutex. The lock is held for a state transition only; artifact
// gating and baseline correction run on the owned epoch outside it.

use crate::artifact::{ArtifactGate, ArtifactVerdict};
use crate::averager::Averager;
use crate::baseline::BaselineCorrector;
use crate::buffer::SampleStreamBuffer;
use crate::config::{AverageMode, AveragingConfig};
use crate::error::{AveragingError, AveragingResult};
use crate::events::{AveragingEvent, EventHub};
use crate::types::{EngineState, EngineStats, SampleBlock};
use crate::windower::{DropReason, EpochWindower, WindowerState};
use crossbeam::channel::Receiver;
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub engine_id: String,
    /// Maximum number of blocks waiting for the consumer
    pub buffer_capacity: usize,
    pub averaging: AveragingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            engine_id: uuid::Uuid::new_v4().to_string(),
            buffer_capacity: 64,
            averaging: AveragingConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(averaging: AveragingConfig) -> Self {
        Self {
            averaging,
            ..Default::default()
        }
    }
}

/// State guarded by the engine-wide lock
struct EngineCore {
    /// Latest committed configuration
    config: AveragingConfig,
    windower: EpochWindower,
    averager: Averager,
    /// Bumped by reset so epochs windowed earlier are never merged
    generation: u64,
}

#[derive(Default)]
struct Counters {
    blocks_received: AtomicU64,
    blocks_processed: AtomicU64,
    samples_processed: AtomicU64,
    triggers_detected: AtomicU64,
    overlapping_triggers: AtomicU64,
    insufficient_history_triggers: AtomicU64,
    epochs_completed: AtomicU64,
    epochs_rejected: AtomicU64,
    evoked_emitted: AtomicU64,
}

/// Everything shared between the controller handle and the consumer thread
struct Shared {
    id: String,
    num_channels: usize,
    core: Mutex<EngineCore>,
    buffer: SampleStreamBuffer,
    events: EventHub,
    counters: Counters,
    state: RwLock<EngineState>,
    is_running: AtomicBool,
    start_time: RwLock<Option<Instant>>,
}

/// Real-time evoked averaging engine
pub struct AveragingController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_sequence: AtomicU64,
}

impl AveragingController {
    /// Create a stopped controller; the configuration must be valid
    pub fn new(config: ControllerConfig) -> AveragingResult<Self> {
        config.averaging.validate()?;

        let windower = EpochWindower::new(Arc::new(config.averaging.clone()));
        let shared = Shared {
            id: config.engine_id,
            num_channels: config.averaging.num_channels(),
            core: Mutex::new(EngineCore {
                config: config.averaging,
                windower,
                averager: Averager::new(),
                generation: 0,
            }),
            buffer: SampleStreamBuffer::new(config.buffer_capacity),
            events: EventHub::new(),
            counters: Counters::default(),
            state: RwLock::new(EngineState::Stopped),
            is_running: AtomicBool::new(false),
            start_time: RwLock::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            next_sequence: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Set event callback function
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(AveragingEvent) + Send + Sync + 'static,
    {
        self.shared.events.set_callback(callback);
    }

    /// Channel receiving every event emitted from now on
    pub fn subscribe(&self) -> Receiver<AveragingEvent> {
        self.shared.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the consumer thread; a no-op when already running
    pub fn start(&self) -> AveragingResult<()> {
        let state = {
            let mut worker = self.worker.lock();
            if self.shared.is_running.load(Ordering::Acquire) {
                return Ok(());
            }

            log::info!("Starting averaging engine: {}", self.shared.id);

            {
                let core = self.shared.core.lock();
                if core.config.trigger_channels.is_empty() {
                    log::warn!("No trigger channels configured; no epochs will be produced");
                }
            }

            self.shared.buffer.rearm();
            self.shared.is_running.store(true, Ordering::Release);

            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("evoked-consumer-{}", self.shared.id))
                .spawn(move || consumer_loop(shared))
                .map_err(|e| {
                    self.shared.is_running.store(false, Ordering::Release);
                    AveragingError::Thread(e.to_string())
                })?;
            *worker = Some(handle);

            *self.shared.start_time.write() = Some(Instant::now());
            self.store_state(EngineState::Running {
                started_at: chrono::Utc::now().timestamp() as f64,
            })
        };

        // Emitted without the worker lock so callbacks may start or stop the engine
        self.shared.events.emit(AveragingEvent::StateChanged(state));
        log::info!("Averaging engine started");
        Ok(())
    }

    /// Stop the consumer thread, discarding queued blocks and any partial epoch.
    ///
    /// The engine ends up stopped and cleaned even when the consumer thread
    /// panicked; that panic is then reported as [`AveragingError::Thread`].
    pub fn stop(&self) -> AveragingResult<()> {
        let (state, joined) = {
            let mut worker = self.worker.lock();
            if !self.shared.is_running.swap(false, Ordering::AcqRel) {
                return Ok(());
            }

            log::info!("Stopping averaging engine: {}", self.shared.id);

            self.shared.buffer.release_waiters();
            let joined = match worker.take() {
                Some(handle) => handle.join().map_err(|_| {
                    log::error!("Averaging consumer thread panicked");
                    AveragingError::Thread("consumer thread panicked".to_string())
                }),
                None => Ok(()),
            };

            let discarded = self.shared.buffer.len();
            self.shared.buffer.clear();
            if discarded > 0 {
                log::debug!("Discarded {} unprocessed blocks", discarded);
            }
            self.shared.core.lock().windower.discard_in_flight();

            *self.shared.start_time.write() = None;
            (self.store_state(EngineState::Stopped), joined)
        };

        self.shared.events.emit(AveragingEvent::StateChanged(state));
        log::info!("Averaging engine stopped");
        joined
    }

    /// Clear windowing and averaging state; configuration is kept
    pub fn reset(&self) {
        let mut core = self.shared.core.lock();
        core.windower.reset();
        core.averager.reset();
        core.generation += 1;
        log::info!("Averaging engine reset (generation {})", core.generation);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.read().clone()
    }

    /// Record a new lifecycle state; the caller emits it once its locks are released
    fn store_state(&self, state: EngineState) -> EngineState {
        *self.shared.state.write() = state.clone();
        state
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Append a channels x samples block; blocks while the buffer is full
    pub fn append(&self, data: Array2<f64>) -> AveragingResult<()> {
        self.append_block(SampleBlock::new(data))
    }

    pub fn append_block(&self, block: SampleBlock) -> AveragingResult<()> {
        if block.num_channels() != self.shared.num_channels {
            return Err(AveragingError::ChannelMismatch {
                expected: self.shared.num_channels,
                actual: block.num_channels(),
            });
        }
        if !self.is_running() {
            return Err(AveragingError::NotRunning);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.shared
            .buffer
            .push(block.with_sequence(sequence))
            .map_err(|_| AveragingError::BufferReleased)?;
        self.shared
            .counters
            .blocks_received
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until every appended block has been processed
    ///
    /// Returns false if `timeout` elapsed first or the engine stopped.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let counters = &self.shared.counters;
        loop {
            let received = counters.blocks_received.load(Ordering::Acquire);
            let processed = counters.blocks_processed.load(Ordering::Acquire);
            if processed >= received {
                return true;
            }
            if !self.is_running() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Latest committed configuration
    pub fn config(&self) -> AveragingConfig {
        self.shared.core.lock().config.clone()
    }

    /// Configuration the windower currently opens windows with
    pub fn active_config(&self) -> AveragingConfig {
        self.shared.core.lock().windower.active_config().as_ref().clone()
    }

    pub fn windower_state(&self) -> WindowerState {
        self.shared.core.lock().windower.state()
    }

    /// Validate and commit a modified copy of the configuration
    ///
    /// On error the previous configuration stays in force.
    fn update_config<F>(&self, what: &str, modify: F) -> AveragingResult<()>
    where
        F: FnOnce(&mut AveragingConfig),
    {
        let committed = {
            let mut core = self.shared.core.lock();
            let mut candidate = core.config.clone();
            modify(&mut candidate);

            if let Err(e) = candidate.validate() {
                log::warn!("Rejected {} change: {}", what, e);
                return Err(e);
            }
            if candidate == core.config {
                return Ok(());
            }

            core.config = candidate.clone();
            let applied = core.windower.request_config(Arc::new(candidate.clone()));
            log::info!(
                "Committed {} change ({})",
                what,
                if applied { "applied" } else { "pending until idle" }
            );
            candidate
        };

        self.shared
            .events
            .emit(AveragingEvent::ConfigurationChanged(Box::new(committed)));
        Ok(())
    }

    pub fn set_pre_stim_samples(&self, samples: usize) -> AveragingResult<()> {
        self.update_config("pre-stimulus", |c| c.pre_stim_samples = samples)
    }

    pub fn set_post_stim_samples(&self, samples: usize) -> AveragingResult<()> {
        self.update_config("post-stimulus", |c| c.post_stim_samples = samples)
    }

    /// Pre-stimulus length in milliseconds, rounded to whole samples
    pub fn set_pre_stim_ms(&self, ms: f64) -> AveragingResult<()> {
        self.update_config("pre-stimulus", |c| {
            c.pre_stim_samples = c.ms_to_samples(ms).max(0) as usize;
        })
    }

    pub fn set_post_stim_ms(&self, ms: f64) -> AveragingResult<()> {
        self.update_config("post-stimulus", |c| {
            c.post_stim_samples = c.ms_to_samples(ms).max(0) as usize;
        })
    }

    pub fn set_num_averages(&self, num_averages: u32) -> AveragingResult<()> {
        self.update_config("number of averages", |c| c.num_averages = num_averages)
    }

    pub fn set_average_mode(&self, mode: AverageMode) -> AveragingResult<()> {
        self.update_config("averaging mode", |c| c.average_mode = mode)
    }

    pub fn set_trigger_channels(&self, channels: Vec<usize>) -> AveragingResult<()> {
        self.update_config("trigger channels", |c| c.trigger_channels = channels)
    }

    pub fn set_trigger_threshold(&self, threshold: f64) -> AveragingResult<()> {
        self.update_config("trigger threshold", |c| c.trigger_threshold = threshold)
    }

    pub fn set_artifact_rejection(&self, enabled: bool, threshold: f64) -> AveragingResult<()> {
        self.update_config("artifact rejection", |c| {
            c.artifact_rejection = enabled;
            c.artifact_threshold = threshold;
        })
    }

    pub fn set_artifact_threshold(&self, threshold: f64) -> AveragingResult<()> {
        self.update_config("artifact threshold", |c| c.artifact_threshold = threshold)
    }

    pub fn set_baseline_correction(&self, enabled: bool) -> AveragingResult<()> {
        self.update_config("baseline correction", |c| c.baseline_correction = enabled)
    }

    pub fn set_baseline_from(&self, from: i64) -> AveragingResult<()> {
        self.update_config("baseline start", |c| c.baseline_from = from)
    }

    pub fn set_baseline_to(&self, to: i64) -> AveragingResult<()> {
        self.update_config("baseline end", |c| c.baseline_to = to)
    }

    /// Set both baseline bounds at once, in samples relative to the trigger
    pub fn set_baseline_window(&self, from: i64, to: i64) -> AveragingResult<()> {
        self.update_config("baseline window", |c| {
            c.baseline_from = from;
            c.baseline_to = to;
        })
    }

    pub fn set_baseline_window_ms(&self, from_ms: f64, to_ms: f64) -> AveragingResult<()> {
        self.update_config("baseline window", |c| {
            c.baseline_from = c.ms_to_samples(from_ms);
            c.baseline_to = c.ms_to_samples(to_ms);
        })
    }

    pub fn set_sampling_rate(&self, sampling_rate: f64) -> AveragingResult<()> {
        self.update_config("sampling rate", |c| c.sampling_rate = sampling_rate)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            blocks_received: c.blocks_received.load(Ordering::Relaxed),
            blocks_processed: c.blocks_processed.load(Ordering::Relaxed),
            samples_processed: c.samples_processed.load(Ordering::Relaxed),
            triggers_detected: c.triggers_detected.load(Ordering::Relaxed),
            overlapping_triggers: c.overlapping_triggers.load(Ordering::Relaxed),
            insufficient_history_triggers: c
                .insufficient_history_triggers
                .load(Ordering::Relaxed),
            epochs_completed: c.epochs_completed.load(Ordering::Relaxed),
            epochs_rejected: c.epochs_rejected.load(Ordering::Relaxed),
            evoked_emitted: c.evoked_emitted.load(Ordering::Relaxed),
            buffer: self.shared.buffer.metrics(),
            uptime_seconds: self
                .shared
                .start_time
                .read()
                .as_ref()
                .map(|t| t.elapsed().as_secs_f64()),
        }
    }

    /// Number of epochs in the current average
    pub fn count_calculated_averages(&self) -> u32 {
        self.shared.core.lock().averager.count()
    }
}

impl Drop for AveragingController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop averaging engine on drop: {}", e);
        }
    }
}

fn consumer_loop(shared: Arc<Shared>) {
    log::debug!("Consumer thread running for engine {}", shared.id);

    while shared.is_running.load(Ordering::Acquire) {
        match shared.buffer.pop() {
            Some(block) => shared.process_block(block),
            None => break,
        }
    }

    log::debug!("Consumer thread for engine {} exiting", shared.id);
}

impl Shared {
    fn process_block(&self, block: SampleBlock) {
        let (output, generation) = {
            let mut core = self.core.lock();
            let generation = core.generation;
            match core.windower.process_block(block.data()) {
                Ok(output) => (output, generation),
                Err(e) => {
                    log::error!("Block {} could not be windowed: {}", block.sequence(), e);
                    self.counters.blocks_processed.fetch_add(1, Ordering::Release);
                    return;
                }
            }
        };

        let c = &self.counters;
        c.samples_processed
            .fetch_add(block.num_samples() as u64, Ordering::Relaxed);
        c.triggers_detected
            .fetch_add(output.triggers_detected as u64, Ordering::Relaxed);

        for dropped in &output.dropped {
            match dropped.reason {
                DropReason::Overlapping => c.overlapping_triggers.fetch_add(1, Ordering::Relaxed),
                DropReason::InsufficientHistory => c
                    .insufficient_history_triggers
                    .fetch_add(1, Ordering::Relaxed),
            };
            self.events.emit(AveragingEvent::TriggerDropped {
                position: dropped.position,
                reason: dropped.reason,
            });
        }

        for epoch in output.epochs {
            c.epochs_completed.fetch_add(1, Ordering::Relaxed);

            if let ArtifactVerdict::Reject { peak } =
                ArtifactGate::from_config(epoch.config()).evaluate(&epoch)
            {
                log::debug!(
                    "Rejected epoch at {}: peak {} above {}",
                    epoch.trigger_position(),
                    peak,
                    epoch.config().artifact_threshold
                );
                c.epochs_rejected.fetch_add(1, Ordering::Relaxed);
                self.events.emit(AveragingEvent::EpochRejected {
                    trigger_position: epoch.trigger_position(),
                    peak,
                });
                continue;
            }

            let epoch = BaselineCorrector::from_config(epoch.config()).apply(epoch);

            let result = {
                let mut core = self.core.lock();
                if core.generation != generation {
                    log::debug!(
                        "Dropping epoch at {} windowed before reset",
                        epoch.trigger_position()
                    );
                    continue;
                }
                core.averager.update(&epoch)
            };

            c.evoked_emitted.fetch_add(1, Ordering::Relaxed);
            self.events.emit(AveragingEvent::Evoked(Arc::new(result)));
        }

        c.blocks_processed.fetch_add(1, Ordering::Release);
    }
}
