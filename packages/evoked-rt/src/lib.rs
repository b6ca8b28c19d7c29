// Real-time evoked averaging engine
//
// Consumes a continuous multichannel sample stream, cuts stimulus-locked
// epochs around detected triggers and maintains incrementally updated
// averaged responses while acquisition keeps running.
//
// Architecture:
// - `buffer`: Bounded blocking FIFO between producers and the consumer thread
// - `trigger`: Rising-edge detection with composite multi-channel codes
// - `windower`: Pre/post-stimulus epoch assembly with deferred reconfiguration
// - `artifact` / `baseline`: Per-epoch gating and baseline removal
// - `averager`: Running and cumulative incremental averages
// - `controller`: Consumer thread, configuration setters, events and stats
// - `source`: Block source trait and a synthetic stimulus generator

pub mod artifact;
pub mod averager;
pub mod baseline;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod source;
pub mod trigger;
pub mod types;
pub mod windower;

pub use artifact::{ArtifactGate, ArtifactVerdict};
pub use averager::{Averager, EvokedResult};
pub use baseline::BaselineCorrector;
pub use buffer::{BufferMetrics, SampleStreamBuffer};
pub use config::{AverageMode, AveragingConfig};
pub use controller::{AveragingController, ControllerConfig};
pub use error::{AveragingError, AveragingResult};
pub use events::{AveragingEvent, EventHub};
pub use source::{BlockSource, SourceMetadata, SyntheticConfig, SyntheticSource};
pub use trigger::{TriggerDetector, TriggerScan};
pub use types::{CompositeTrigger, EngineState, EngineStats, Epoch, SampleBlock, TriggerEvent};
pub use windower::{DropReason, DroppedTrigger, EpochWindower, WindowOutput, WindowerState};
