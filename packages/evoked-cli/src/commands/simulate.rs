use crate::cli::SimulateArgs;
use crate::exit_codes;
use crate::output;
use evoked_rt::{
    AveragingConfig, AveragingController, AveragingEvent, BlockSource, ControllerConfig,
    EngineStats, EvokedResult, SourceMetadata, SyntheticConfig, SyntheticSource,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct SimulateOutput {
    engine_id: String,
    config: AveragingConfig,
    stimuli: usize,
    stats: EngineStats,
    rejected_epochs: Vec<u64>,
    evoked: Option<Arc<EvokedResult>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<Arc<EvokedResult>>,
}

pub fn execute(args: SimulateArgs) -> i32 {
    let synthetic = SyntheticConfig {
        sampling_rate: args.sr,
        data_channels: args.channels,
        block_size: args.block_size,
        stimulus_interval: args.interval,
        first_stimulus: args.interval / 2,
        noise_amplitude: args.noise,
        artifact_every: args.artifact_every,
        max_blocks: Some(args.blocks),
        seed: args.seed,
        ..Default::default()
    };

    let mut source = match SyntheticSource::new(synthetic) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let averaging = match build_config(&args, &source.metadata()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let engine = match AveragingController::new(ControllerConfig {
        buffer_capacity: args.buffer_capacity,
        averaging,
        ..Default::default()
    }) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let events = engine.subscribe();
    if let Err(e) = engine.start() {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    if !args.quiet {
        let config = engine.config();
        eprintln!("Simulating {} blocks of {} samples...", args.blocks, args.block_size);
        eprintln!(
            "  Channels: {} ({} Hz)",
            config.num_channels(),
            config.sampling_rate
        );
        eprintln!(
            "  Window: pre={} post={} samples, {:?} average of {}",
            config.pre_stim_samples,
            config.post_stim_samples,
            config.average_mode,
            config.num_averages
        );
    }

    loop {
        match source.next_block() {
            Ok(Some(block)) => {
                if let Err(e) = engine.append_block(block) {
                    eprintln!("Error: {}", e);
                    return exit_codes::EXECUTION_ERROR;
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
        }
    }

    if !engine.wait_until_drained(DRAIN_TIMEOUT) {
        eprintln!("Error: engine did not process all blocks in time");
        return exit_codes::EXECUTION_ERROR;
    }
    if let Err(e) = engine.stop() {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }

    let mut history = Vec::new();
    let mut rejected_epochs = Vec::new();
    for event in events.try_iter() {
        match event {
            AveragingEvent::Evoked(result) => history.push(result),
            AveragingEvent::EpochRejected {
                trigger_position, ..
            } => rejected_epochs.push(trigger_position),
            _ => {}
        }
    }

    let total_samples = (args.blocks * args.block_size) as u64;
    let result = SimulateOutput {
        engine_id: engine.id().to_string(),
        config: engine.config(),
        stimuli: source.stimulus_positions(total_samples).len(),
        stats: engine.stats(),
        rejected_epochs,
        evoked: history.last().cloned(),
        history: if args.all { history } else { Vec::new() },
    };

    if !args.quiet {
        eprintln!(
            "  Epochs: {} completed, {} rejected",
            result.stats.epochs_completed, result.stats.epochs_rejected
        );
    }

    match output::emit(&result, args.compact, args.output.as_deref()) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}

/// Merge the optional config file with command-line overrides
fn build_config(args: &SimulateArgs, metadata: &SourceMetadata) -> Result<AveragingConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let loaded = AveragingConfig::from_json_file(path)
                .map_err(|e| format!("Failed to load config '{}': {}", path, e))?;
            if loaded.channel_names != metadata.channel_names {
                return Err(format!(
                    "Config channel layout {:?} does not match the synthetic source {:?}",
                    loaded.channel_names, metadata.channel_names
                ));
            }
            loaded
        }
        None => metadata.averaging_config(),
    };

    if config.sampling_rate != metadata.sampling_rate {
        log::warn!(
            "Config sampling rate {} Hz replaced by source rate {} Hz",
            config.sampling_rate,
            metadata.sampling_rate
        );
        config.sampling_rate = metadata.sampling_rate;
    }

    if let Some(mode) = args.mode {
        config.average_mode = mode.into();
    }
    if let Some(averages) = args.averages {
        config.num_averages = averages;
    }
    if let Some(threshold) = args.threshold {
        config.trigger_threshold = threshold;
    }

    let window_changed = args.pre_ms.is_some() || args.post_ms.is_some();
    if let Some(ms) = args.pre_ms {
        config.pre_stim_samples = config.ms_to_samples(ms).max(0) as usize;
    }
    if let Some(ms) = args.post_ms {
        config.post_stim_samples = config.ms_to_samples(ms).max(0) as usize;
    }
    if window_changed {
        config.baseline_from = -(config.pre_stim_samples as i64);
        config.baseline_to = 0;
    }

    if args.baseline {
        config.baseline_correction = true;
    }
    if let Some(ms) = args.baseline_from_ms {
        config.baseline_from = config.ms_to_samples(ms);
    }
    if let Some(ms) = args.baseline_to_ms {
        config.baseline_to = config.ms_to_samples(ms);
    }

    if let Some(threshold) = args.artifact_threshold {
        config.artifact_rejection = true;
        config.artifact_threshold = threshold;
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
