//! End-to-end tests of the averaging controller and its consumer thread

use crossbeam::channel::Receiver;
use evoked_rt::{
    AverageMode, AveragingConfig, AveragingController, AveragingEvent, BlockSource,
    ControllerConfig, DropReason, EvokedResult, SyntheticConfig, SyntheticSource, WindowerState,
};
use ndarray::{s, Array2};
use std::sync::Arc;
use std::time::Duration;

const PRE: usize = 5;
const POST: usize = 10;
const DRAIN: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(mode: AverageMode, num_averages: u32) -> AveragingConfig {
    AveragingConfig {
        sampling_rate: 1000.0,
        channel_names: vec!["EEG 001".into(), "STI 001".into()],
        pre_stim_samples: PRE,
        post_stim_samples: POST,
        num_averages,
        average_mode: mode,
        trigger_channels: vec![1],
        trigger_threshold: 0.5,
        baseline_from: -(PRE as i64),
        baseline_to: 0,
        ..AveragingConfig::default()
    }
}

/// Row 0 holds `value` over each epoch window, row 1 a one-sample pulse
fn stream(len: usize, epochs: &[(usize, f64)]) -> Array2<f64> {
    let mut data = Array2::zeros((2, len));
    for &(trigger, value) in epochs {
        data.slice_mut(s![0, trigger - PRE..trigger + POST]).fill(value);
        data[[1, trigger]] = 1.0;
    }
    data
}

fn engine(config: AveragingConfig) -> AveragingController {
    init_logging();
    let engine = AveragingController::new(ControllerConfig {
        buffer_capacity: 4,
        ..ControllerConfig::new(config)
    })
    .unwrap();
    engine.start().unwrap();
    engine
}

fn feed(engine: &AveragingController, data: &Array2<f64>, chunk: usize) {
    let mut start = 0;
    while start < data.ncols() {
        let end = (start + chunk).min(data.ncols());
        engine.append(data.slice(s![.., start..end]).to_owned()).unwrap();
        start = end;
    }
    assert!(engine.wait_until_drained(DRAIN), "consumer did not drain");
}

fn evoked(rx: &Receiver<AveragingEvent>) -> Vec<Arc<EvokedResult>> {
    rx.try_iter()
        .filter_map(|event| match event {
            AveragingEvent::Evoked(result) => Some(result),
            _ => None,
        })
        .collect()
}

#[test]
fn test_cumulative_average_of_three_constant_epochs() {
    let engine = engine(config(AverageMode::Cumulative, 3));
    let rx = engine.subscribe();

    feed(&engine, &stream(150, &[(20, 1.0), (60, 2.0), (100, 3.0)]), 7);
    let results = evoked(&rx);

    assert_eq!(results.len(), 3);
    let last = &results[2];
    assert_eq!(last.count_calculated_averages, 3);
    assert!(last.cycle_complete);
    assert_eq!(last.average.ncols(), PRE + POST);
    assert!(last.average.row(0).iter().all(|v| (v - 2.0).abs() < 1e-12));
    assert_eq!(last.trigger_position, 100);

    // The cycle restarted
    assert_eq!(engine.count_calculated_averages(), 0);
    engine.stop().unwrap();
}

#[test]
fn test_running_average_emits_on_every_epoch() {
    let engine = engine(config(AverageMode::Running, 2));
    let rx = engine.subscribe();

    feed(&engine, &stream(200, &[(20, 1.0), (60, 2.0), (100, 3.0), (140, 3.0)]), 16);
    let results = evoked(&rx);

    let counts: Vec<u32> = results.iter().map(|r| r.count_calculated_averages).collect();
    assert_eq!(counts, vec![1, 2, 2, 2]);
    assert!(results.iter().all(|r| !r.cycle_complete));
    // 2.25 + (3 - 2.25) / 2
    assert!((results[3].average[[0, 0]] - 2.625).abs() < 1e-12);
    engine.stop().unwrap();
}

#[test]
fn test_artifact_epoch_is_rejected_without_counting() {
    let mut config = config(AverageMode::Cumulative, 10);
    config.artifact_rejection = true;
    config.artifact_threshold = 5.0;
    let engine = engine(config);
    let rx = engine.subscribe();

    let mut data = stream(150, &[(20, 1.0), (60, 1.0), (100, 1.0)]);
    data[[0, 63]] = 10.0;
    feed(&engine, &data, 25);

    let events: Vec<AveragingEvent> = rx.try_iter().collect();
    let rejected: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            AveragingEvent::EpochRejected {
                trigger_position,
                peak,
            } => {
                assert_eq!(*peak, 10.0);
                Some(*trigger_position)
            }
            _ => None,
        })
        .collect();
    assert_eq!(rejected, vec![60]);

    assert_eq!(engine.count_calculated_averages(), 2);
    let stats = engine.stats();
    assert_eq!(stats.epochs_completed, 3);
    assert_eq!(stats.epochs_rejected, 1);
    assert_eq!(stats.evoked_emitted, 2);
    engine.stop().unwrap();
}

#[test]
fn test_non_finite_epochs_never_reach_running_average() {
    let mut config = config(AverageMode::Running, 3);
    config.artifact_rejection = true;
    config.artifact_threshold = 5.0;
    let engine = engine(config);
    let rx = engine.subscribe();

    let mut data = stream(200, &[(20, 1.0), (60, 1.0), (100, 1.0), (140, 1.0)]);
    data[[0, 62]] = f64::NAN;
    data[[0, 104]] = f64::INFINITY;
    feed(&engine, &data, 20);

    let events: Vec<AveragingEvent> = rx.try_iter().collect();
    let rejected: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            AveragingEvent::EpochRejected {
                trigger_position, ..
            } => Some(*trigger_position),
            _ => None,
        })
        .collect();
    assert_eq!(rejected, vec![60, 100]);

    let results = evoked_from(&events);
    assert_eq!(results.len(), 2);
    let last = &results[1];
    assert_eq!(last.count_calculated_averages, 2);
    assert!(last.average.iter().all(|v| v.is_finite()));
    assert!(last.average.row(0).iter().all(|v| (v - 1.0).abs() < 1e-12));
    engine.stop().unwrap();
}

#[test]
fn test_baseline_corrected_average_has_zero_baseline() {
    let mut config = config(AverageMode::Running, 5);
    config.baseline_correction = true;
    config.baseline_from = -4;
    config.baseline_to = 0;
    let engine = engine(config);
    let rx = engine.subscribe();

    let mut data = stream(100, &[(30, 0.0)]);
    for i in 0..100 {
        data[[0, i]] = 7.0 + 0.25 * i as f64;
    }
    feed(&engine, &data, 10);

    let results = evoked(&rx);
    assert_eq!(results.len(), 1);
    for row in results[0].average.rows() {
        let mean = row.slice(s![1..5]).mean().unwrap();
        assert!(mean.abs() < 1e-9, "baseline mean {}", mean);
    }
    engine.stop().unwrap();
}

#[test]
fn test_overlapping_triggers_are_reported() {
    let engine = engine(config(AverageMode::Running, 10));
    let rx = engine.subscribe();

    let mut data = stream(120, &[(20, 1.0)]);
    data[[1, 23]] = 1.0;
    data[[1, 26]] = 1.0;
    feed(&engine, &data, 120);

    let events: Vec<AveragingEvent> = rx.try_iter().collect();
    let dropped: Vec<(u64, DropReason)> = events
        .iter()
        .filter_map(|e| match e {
            AveragingEvent::TriggerDropped { position, reason } => Some((*position, *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![(26, DropReason::Overlapping)]);

    let positions: Vec<u64> = evoked_from(&events).iter().map(|r| r.trigger_position).collect();
    assert_eq!(positions, vec![20, 23]);

    let stats = engine.stats();
    assert_eq!(stats.triggers_detected, 3);
    assert_eq!(stats.overlapping_triggers, 1);
    engine.stop().unwrap();
}

fn evoked_from(events: &[AveragingEvent]) -> Vec<Arc<EvokedResult>> {
    events
        .iter()
        .filter_map(|event| match event {
            AveragingEvent::Evoked(result) => Some(result.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_mid_epoch_reconfiguration_waits_for_idle() {
    let engine = engine(config(AverageMode::Running, 4));
    let rx = engine.subscribe();
    let data = stream(200, &[(20, 1.0), (80, 2.0)]);

    // Open the first window and leave it accumulating
    feed(&engine, &data.slice(s![.., 0..24]).to_owned(), 24);
    assert!(matches!(
        engine.windower_state(),
        WindowerState::AccumulatingPost {
            trigger_position: 20,
            ..
        }
    ));

    engine.set_num_averages(1).unwrap();
    engine.set_pre_stim_samples(8).unwrap();
    assert_eq!(engine.config().pre_stim_samples, 8);
    assert_eq!(engine.active_config().pre_stim_samples, PRE);

    feed(&engine, &data.slice(s![.., 24..200]).to_owned(), 30);
    let results = evoked(&rx);
    assert_eq!(results.len(), 2);

    // First epoch keeps the settings it opened with
    assert_eq!(results[0].num_averages, 4);
    assert_eq!(results[0].pre_stim_samples, PRE);
    assert_eq!(results[0].average.ncols(), PRE + POST);

    // The next one uses the new settings
    assert_eq!(results[1].num_averages, 1);
    assert_eq!(results[1].pre_stim_samples, 8);
    assert_eq!(results[1].average.ncols(), 8 + POST);
    assert_eq!(engine.active_config().pre_stim_samples, 8);
    engine.stop().unwrap();
}

#[test]
fn test_reset_keeps_config_and_reproduces_output() {
    let engine = engine(config(AverageMode::Running, 3));
    let rx = engine.subscribe();
    engine.set_num_averages(2).unwrap();

    let data = stream(200, &[(20, 1.0), (60, 4.0), (100, 2.0), (140, 8.0)]);
    feed(&engine, &data, 13);
    let first = evoked(&rx);

    engine.reset();
    assert_eq!(engine.count_calculated_averages(), 0);
    assert_eq!(engine.config().num_averages, 2);

    feed(&engine, &data, 13);
    let second = evoked(&rx);

    assert_eq!(first.len(), 4);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.trigger_position, b.trigger_position);
        assert_eq!(a.count_calculated_averages, b.count_calculated_averages);
        assert_eq!(a.average, b.average);
    }
    engine.stop().unwrap();
}

#[test]
fn test_restart_after_stop() {
    let engine = engine(config(AverageMode::Running, 3));
    let rx = engine.subscribe();

    feed(&engine, &stream(60, &[(20, 1.0)]), 60);
    engine.stop().unwrap();
    assert!(engine.append(Array2::zeros((2, 5))).is_err());

    engine.start().unwrap();
    let data = stream(60, &[(30, 5.0)]);
    feed(&engine, &data, 20);

    let results = evoked(&rx);
    assert_eq!(results.len(), 2);
    // Positions continue across the restart
    assert_eq!(results[1].trigger_position, 90);
    assert_eq!(results[1].count_calculated_averages, 2);
    engine.stop().unwrap();
}

#[test]
fn test_state_events_and_stats() {
    let engine = AveragingController::new(ControllerConfig::new(config(AverageMode::Running, 3)))
        .unwrap();
    let rx = engine.subscribe();

    engine.start().unwrap();
    feed(&engine, &stream(100, &[(50, 1.0)]), 10);
    engine.stop().unwrap();

    let states: Vec<bool> = rx
        .try_iter()
        .filter_map(|e| match e {
            AveragingEvent::StateChanged(state) => {
                Some(matches!(state, evoked_rt::EngineState::Running { .. }))
            }
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![true, false]);

    let stats = engine.stats();
    assert_eq!(stats.blocks_received, 10);
    assert_eq!(stats.blocks_processed, 10);
    assert_eq!(stats.samples_processed, 100);
    assert_eq!(stats.buffer.total_pushed, 10);
    assert!(stats.uptime_seconds.is_none());
}

#[test]
fn test_synthetic_source_recovers_response() {
    init_logging();
    let mut source = SyntheticSource::new(SyntheticConfig {
        seed: 7,
        max_blocks: Some(140),
        ..Default::default()
    })
    .unwrap();

    let mut averaging = source.metadata().averaging_config();
    averaging.average_mode = AverageMode::Cumulative;
    averaging.num_averages = 1000;

    let engine = AveragingController::new(ControllerConfig::new(averaging)).unwrap();
    let rx = engine.subscribe();
    engine.start().unwrap();

    while let Some(block) = source.next_block().unwrap() {
        engine.append_block(block).unwrap();
    }
    assert!(engine.wait_until_drained(DRAIN));

    let results = evoked(&rx);
    let expected_epochs = source
        .stimulus_positions(14_000)
        .iter()
        .filter(|&&p| p + 400 <= 14_000)
        .count();
    assert_eq!(results.len(), expected_epochs);

    let last = results.last().unwrap();
    let pre = last.pre_stim_samples;
    for elapsed in [10u64, 25, 60] {
        let averaged = last.average[[0, pre + elapsed as usize]];
        let truth = source.response(0, elapsed);
        assert!(
            (averaged - truth).abs() < 1.5,
            "sample {}: averaged {} vs {}",
            elapsed,
            averaged,
            truth
        );
    }
    engine.stop().unwrap();
}
