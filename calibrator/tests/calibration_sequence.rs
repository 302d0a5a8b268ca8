//! End-to-end calibration runs against the simulated microscope

use calibrator::engine::{CalibrationEngine, CONVERGENCE_CHART};
use calibrator::progress::RecordingSink;
use calibrator::{CancellationToken, EngineConfig};
use shared::microscope::{
    LightSheetFunctions, Microscope, SimulatedMicroscope, SimulationParams, TaskSlot,
};
use std::sync::{Arc, Mutex};

fn simulated_engine(
    config: EngineConfig,
    sink: Arc<RecordingSink>,
) -> (
    CalibrationEngine<SimulatedMicroscope>,
    Arc<Mutex<SimulatedMicroscope>>,
) {
    let microscope = Arc::new(Mutex::new(SimulatedMicroscope::new(SimulationParams::default())));
    let engine = CalibrationEngine::new(
        microscope.clone(),
        TaskSlot::new(),
        config,
        CancellationToken::new(),
    )
    .with_sink(sink);
    (engine, microscope)
}

fn series_lengths(sink: &RecordingSink) -> Vec<(String, usize)> {
    let mut lengths: Vec<(String, usize)> = Vec::new();
    for point in sink.series(CONVERGENCE_CHART) {
        match lengths.last_mut() {
            Some((series, n)) if *series == point.series && point.x > 0.0 => *n += 1,
            _ => lengths.push((point.series.clone(), 1)),
        }
    }
    lengths
}

#[test]
fn test_zero_threshold_runs_every_axis_to_the_cap() {
    let config = EngineConfig {
        z_threshold: 0.0,
        ..EngineConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, microscope) = simulated_engine(config, sink.clone());

    assert!(engine.run().unwrap());

    assert_eq!(
        series_lengths(&sink),
        vec![("Z LS0".to_string(), 3), ("Z LS1".to_string(), 3)]
    );
    let microscope = microscope.lock().unwrap();
    for l in 0..2 {
        let defocus = microscope.residual_defocus(l, 0, 0.0);
        assert!(defocus.abs() < 1.5, "light sheet {l}: {defocus}");
    }
}

#[test]
fn test_full_sequence_order_and_progress() {
    let config = EngineConfig {
        calibrate_angle: true,
        calibrate_xy: true,
        calibrate_power: true,
        ..EngineConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, microscope) = simulated_engine(config, sink.clone());

    assert!(engine.run().unwrap());

    let order: Vec<String> = series_lengths(&sink).into_iter().map(|(s, _)| s).collect();
    assert_eq!(
        order,
        vec![
            "Z LS0", "Z LS1", "A LS0", "A LS1", "XY LS0", "XY LS1", "P", "Z LS0", "Z LS1", "P",
        ]
    );
    // the power balance runs a second time after the second Z pass
    assert_eq!(order.iter().filter(|s| *s == "P").count(), 2);

    let history = sink.progress_history();
    assert!(history.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(history.last(), Some(&1.0));

    let positioners = engine.positioners().clone();
    assert_eq!(positioners.len(), 4);

    let microscope = microscope.lock().unwrap();
    for l in 0..2 {
        let alpha = microscope.residual_alpha(l);
        assert!(alpha.abs() < 1.0, "light sheet {l}: {alpha}");
    }
}

#[test]
fn test_skipped_light_sheet_is_left_alone() {
    let config = EngineConfig {
        skipped_light_sheets: vec![1],
        ..EngineConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, microscope) = simulated_engine(config, sink.clone());

    assert!(engine.run().unwrap());

    let order: Vec<String> = series_lengths(&sink).into_iter().map(|(s, _)| s).collect();
    assert_eq!(order, vec!["Z LS0"]);
    let microscope = microscope.lock().unwrap();
    assert_eq!(
        microscope.devices().light_sheets[1].functions,
        LightSheetFunctions::default()
    );
}

#[test]
fn test_width_with_one_light_sheet_converges_at_once() {
    let config = EngineConfig {
        calibrate_z: false,
        calibrate_width: true,
        skipped_light_sheets: vec![1],
        ..EngineConfig::default()
    };
    let sink = Arc::new(RecordingSink::new());
    let (mut engine, microscope) = simulated_engine(config, sink.clone());

    assert!(engine.run().unwrap());

    let points = sink.series(CONVERGENCE_CHART);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].series, "W");
    assert_eq!(points[0].y, 0.0);
    // a single width sweep
    assert_eq!(microscope.lock().unwrap().plays(), 1);
}

#[test]
fn test_cancel_before_run_returns_false() {
    let sink = Arc::new(RecordingSink::new());
    let cancel = CancellationToken::new();
    let microscope = Arc::new(Mutex::new(SimulatedMicroscope::new(SimulationParams::default())));
    let mut engine = CalibrationEngine::new(
        microscope.clone(),
        TaskSlot::new(),
        EngineConfig::default(),
        cancel.clone(),
    )
    .with_sink(sink.clone());

    cancel.cancel();

    assert!(!engine.run().unwrap());
    assert!(sink.series(CONVERGENCE_CHART).is_empty());
    assert_eq!(microscope.lock().unwrap().plays(), 0);
    assert!(engine.progress() < 1.0);
}
