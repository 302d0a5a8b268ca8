//! Saving and loading calibration records through the engine

use calibrator::engine::{CalibrationEngine, EngineError};
use calibrator::positioner::LightSheetPositioner;
use calibrator::{CancellationToken, EngineConfig};
use shared::calibration_store::CalibrationStore;
use shared::microscope::{Microscope, SimulatedMicroscope, SimulationParams, TaskSlot};
use std::sync::{Arc, Mutex};

fn engine_with_store(
    params: SimulationParams,
    config: EngineConfig,
    store: &CalibrationStore,
) -> (
    CalibrationEngine<SimulatedMicroscope>,
    Arc<Mutex<SimulatedMicroscope>>,
) {
    let microscope = Arc::new(Mutex::new(SimulatedMicroscope::new(params)));
    let engine = CalibrationEngine::new(
        microscope.clone(),
        TaskSlot::new(),
        config,
        CancellationToken::new(),
    )
    .with_store(store.clone());
    (engine, microscope)
}

#[test]
fn test_save_then_load_reproduces_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::with_path(dir.path().to_path_buf());
    let config = EngineConfig {
        calibrate_xy: true,
        calibrate_height_power: true,
        ..EngineConfig::default()
    };

    let (mut calibrated, calibrated_microscope) =
        engine_with_store(SimulationParams::default(), config.clone(), &store);
    assert!(calibrated.run().unwrap());
    calibrated.set_positioner(1, 1, LightSheetPositioner::new(&nalgebra::Matrix2::new(
        0.1 + 0.2,
        1.0 / 3.0,
        -1e-300,
        2.0f64.sqrt(),
    )));
    let path = calibrated.save("bench").unwrap();
    assert!(path.exists());

    let (mut fresh, fresh_microscope) =
        engine_with_store(SimulationParams::default(), config, &store);
    assert!(fresh.load("bench").unwrap());

    assert_eq!(
        fresh_microscope.lock().unwrap().devices(),
        calibrated_microscope.lock().unwrap().devices()
    );
    let expected = calibrated.positioners().clone();
    assert_eq!(fresh.positioners(), &expected);
    let restored = fresh.get_positioner(1, 1).unwrap();
    assert_eq!(restored.matrix[0].to_bits(), (0.1f64 + 0.2).to_bits());
    assert_eq!(restored.matrix[2].to_bits(), (-1e-300f64).to_bits());
}

#[test]
fn test_load_missing_record_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::with_path(dir.path().to_path_buf());
    let (mut engine, microscope) =
        engine_with_store(SimulationParams::default(), EngineConfig::default(), &store);
    let before = microscope.lock().unwrap().devices().clone();

    assert!(!engine.load("never-saved").unwrap());
    assert_eq!(microscope.lock().unwrap().devices(), &before);
}

#[test]
fn test_load_rejects_other_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::with_path(dir.path().to_path_buf());
    let (two_sheets, _) =
        engine_with_store(SimulationParams::default(), EngineConfig::default(), &store);
    two_sheets.save("two").unwrap();

    let mut params = SimulationParams::default();
    params.sheets.push(params.sheets[0].clone());
    let (mut three_sheets, microscope) = engine_with_store(params, EngineConfig::default(), &store);

    assert!(matches!(three_sheets.load("two"), Err(EngineError::Data(_))));
    assert_eq!(microscope.lock().unwrap().num_light_sheets(), 3);
}

#[test]
fn test_reset_returns_to_identity() {
    let dir = tempfile::tempdir().unwrap();
    let store = CalibrationStore::with_path(dir.path().to_path_buf());
    let (mut engine, microscope) =
        engine_with_store(SimulationParams::default(), EngineConfig::default(), &store);

    assert!(engine.run().unwrap());
    assert_ne!(microscope.lock().unwrap().devices().light_sheets[0].functions.z.offset, 0.0);

    engine.set_positioner(0, 0, LightSheetPositioner::identity());
    engine.reset();

    let devices = microscope.lock().unwrap().devices().clone();
    assert_eq!(devices, shared::microscope::DeviceModel::new(2, 2));
    assert!(engine.get_positioner(0, 0).is_none());
    assert_eq!(engine.progress(), 0.0);
}
