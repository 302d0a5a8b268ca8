//! Calibration orchestrator
//!
//! [`CalibrationEngine`] runs the axis modules in a fixed order:
//!
//! 1. Z, per light sheet
//! 2. angle, per light sheet
//! 3. XY, per light sheet
//! 4. power balance
//! 5. Z again, when angle or XY ran, since both move the sheet
//! 6. power balance again
//! 7. width alignment, then height and width power compensation
//!
//! Each step is a bounded convergence loop ([`CalibrationEngine::run_axis`]):
//! calibrate, apply, compare the residual against the axis threshold, and
//! stop after `max_iterations` cycles whether or not it converged.
//! Cancellation is polled before each loop and after every cycle and ends
//! the run with `false`.

use shared::calibration_store::{CalibrationStore, StoreError};
use shared::microscope::{Microscope, TaskConflict, TaskSlot};
use sheet_math::{ArgMaxFinder, SmartArgMaxFinder};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::data::{CalibrationData, DataError};
use crate::modules::{
    AngleCalibration, Axis, CalibrationContext, CalibrationError, PowerCalibration,
    PowerCompensation, SheetDimension, WidthCalibration, XyCalibration, ZCalibration,
};
use crate::positioner::LightSheetPositioner;
use crate::progress::{Progress, ProgressSink, TracingSink};

/// Chart receiving one point per calibrate+apply cycle
pub const CONVERGENCE_CHART: &str = "Convergence";

/// Name under which a calibration run claims the instrument
pub const CALIBRATION_TASK: &str = "calibration";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Busy(#[from] TaskConflict),

    #[error("calibration store error: {0}")]
    Store(#[from] StoreError),

    #[error("calibration record does not fit the instrument: {0}")]
    Data(#[from] DataError),
}

/// Fraction of the full Z range swept at a given iteration
///
/// Halves every iteration: 0.5, 0.25, 0.125, ...
pub fn search_amplitude(iteration: usize) -> f64 {
    0.5f64.powi(1 + iteration.min(i32::MAX as usize - 1) as i32)
}

/// Sequences the axis modules against one instrument
pub struct CalibrationEngine<M: Microscope> {
    microscope: Arc<Mutex<M>>,
    slot: TaskSlot,
    config: EngineConfig,
    z: ZCalibration,
    angle: AngleCalibration,
    xy: XyCalibration,
    power: PowerCalibration,
    width: WidthCalibration,
    height_power: PowerCompensation,
    width_power: PowerCompensation,
    positioners: BTreeMap<(usize, usize), LightSheetPositioner>,
    progress: Progress,
    stop: CancellationToken,
    cancel: CancellationToken,
    store: CalibrationStore,
    sink: Arc<dyn ProgressSink>,
    finder: Arc<dyn ArgMaxFinder>,
}

impl<M: Microscope> CalibrationEngine<M> {
    /// Create an engine sharing `slot` and the global `cancel` signal
    pub fn new(
        microscope: Arc<Mutex<M>>,
        slot: TaskSlot,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let store = match &config.calibration_dir {
            Some(dir) => CalibrationStore::with_path(dir.clone()),
            None => CalibrationStore::default(),
        };
        Self {
            microscope,
            slot,
            config,
            z: ZCalibration::new(),
            angle: AngleCalibration::new(),
            xy: XyCalibration::new(),
            power: PowerCalibration::new(),
            width: WidthCalibration::new(),
            height_power: PowerCompensation::new(SheetDimension::Height),
            width_power: PowerCompensation::new(SheetDimension::Width),
            positioners: BTreeMap::new(),
            progress: Progress::default(),
            stop: CancellationToken::new(),
            cancel,
            store,
            sink: Arc::new(TracingSink),
            finder: Arc::new(SmartArgMaxFinder::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_finder(mut self, finder: Arc<dyn ArgMaxFinder>) -> Self {
        self.finder = finder;
        self
    }

    pub fn with_store(mut self, store: CalibrationStore) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn microscope(&self) -> &Arc<Mutex<M>> {
        &self.microscope
    }

    /// Token raising the engine's own stop request
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Completion fraction of the current or last run
    pub fn progress(&self) -> f64 {
        self.progress.fraction()
    }

    fn should_stop(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }

    fn context<'a>(&self, microscope: &'a mut dyn Microscope) -> CalibrationContext<'a> {
        CalibrationContext {
            microscope,
            sink: Arc::clone(&self.sink),
            finder: Arc::clone(&self.finder),
            timeout_base: self.config.timeout_base(),
            timeout_per_frame: self.config.timeout_per_frame(),
        }
    }

    fn threshold(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Z => self.config.z_threshold,
            Axis::Angle => self.config.angle_threshold,
            Axis::XY => self.config.xy_threshold,
            Axis::Power | Axis::HeightPower | Axis::WidthPower => self.config.power_threshold,
            Axis::Width => self.config.width_threshold,
        }
    }

    fn enabled_light_sheets(&self, microscope: &dyn Microscope) -> Vec<usize> {
        (0..microscope.num_light_sheets())
            .filter(|&l| self.config.is_light_sheet_enabled(l))
            .collect()
    }

    /// Claim the instrument and run the configured sequence
    ///
    /// Returns `Ok(false)` when the run was stopped, cancelled, or aborted
    /// by an acquisition failure, and an error if another task holds the
    /// instrument.
    pub fn run(&mut self) -> Result<bool, EngineError> {
        let _guard = self.slot.try_start(CALIBRATION_TASK)?;
        self.stop.reset();

        let microscope = Arc::clone(&self.microscope);
        let mut microscope = microscope.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.calibrate(&mut *microscope))
    }

    /// Run the calibration sequence on an instrument the caller holds
    pub fn calibrate(&mut self, microscope: &mut dyn Microscope) -> bool {
        let light_sheets = self.enabled_light_sheets(microscope);
        let c = &self.config;
        let (z, angle, xy, power, width, height_power, width_power) = (
            c.calibrate_z,
            c.calibrate_angle,
            c.calibrate_xy,
            c.calibrate_power,
            c.calibrate_width,
            c.calibrate_height_power,
            c.calibrate_width_power,
        );
        let rerun_z = z && (angle || xy);

        let per_sheet_steps = [z, angle, xy, rerun_z, height_power, width_power]
            .iter()
            .filter(|&&enabled| enabled)
            .count();
        let total = per_sheet_steps * light_sheets.len()
            + if power { 2 } else { 0 }
            + usize::from(width);
        self.progress = Progress::new(total);
        self.sink.set_progress(0.0);
        info!(
            "Calibration started: {} light sheets, {} steps",
            light_sheets.len(),
            total
        );

        if z && !self.run_per_light_sheet(microscope, Axis::Z, &light_sheets) {
            return false;
        }
        if angle && !self.run_per_light_sheet(microscope, Axis::Angle, &light_sheets) {
            return false;
        }
        if xy && !self.run_per_light_sheet(microscope, Axis::XY, &light_sheets) {
            return false;
        }
        if power && !self.run_axis(microscope, Axis::Power, None) {
            return false;
        }
        if rerun_z && !self.run_per_light_sheet(microscope, Axis::Z, &light_sheets) {
            return false;
        }
        if power && !self.run_axis(microscope, Axis::Power, None) {
            return false;
        }
        if width && !self.run_axis(microscope, Axis::Width, None) {
            return false;
        }
        if height_power && !self.run_per_light_sheet(microscope, Axis::HeightPower, &light_sheets) {
            return false;
        }
        if width_power && !self.run_per_light_sheet(microscope, Axis::WidthPower, &light_sheets) {
            return false;
        }

        self.update_positioners();
        self.progress.finish(self.sink.as_ref());
        info!("Calibration finished");
        true
    }

    fn run_per_light_sheet(
        &mut self,
        microscope: &mut dyn Microscope,
        axis: Axis,
        light_sheets: &[usize],
    ) -> bool {
        light_sheets
            .iter()
            .all(|&l| self.run_axis(microscope, axis, Some(l)))
    }

    /// Convergence loop for one axis
    ///
    /// Repeats calibrate+apply while the residual is at or above the axis
    /// threshold, at most `max_iterations` times. Hitting the cap is not a
    /// failure. Returns `false` on cancellation or acquisition failure; any
    /// other calibration error counts as an infinite residual for that
    /// cycle. Per-light-sheet axes called without a light sheet use light
    /// sheet 0.
    pub fn run_axis(
        &mut self,
        microscope: &mut dyn Microscope,
        axis: Axis,
        light_sheet: Option<usize>,
    ) -> bool {
        if self.should_stop() {
            info!("Calibration stopped before axis {}", axis);
            return false;
        }

        let threshold = self.threshold(axis);
        let max_iterations = self.config.max_iterations.max(1);
        let series = match light_sheet {
            Some(l) => format!("{axis} LS{l}"),
            None => axis.to_string(),
        };
        self.sink
            .configure_chart(CONVERGENCE_CHART, &series, "iteration", "error");

        let mut iteration = 0;
        let mut last_error;
        loop {
            last_error = match self.calibrate_axis(microscope, axis, light_sheet, iteration) {
                Ok(residual) => residual,
                Err(e) if e.is_acquisition() => {
                    error!(axis = axis.name(), ?light_sheet, "Calibration aborted: {}", e);
                    return false;
                }
                Err(e) => {
                    warn!(axis = axis.name(), ?light_sheet, "Calibration step failed: {}", e);
                    f64::INFINITY
                }
            };

            info!(
                axis = axis.name(),
                ?light_sheet,
                iteration,
                error = last_error,
                "calibration iteration"
            );
            self.sink.add_point(
                CONVERGENCE_CHART,
                &series,
                iteration == 0,
                iteration as f64,
                last_error,
            );
            iteration += 1;

            if self.should_stop() {
                info!("Calibration stopped during axis {}", axis);
                return false;
            }
            if last_error < threshold || iteration >= max_iterations {
                break;
            }
        }

        if last_error >= threshold {
            warn!(
                "Axis {} did not reach {} after {} iterations (error {})",
                series, threshold, iteration, last_error
            );
        }
        self.progress.advance(self.sink.as_ref());
        true
    }

    /// One calibrate+apply cycle, returning the residual
    fn calibrate_axis(
        &mut self,
        microscope: &mut dyn Microscope,
        axis: Axis,
        light_sheet: Option<usize>,
        iteration: usize,
    ) -> Result<f64, CalibrationError> {
        let l = light_sheet.unwrap_or(0);
        match axis {
            Axis::Z => self.calibrate_z(microscope, l, iteration),
            Axis::Angle => self.calibrate_a(microscope, l),
            Axis::XY => self.calibrate_xy(microscope, l),
            Axis::Power => self.calibrate_p(microscope),
            Axis::Width => self.calibrate_w(microscope),
            Axis::HeightPower => self.calibrate_hp(microscope, l),
            Axis::WidthPower => self.calibrate_wp(microscope, l),
        }
    }

    /// Z calibrate+apply with the sweep narrowed for `iteration`
    pub fn calibrate_z(
        &mut self,
        microscope: &mut dyn Microscope,
        light_sheet: usize,
        iteration: usize,
    ) -> Result<f64, CalibrationError> {
        let mut ctx = self.context(microscope);
        self.z
            .calibrate(&mut ctx, light_sheet, search_amplitude(iteration), &self.config)?;
        self.z
            .apply(ctx.microscope.devices_mut(), light_sheet, self.config.adjust_detection_z)
    }

    pub fn calibrate_a(
        &mut self,
        microscope: &mut dyn Microscope,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let mut ctx = self.context(microscope);
        self.angle.calibrate(&mut ctx, light_sheet, &self.config)?;
        self.angle.apply(ctx.microscope.devices_mut(), light_sheet)
    }

    pub fn calibrate_xy(
        &mut self,
        microscope: &mut dyn Microscope,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let mut ctx = self.context(microscope);
        self.xy.calibrate(&mut ctx, light_sheet, &self.config)?;
        self.xy.apply(ctx.microscope.devices_mut(), light_sheet)
    }

    /// Power balance over all enabled light sheets
    pub fn calibrate_p(&mut self, microscope: &mut dyn Microscope) -> Result<f64, CalibrationError> {
        let light_sheets = self.enabled_light_sheets(microscope);
        let mut ctx = self.context(microscope);
        self.power.calibrate(&mut ctx, &light_sheets, &self.config)?;
        self.power.apply(ctx.microscope.devices_mut())
    }

    /// Width alignment over all enabled light sheets
    pub fn calibrate_w(&mut self, microscope: &mut dyn Microscope) -> Result<f64, CalibrationError> {
        let light_sheets = self.enabled_light_sheets(microscope);
        let mut ctx = self.context(microscope);
        self.width.calibrate(&mut ctx, &light_sheets, &self.config)?;
        self.width.apply(ctx.microscope.devices_mut())
    }

    pub fn calibrate_hp(
        &mut self,
        microscope: &mut dyn Microscope,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let mut ctx = self.context(microscope);
        self.height_power.calibrate(&mut ctx, light_sheet, &self.config)?;
        self.height_power.apply(ctx.microscope.devices_mut(), light_sheet)
    }

    pub fn calibrate_wp(
        &mut self,
        microscope: &mut dyn Microscope,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let mut ctx = self.context(microscope);
        self.width_power.calibrate(&mut ctx, light_sheet, &self.config)?;
        self.width_power.apply(ctx.microscope.devices_mut(), light_sheet)
    }

    /// Forget all measurements and reset every device function to identity
    pub fn reset(&mut self) {
        self.z.reset();
        self.angle.reset();
        self.xy.reset();
        self.power.reset();
        self.width.reset();
        self.height_power.reset();
        self.width_power.reset();
        self.positioners.clear();
        self.progress = Progress::default();
        self.microscope
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .devices_mut()
            .reset_functions();
        info!("Calibration reset");
    }

    /// Derive positioners from the XY transforms
    fn update_positioners(&mut self) {
        for ((l, d), transform) in self.xy.transforms() {
            self.positioners
                .insert((l, d), LightSheetPositioner::new(&transform.matrix));
        }
    }

    pub fn positioners(&self) -> &BTreeMap<(usize, usize), LightSheetPositioner> {
        &self.positioners
    }

    pub fn set_positioner(
        &mut self,
        light_sheet: usize,
        detection_arm: usize,
        positioner: LightSheetPositioner,
    ) {
        self.positioners
            .insert((light_sheet, detection_arm), positioner);
    }

    pub fn get_positioner(
        &self,
        light_sheet: usize,
        detection_arm: usize,
    ) -> Option<LightSheetPositioner> {
        self.positioners.get(&(light_sheet, detection_arm)).copied()
    }

    /// Store the current calibration under `name`
    pub fn save(&self, name: &str) -> Result<PathBuf, EngineError> {
        let microscope = self.microscope.lock().unwrap_or_else(|e| e.into_inner());
        let data = CalibrationData::capture(microscope.devices(), &self.xy, &self.positioners);
        let path = self.store.save(name, &data)?;
        info!("Calibration '{}' saved to {}", name, path.display());
        Ok(path)
    }

    /// Load the calibration stored under `name`
    ///
    /// Returns `Ok(false)` when no such record exists.
    pub fn load(&mut self, name: &str) -> Result<bool, EngineError> {
        let _guard = self.slot.try_start("load calibration")?;
        let data = match self.store.load::<CalibrationData>(name) {
            None => {
                info!("No calibration named '{}'", name);
                return Ok(false);
            }
            Some(result) => result?,
        };

        let mut microscope = self.microscope.lock().unwrap_or_else(|e| e.into_inner());
        data.apply_to(microscope.devices_mut())?;
        self.xy.reset();
        data.restore_transforms(&mut self.xy);
        self.positioners = data.positioner_map();
        info!("Calibration '{}' from {} loaded", name, data.created);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingSink;
    use shared::image_proc::ImageStack;
    use shared::microscope::{
        AcquisitionError, AcquisitionQueue, AcquisitionResult, DeviceModel,
    };
    use ndarray::Array3;
    use std::time::Duration;

    /// Returns blank images, so no fit ever finds a peak
    struct BlankMicroscope {
        devices: DeviceModel,
        plays: usize,
        fail: bool,
    }

    impl BlankMicroscope {
        fn new() -> Self {
            Self {
                devices: DeviceModel::new(1, 2),
                plays: 0,
                fail: false,
            }
        }
    }

    impl Microscope for BlankMicroscope {
        fn devices(&self) -> &DeviceModel {
            &self.devices
        }

        fn devices_mut(&mut self) -> &mut DeviceModel {
            &mut self.devices
        }

        fn play_queue(
            &mut self,
            queue: &AcquisitionQueue,
            timeout: Duration,
        ) -> AcquisitionResult<Vec<ImageStack>> {
            self.plays += 1;
            if self.fail {
                return Err(AcquisitionError::Timeout(timeout));
            }
            let planes = queue.camera_frame_count();
            Ok((0..self.devices.num_detection_arms())
                .map(|_| ImageStack::new(Array3::zeros((planes, 8, 8))))
                .collect())
        }
    }

    /// Raises a token after a given number of convergence points
    struct CancelAfter {
        token: CancellationToken,
        after: usize,
        seen: Mutex<usize>,
    }

    impl ProgressSink for CancelAfter {
        fn add_point(&self, chart: &str, _series: &str, _clear: bool, _x: f64, _y: f64) {
            if chart != CONVERGENCE_CHART {
                return;
            }
            let mut seen = self.seen.lock().unwrap();
            *seen += 1;
            if *seen == self.after {
                self.token.cancel();
            }
        }
    }

    fn engine(config: EngineConfig) -> CalibrationEngine<BlankMicroscope> {
        CalibrationEngine::new(
            Arc::new(Mutex::new(BlankMicroscope::new())),
            TaskSlot::new(),
            config,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_search_amplitude_halves() {
        assert_eq!(search_amplitude(0), 0.5);
        assert_eq!(search_amplitude(1), 0.25);
        assert_eq!(search_amplitude(2), 0.125);
    }

    #[test]
    fn test_unconverged_axis_runs_exactly_max_iterations() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = engine(EngineConfig::default()).with_sink(sink.clone());

        let mut microscope = BlankMicroscope::new();
        let completed = engine.run_axis(&mut microscope, Axis::Z, Some(0));

        assert!(completed);
        let points = sink.series(CONVERGENCE_CHART);
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.y == f64::INFINITY));
        // three illumination positions per cycle
        assert_eq!(microscope.plays, 9);
    }

    #[test]
    fn test_cancel_between_iterations_returns_false() {
        let cancel = CancellationToken::new();
        let sink = Arc::new(CancelAfter {
            token: cancel.clone(),
            after: 1,
            seen: Mutex::new(0),
        });
        let mut engine = CalibrationEngine::new(
            Arc::new(Mutex::new(BlankMicroscope::new())),
            TaskSlot::new(),
            EngineConfig::default(),
            cancel,
        )
        .with_sink(sink.clone());

        let mut microscope = BlankMicroscope::new();
        let completed = engine.run_axis(&mut microscope, Axis::Z, Some(0));

        assert!(!completed);
        assert_eq!(*sink.seen.lock().unwrap(), 1);
        assert_eq!(microscope.plays, 3);
    }

    #[test]
    fn test_cancel_before_axis_does_nothing() {
        let mut engine = engine(EngineConfig::default());
        engine.stop_token().cancel();

        let mut microscope = BlankMicroscope::new();
        assert!(!engine.run_axis(&mut microscope, Axis::Z, Some(0)));
        assert_eq!(microscope.plays, 0);
    }

    #[test]
    fn test_acquisition_failure_aborts_axis() {
        let mut engine = engine(EngineConfig::default());
        let mut microscope = BlankMicroscope::new();
        microscope.fail = true;

        assert!(!engine.run_axis(&mut microscope, Axis::Angle, Some(0)));
        assert_eq!(microscope.plays, 1);
    }

    #[test]
    fn test_run_refused_while_instrument_busy() {
        let slot = TaskSlot::new();
        let mut engine = CalibrationEngine::new(
            Arc::new(Mutex::new(BlankMicroscope::new())),
            slot.clone(),
            EngineConfig::default(),
            CancellationToken::new(),
        );

        let _adaptation = slot.try_start("adaptation").unwrap();
        match engine.run() {
            Err(EngineError::Busy(conflict)) => assert_eq!(conflict.holder, "adaptation"),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn test_run_publishes_monotonic_progress() {
        let sink = Arc::new(RecordingSink::new());
        let config = EngineConfig {
            calibrate_power: true,
            ..EngineConfig::default()
        };
        let mut engine = engine(config).with_sink(sink.clone());

        assert!(engine.run().unwrap());

        let history = sink.progress_history();
        assert!(history.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(history.last(), Some(&1.0));
        assert_eq!(engine.progress(), 1.0);
        // Z once per light sheet plus the two power steps
        assert_eq!(history.len(), 1 + 3 + 1);
    }

    #[test]
    fn test_set_and_get_positioner() {
        let mut engine = engine(EngineConfig::default());
        assert!(engine.positioners().is_empty());

        engine.set_positioner(0, 1, LightSheetPositioner::identity());
        assert_eq!(
            engine.get_positioner(0, 1),
            Some(LightSheetPositioner::identity())
        );
        assert!(engine.get_positioner(1, 0).is_none());
    }

    #[test]
    fn test_load_missing_record_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(EngineConfig::default())
            .with_store(CalibrationStore::with_path(dir.path().to_path_buf()));

        assert!(!engine.load("absent").unwrap());
    }
}
