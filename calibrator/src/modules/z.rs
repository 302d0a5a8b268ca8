//! Light-sheet Z calibration
//!
//! At a few light-sheet Z positions the detection Z is swept and the sharpest
//! plane located on every detection arm. The in-focus detection Z as a
//! function of light-sheet Z is a line `dz* = slope·iz + offset`; applying
//! the calibration composes the inverse of that line onto the light-sheet Z
//! function so that equal control values on sheet and detection are in
//! focus.

use shared::image_proc::{dcts_per_plane, DCTS_DEFAULT_PSF_SUPPORT};
use shared::microscope::{AffineFunction, DeviceModel, LightSheetDof};
use sheet_math::Polynomial;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{linspace, CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

/// Focus lines flatter than this cannot be inverted reliably
const MIN_FOCUS_SLOPE: f64 = 0.1;

const CHART: &str = "Z focus";

/// In-focus detection Z as a function of light-sheet Z
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusLine {
    pub slope: f64,
    pub offset: f64,
}

impl FocusLine {
    /// Fit a line through `(light-sheet Z, in-focus detection Z)` pairs
    ///
    /// A single pair can only fix the offset, so the slope is taken as 1.
    pub fn from_samples(samples: &[(f64, f64)]) -> Option<Self> {
        match samples {
            [] => None,
            [(iz, dz)] => Some(Self {
                slope: 1.0,
                offset: dz - iz,
            }),
            _ => {
                let x: Vec<f64> = samples.iter().map(|s| s.0).collect();
                let y: Vec<f64> = samples.iter().map(|s| s.1).collect();
                let line = Polynomial::fit(&x, &y, 1).ok()?;
                let c = line.coefficients();
                let fitted = Self {
                    slope: c[1],
                    offset: c[0],
                };
                (fitted.slope.abs() >= MIN_FOCUS_SLOPE).then_some(fitted)
            }
        }
    }
}

/// Z calibration state, one entry per calibrated light sheet
#[derive(Debug, Default)]
pub struct ZCalibration {
    focus_lines: HashMap<usize, Vec<Option<FocusLine>>>,
}

impl ZCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-arm focus lines measured for `light_sheet` and not yet applied
    pub fn focus_lines(&self, light_sheet: usize) -> Option<&[Option<FocusLine>]> {
        self.focus_lines.get(&light_sheet).map(|v| v.as_slice())
    }

    /// Sweep detection Z at several light-sheet Z positions
    ///
    /// `search_amplitude` scales the sweep: at `0.5` the sweep covers the
    /// full detection range around each light-sheet position.
    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        search_amplitude: f64,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        let devices = ctx.microscope.devices();
        let sheet_z = devices.light_sheet(light_sheet)?.z;
        let detection_z = devices.detection_arm(0)?.z;
        let num_arms = devices.num_detection_arms();

        let excursion = 0.25 * sheet_z.max_symmetric_excursion();
        let positions = if config.z_illumination_positions <= 1 {
            vec![0.0]
        } else {
            linspace(-excursion, excursion, config.z_illumination_positions)
        };
        let half_range = search_amplitude * detection_z.span();

        let mut samples: Vec<Vec<(f64, f64)>> = vec![Vec::new(); num_arms];
        for &iz in &positions {
            let iz = sheet_z.constrain(iz);
            let sweep = linspace(
                detection_z.constrain(iz - half_range),
                detection_z.constrain(iz + half_range),
                config.z_samples.max(3),
            );

            let mut queue = ctx.microscope.build_queue();
            let frame = queue.current_mut();
            frame.selected_light_sheet = light_sheet;
            frame.camera_on = true;
            frame.set(light_sheet, LightSheetDof::Z, iz);
            for &dz in &sweep {
                queue.current_mut().set_all_detection_z(dz);
                queue.add_current_state();
            }

            let stacks = ctx.play(&queue)?;

            for (arm, arm_samples) in samples.iter_mut().enumerate() {
                let stack = CalibrationContext::arm_stack(&stacks, arm, sweep.len())?;
                let metric = dcts_per_plane(stack, DCTS_DEFAULT_PSF_SUPPORT);

                let series = format!("LS{light_sheet} D{arm} IZ={iz:.2}");
                ctx.sink.configure_chart(CHART, &series, "detection Z", "DCTS");
                for (i, (&dz, &m)) in sweep.iter().zip(&metric).enumerate() {
                    ctx.sink.add_point(CHART, &series, i == 0, dz, m);
                }

                let fit = ctx.finder.argmax_or_fallback(&sweep, &metric);
                debug!(
                    light_sheet,
                    arm,
                    iz,
                    argmax = fit.argmax,
                    probability = fit.probability,
                    "Z sweep fitted"
                );
                if fit.probability > 0.0 {
                    arm_samples.push((iz, fit.argmax));
                } else {
                    warn!(
                        "No focus peak for light sheet {} on detection arm {} at IZ={:.2}",
                        light_sheet, arm, iz
                    );
                }
            }
        }

        let lines = samples
            .iter()
            .map(|s| FocusLine::from_samples(s))
            .collect();
        self.focus_lines.insert(light_sheet, lines);
        Ok(())
    }

    /// Compose the measured correction onto the Z functions
    ///
    /// With `adjust_detection_z` set and `light_sheet == 0`, each detection
    /// arm's Z function is also shifted so all arms focus on the same plane.
    /// Returns `|offset| + |1 - slope|` of the mean focus line, or infinity
    /// when nothing usable was measured.
    pub fn apply(
        &mut self,
        devices: &mut DeviceModel,
        light_sheet: usize,
        adjust_detection_z: bool,
    ) -> Result<f64, CalibrationError> {
        let Some(lines) = self.focus_lines.remove(&light_sheet) else {
            warn!("Z apply for light sheet {} without a calibration", light_sheet);
            return Ok(f64::INFINITY);
        };

        let usable: Vec<(usize, FocusLine)> = lines
            .iter()
            .enumerate()
            .filter_map(|(arm, line)| line.map(|l| (arm, l)))
            .collect();
        if usable.is_empty() {
            warn!("No usable focus data for light sheet {}", light_sheet);
            return Ok(f64::INFINITY);
        }

        let n = usable.len() as f64;
        let slope = usable.iter().map(|(_, l)| l.slope).sum::<f64>() / n;
        let offset = usable.iter().map(|(_, l)| l.offset).sum::<f64>() / n;

        devices
            .light_sheet_mut(light_sheet)?
            .function_mut(LightSheetDof::Z)
            .compose_with(&AffineFunction::axplusb(1.0 / slope, -offset / slope));

        if adjust_detection_z && light_sheet == 0 {
            for (arm, line) in &usable {
                devices
                    .detection_arm_mut(*arm)?
                    .z_function
                    .compose_with(&AffineFunction::axplusb(1.0, line.offset - offset));
            }
        }

        info!(
            "Z light sheet {}: focus slope {:.4}, offset {:.4}",
            light_sheet, slope, offset
        );
        Ok(offset.abs() + (1.0 - slope).abs())
    }

    pub fn reset(&mut self) {
        self.focus_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TracingSink;
    use approx::assert_relative_eq;
    use shared::microscope::{Microscope, SimulatedMicroscope, SimulationParams};
    use sheet_math::SmartArgMaxFinder;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(microscope: &mut SimulatedMicroscope) -> CalibrationContext<'_> {
        CalibrationContext {
            microscope,
            sink: Arc::new(TracingSink),
            finder: Arc::new(SmartArgMaxFinder::default()),
            timeout_base: Duration::from_secs(10),
            timeout_per_frame: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_focus_line_from_samples() {
        let line = FocusLine::from_samples(&[(-10.0, -13.0), (0.0, -3.0), (10.0, 7.0)]).unwrap();
        assert_relative_eq!(line.slope, 1.0, epsilon = 1e-9);
        assert_relative_eq!(line.offset, -3.0, epsilon = 1e-9);

        let single = FocusLine::from_samples(&[(2.0, 1.5)]).unwrap();
        assert_relative_eq!(single.slope, 1.0);
        assert_relative_eq!(single.offset, -0.5);

        assert!(FocusLine::from_samples(&[]).is_none());
        assert!(FocusLine::from_samples(&[(-1.0, 4.0), (1.0, 4.0)]).is_none());
    }

    #[test]
    fn test_apply_inverts_focus_line() {
        let mut devices = DeviceModel::new(1, 2);
        let mut z = ZCalibration::new();
        z.focus_lines.insert(
            0,
            vec![
                Some(FocusLine {
                    slope: 1.0,
                    offset: -3.0,
                }),
                Some(FocusLine {
                    slope: 1.0,
                    offset: -1.5,
                }),
            ],
        );

        let error = z.apply(&mut devices, 0, true).unwrap();

        assert_relative_eq!(error, 2.25);
        assert_relative_eq!(devices.light_sheets[0].functions.z.offset, 2.25);
        assert_relative_eq!(devices.detection_arms[0].z_function.offset, -0.75);
        assert_relative_eq!(devices.detection_arms[1].z_function.offset, 0.75);
        // consumed by apply
        assert!(z.focus_lines(0).is_none());
    }

    #[test]
    fn test_apply_without_data_changes_nothing() {
        let mut devices = DeviceModel::new(1, 1);
        let mut z = ZCalibration::new();
        z.focus_lines.insert(0, vec![None]);

        assert_eq!(z.apply(&mut devices, 0, true).unwrap(), f64::INFINITY);
        assert_eq!(devices.light_sheets[0].functions.z, AffineFunction::IDENTITY);
        assert_eq!(z.apply(&mut devices, 0, true).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_calibrate_reduces_defocus() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        let config = EngineConfig::default();
        let mut z = ZCalibration::new();
        let before = microscope.residual_defocus(0, 0, 0.0).abs();

        for amplitude in [0.5, 0.25] {
            let mut ctx = context(&mut microscope);
            z.calibrate(&mut ctx, 0, amplitude, &config).unwrap();
            z.apply(microscope.devices_mut(), 0, true).unwrap();
        }

        let after = microscope.residual_defocus(0, 0, 0.0).abs();
        assert!(after < before, "defocus {before} -> {after}");
        assert!(after < 1.5, "defocus after calibration {after}");
    }
}
