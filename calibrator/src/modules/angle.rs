//! Light-sheet angle calibration
//!
//! Sweeps the light-sheet angle symmetrically around zero, averaging several
//! repeats per angle, and locates the angle giving the sharpest image. The
//! peak is composed onto the angle function as an offset.

use shared::image_proc::{dcts_per_plane, DCTS_DEFAULT_PSF_SUPPORT};
use shared::microscope::{AffineFunction, DeviceModel, LightSheetDof};
use sheet_math::ArgMaxFit;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{combine_arms, linspace, CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

const CHART: &str = "Angle";

#[derive(Debug, Default)]
pub struct AngleCalibration {
    peaks: HashMap<usize, Option<ArgMaxFit>>,
}

/// Mean of each consecutive group of `repeats` values
fn average_repeats(values: &[f64], repeats: usize) -> Vec<f64> {
    values
        .chunks(repeats.max(1))
        .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
        .collect()
}

impl AngleCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peak measured for `light_sheet` and not yet applied
    pub fn peak(&self, light_sheet: usize) -> Option<ArgMaxFit> {
        self.peaks.get(&light_sheet).copied().flatten()
    }

    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        let alpha = ctx.microscope.devices().light_sheet(light_sheet)?.alpha;
        let num_arms = ctx.microscope.num_detection_arms();
        let half_range = 0.5 * config.angle_range;
        let angles = linspace(
            alpha.constrain(-half_range),
            alpha.constrain(half_range),
            config.angle_samples.max(3),
        );
        let repeats = config.angle_repeats.max(1);

        let mut queue = ctx.microscope.build_queue();
        queue.current_mut().selected_light_sheet = light_sheet;
        queue.current_mut().camera_on = true;
        for &angle in &angles {
            queue
                .current_mut()
                .set(light_sheet, LightSheetDof::Alpha, angle);
            for _ in 0..repeats {
                queue.add_current_state();
            }
        }

        let stacks = ctx.play(&queue)?;

        let mut fits = Vec::with_capacity(num_arms);
        for arm in 0..num_arms {
            let stack = CalibrationContext::arm_stack(&stacks, arm, angles.len() * repeats)?;
            let metric = average_repeats(&dcts_per_plane(stack, DCTS_DEFAULT_PSF_SUPPORT), repeats);

            let series = format!("LS{light_sheet} D{arm}");
            ctx.sink.configure_chart(CHART, &series, "angle (deg)", "DCTS");
            for (i, (&a, &m)) in angles.iter().zip(&metric).enumerate() {
                ctx.sink.add_point(CHART, &series, i == 0, a, m);
            }

            let fit = ctx.finder.argmax_or_fallback(&angles, &metric);
            debug!(
                light_sheet,
                arm,
                argmax = fit.argmax,
                probability = fit.probability,
                "angle sweep fitted"
            );
            fits.push(fit);
        }

        let peak = combine_arms(&fits);
        if peak.is_none() {
            warn!("No angle peak found for light sheet {}", light_sheet);
        }
        self.peaks.insert(light_sheet, peak);
        Ok(())
    }

    /// Offset the angle function by the measured peak
    ///
    /// Returns `|peak|` in degrees, or infinity without a usable peak.
    pub fn apply(
        &mut self,
        devices: &mut DeviceModel,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let Some(peak) = self.peaks.remove(&light_sheet).flatten() else {
            warn!("No usable angle data for light sheet {}", light_sheet);
            return Ok(f64::INFINITY);
        };

        devices
            .light_sheet_mut(light_sheet)?
            .function_mut(LightSheetDof::Alpha)
            .compose_with(&AffineFunction::axplusb(1.0, peak.argmax));

        info!(
            "Angle light sheet {}: correction {:.3} deg (p={:.2})",
            light_sheet, peak.argmax, peak.probability
        );
        Ok(peak.argmax.abs())
    }

    pub fn reset(&mut self) {
        self.peaks.clear();
    }
}
