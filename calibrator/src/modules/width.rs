//! Width alignment between light sheets
//!
//! Each light sheet's width is swept over its range and the sharpest width
//! located. Applying the calibration offsets every width function by the
//! difference to the first light sheet's optimum, so the same control width
//! gives the same optical width on every light sheet.

use shared::image_proc::{dcts_per_plane, DCTS_DEFAULT_PSF_SUPPORT};
use shared::microscope::{AffineFunction, DeviceModel, LightSheetDof};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{combine_arms, linspace, CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

const CHART: &str = "Width";

#[derive(Debug, Default)]
pub struct WidthCalibration {
    optima: BTreeMap<usize, f64>,
}

impl WidthCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sharpest control width per light sheet, not yet applied
    pub fn optima(&self) -> &BTreeMap<usize, f64> {
        &self.optima
    }

    /// Sweep the width of one light sheet
    pub fn calibrate_light_sheet(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        let width = ctx.microscope.devices().light_sheet(light_sheet)?.width;
        let num_arms = ctx.microscope.num_detection_arms();
        let widths = linspace(width.min, width.max, config.width_samples.max(3));

        let mut queue = ctx.microscope.build_queue();
        queue.current_mut().selected_light_sheet = light_sheet;
        queue.current_mut().camera_on = true;
        for &w in &widths {
            queue.current_mut().set(light_sheet, LightSheetDof::Width, w);
            queue.add_current_state();
        }

        let stacks = ctx.play(&queue)?;

        let mut fits = Vec::with_capacity(num_arms);
        for arm in 0..num_arms {
            let stack = CalibrationContext::arm_stack(&stacks, arm, widths.len())?;
            let metric = dcts_per_plane(stack, DCTS_DEFAULT_PSF_SUPPORT);
            let series = format!("LS{light_sheet} D{arm}");
            for (i, (&w, &m)) in widths.iter().zip(&metric).enumerate() {
                ctx.sink.add_point(CHART, &series, i == 0, w, m);
            }
            let fit = ctx.finder.argmax_or_fallback(&widths, &metric);
            debug!(
                light_sheet,
                arm,
                argmax = fit.argmax,
                probability = fit.probability,
                "width sweep fitted"
            );
            fits.push(fit);
        }

        match combine_arms(&fits) {
            Some(peak) => {
                self.optima.insert(light_sheet, peak.argmax);
            }
            None => warn!("No width optimum found for light sheet {}", light_sheet),
        }
        Ok(())
    }

    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheets: &[usize],
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        self.optima.clear();
        for &l in light_sheets {
            self.calibrate_light_sheet(ctx, l, config)?;
        }
        Ok(())
    }

    /// Offset each width function by `w*_l - w*_ref`
    ///
    /// Returns the mean `|Δ|` over the non-reference light sheets. A lone
    /// reference is aligned with itself and gives zero; no optimum at all
    /// gives infinity.
    pub fn apply(&mut self, devices: &mut DeviceModel) -> Result<f64, CalibrationError> {
        let optima = std::mem::take(&mut self.optima);
        let mut entries = optima.iter();
        let Some((&reference_sheet, &reference)) = entries.next() else {
            warn!("Width apply without a calibration");
            return Ok(f64::INFINITY);
        };

        let mut deviation = 0.0;
        let mut counted = 0usize;
        for (&l, &optimum) in entries {
            let delta = optimum - reference;
            devices
                .light_sheet_mut(l)?
                .function_mut(LightSheetDof::Width)
                .compose_with(&AffineFunction::axplusb(1.0, delta));
            info!(
                "Width light sheet {}: offset {:.4} relative to light sheet {}",
                l, delta, reference_sheet
            );
            deviation += delta.abs();
            counted += 1;
        }

        if counted == 0 {
            info!("Width light sheet {} is the only one calibrated", reference_sheet);
            return Ok(0.0);
        }
        Ok(deviation / counted as f64)
    }

    pub fn reset(&mut self) {
        self.optima.clear();
    }
}
