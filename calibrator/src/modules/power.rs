//! Power balance between light sheets
//!
//! Every enabled light sheet is imaged at the same control power and a
//! robust intensity (median over frames of the 99th percentile) is taken.
//! Applying the calibration rescales each power function so every light
//! sheet matches the first one measured.

use shared::image_proc::percentile_intensity_per_plane;
use shared::microscope::{AffineFunction, DeviceModel, LightSheetDof};
use sheet_math::median;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

const INTENSITY_PERCENTILE: f64 = 99.0;

const CHART: &str = "Power";

#[derive(Debug, Default)]
pub struct PowerCalibration {
    intensities: BTreeMap<usize, f64>,
}

impl PowerCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intensity measured per light sheet and not yet applied
    pub fn intensities(&self) -> &BTreeMap<usize, f64> {
        &self.intensities
    }

    /// Image each of `light_sheets` in one queue and measure its intensity
    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheets: &[usize],
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        self.intensities.clear();
        let samples = config.power_samples.max(1);

        let mut queue = ctx.microscope.build_queue();
        queue.current_mut().camera_on = true;
        for &l in light_sheets {
            ctx.microscope.devices().light_sheet(l)?;
            queue.current_mut().selected_light_sheet = l;
            for _ in 0..samples {
                queue.add_current_state();
            }
        }

        let stacks = ctx.play(&queue)?;
        let expected = samples * light_sheets.len();
        let mut per_arm: Vec<Vec<f64>> = Vec::with_capacity(stacks.len());
        for arm in 0..ctx.microscope.num_detection_arms() {
            let stack = CalibrationContext::arm_stack(&stacks, arm, expected)?;
            per_arm.push(percentile_intensity_per_plane(stack, INTENSITY_PERCENTILE)?);
        }

        for (block, &l) in light_sheets.iter().enumerate() {
            let frames = block * samples..(block + 1) * samples;
            let values: Vec<f64> = per_arm
                .iter()
                .flat_map(|arm| arm[frames.clone()].iter().copied())
                .collect();
            let intensity = median(&values)?;
            ctx.sink.add_point(CHART, "intensity", block == 0, l as f64, intensity);
            self.intensities.insert(l, intensity);
        }
        Ok(())
    }

    /// Scale every power function by `I_ref / I_l`
    ///
    /// Returns the mean `|1 - ratio|` over the measured light sheets, or
    /// infinity without a usable reference.
    pub fn apply(&mut self, devices: &mut DeviceModel) -> Result<f64, CalibrationError> {
        let intensities = std::mem::take(&mut self.intensities);
        let Some((&reference_sheet, &reference)) = intensities.iter().next() else {
            warn!("Power apply without a calibration");
            return Ok(f64::INFINITY);
        };
        if reference <= 0.0 {
            warn!("Reference light sheet {} measured no light", reference_sheet);
            return Ok(f64::INFINITY);
        }

        let mut deviation = 0.0;
        let mut counted = 0usize;
        for (&l, &intensity) in &intensities {
            if intensity <= 0.0 {
                warn!("Light sheet {} measured no light, power left unchanged", l);
                continue;
            }
            let ratio = reference / intensity;
            devices
                .light_sheet_mut(l)?
                .function_mut(LightSheetDof::Power)
                .compose_with(&AffineFunction::axplusb(ratio, 0.0));
            info!("Power light sheet {}: ratio {:.4}", l, ratio);
            deviation += (1.0 - ratio).abs();
            counted += 1;
        }

        Ok(deviation / counted.max(1) as f64)
    }

    pub fn reset(&mut self) {
        self.intensities.clear();
    }
}
