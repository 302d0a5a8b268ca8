//! Power compensation against sheet height or width
//!
//! Narrowing a sheet concentrates its light, so the same control power gives
//! a brighter image. This module measures, for a range of heights (or
//! widths), the power that reproduces the intensity seen at full power and
//! full height, and fits a degree-2 polynomial `ratio(dimension)`. Applying
//! it installs the polynomial as the compensation function and enables
//! power adaptation on the light sheet.

use shared::image_proc::percentile_intensity_per_plane;
use shared::microscope::{DeviceModel, LightSheetDof};
use sheet_math::{nearest_index, smooth_in_place, Polynomial};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{linspace, Axis, CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

const INTENSITY_PERCENTILE: f64 = 99.0;

const SMOOTHING_PASSES: usize = 1;

const COMPENSATION_DEGREE: usize = 2;

/// Sheet dimension a compensation polynomial depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetDimension {
    Height,
    Width,
}

impl SheetDimension {
    pub fn dof(self) -> LightSheetDof {
        match self {
            SheetDimension::Height => LightSheetDof::Height,
            SheetDimension::Width => LightSheetDof::Width,
        }
    }

    pub fn axis(self) -> Axis {
        match self {
            SheetDimension::Height => Axis::HeightPower,
            SheetDimension::Width => Axis::WidthPower,
        }
    }
}

#[derive(Debug)]
pub struct PowerCompensation {
    dimension: SheetDimension,
    fits: HashMap<usize, Polynomial>,
}

impl PowerCompensation {
    pub fn new(dimension: SheetDimension) -> Self {
        Self {
            dimension,
            fits: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> SheetDimension {
        self.dimension
    }

    /// Polynomial fitted for `light_sheet` and not yet applied
    pub fn fit(&self, light_sheet: usize) -> Option<&Polynomial> {
        self.fits.get(&light_sheet)
    }

    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        let dof = self.dimension.dof();
        let chart = self.dimension.axis().name();
        let arm = config.compensation_detection_arm;

        let devices = ctx.microscope.devices();
        devices.detection_arm(arm)?;
        let sheet = devices.light_sheet(light_sheet)?;
        let dimension = *sheet.setting(dof);
        let power = sheet.power;
        let adapt = sheet.adapt_power_to_width_height;

        let dimensions = linspace(dimension.min, dimension.max, config.dimension_samples.max(3));
        let powers = linspace(power.min, power.max, config.dimension_power_samples.max(2));

        let mut queue = ctx.microscope.build_queue();
        let frame = queue.current_mut();
        frame.selected_light_sheet = light_sheet;
        frame.camera_on = true;
        frame.set(light_sheet, LightSheetDof::Power, power.max);
        frame.set(light_sheet, dof, dimension.max);
        queue.add_current_state();

        for &d in &dimensions {
            queue.current_mut().set(light_sheet, dof, d);
            queue.current_mut().set(light_sheet, LightSheetDof::Power, powers[0]);
            queue.current_mut().camera_on = false;
            queue.add_current_state();
            queue.current_mut().camera_on = true;
            for &p in &powers {
                queue.current_mut().set(light_sheet, LightSheetDof::Power, p);
                queue.add_current_state();
            }
            queue.current_mut().camera_on = false;
            queue.add_current_state();
        }

        // measure the uncompensated response
        ctx.microscope.devices_mut().light_sheet_mut(light_sheet)?.adapt_power_to_width_height = false;
        let played = ctx.play(&queue);
        ctx.microscope.devices_mut().light_sheet_mut(light_sheet)?.adapt_power_to_width_height = adapt;
        let stacks = played?;

        let expected = 1 + dimensions.len() * powers.len();
        let stack = CalibrationContext::arm_stack(&stacks, arm, expected)?;
        let intensities = percentile_intensity_per_plane(stack, INTENSITY_PERCENTILE)?;
        let target = intensities[0];

        let series = format!("LS{light_sheet}");
        ctx.sink.configure_chart(chart, &series, "dimension", "power ratio");
        let mut ratios = Vec::with_capacity(dimensions.len());
        for (i, &d) in dimensions.iter().enumerate() {
            let start = 1 + i * powers.len();
            let mut curve = intensities[start..start + powers.len()].to_vec();
            smooth_in_place(&mut curve, SMOOTHING_PASSES);

            let best = nearest_index(&curve, target).unwrap_or(powers.len() - 1);
            let ratio = if power.max > 0.0 {
                powers[best] / power.max
            } else {
                1.0
            };
            debug!(light_sheet, dimension = d, ratio, "compensation point");
            ctx.sink.add_point(chart, &series, i == 0, d, ratio);
            ratios.push(ratio);
        }

        let polynomial = Polynomial::fit(&dimensions, &ratios, COMPENSATION_DEGREE)?;
        self.fits.insert(light_sheet, polynomial);
        Ok(())
    }

    /// Install the fitted polynomial and enable power adaptation
    ///
    /// The compensation is installed outright, so the residual is `0`; it is
    /// infinity when no fit is available.
    pub fn apply(
        &mut self,
        devices: &mut DeviceModel,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        let Some(polynomial) = self.fits.remove(&light_sheet) else {
            warn!(
                "No {:?} compensation fit for light sheet {}",
                self.dimension, light_sheet
            );
            return Ok(f64::INFINITY);
        };

        let sheet = devices.light_sheet_mut(light_sheet)?;
        info!(
            "{} light sheet {}: coefficients {:?}",
            self.dimension.axis(),
            light_sheet,
            polynomial.coefficients()
        );
        match self.dimension {
            SheetDimension::Height => sheet.functions.height_power = polynomial,
            SheetDimension::Width => sheet.functions.width_power = polynomial,
        }
        sheet.adapt_power_to_width_height = true;
        Ok(0.0)
    }

    pub fn reset(&mut self) {
        self.fits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TracingSink;
    use approx::assert_relative_eq;
    use shared::microscope::{DeviceState, Microscope, SimulatedMicroscope, SimulationParams};
    use sheet_math::SmartArgMaxFinder;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_apply_installs_polynomial() {
        let mut devices = DeviceModel::new(1, 1);
        let mut compensation = PowerCompensation::new(SheetDimension::Width);
        compensation
            .fits
            .insert(0, Polynomial::new(vec![0.5, 0.5, 0.0]));

        assert_eq!(compensation.apply(&mut devices, 0).unwrap(), 0.0);

        let sheet = &devices.light_sheets[0];
        assert!(sheet.adapt_power_to_width_height);
        assert_eq!(sheet.functions.width_power.coefficients(), &[0.5, 0.5, 0.0]);
        assert_eq!(sheet.functions.height_power, Polynomial::default());
        assert_eq!(compensation.apply(&mut devices, 0).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_calibrate_flattens_height_response() {
        let mut params = SimulationParams::default();
        params.noise_sigma = 0.0;
        let mut microscope = SimulatedMicroscope::new(params);
        let config = EngineConfig {
            dimension_power_samples: 41,
            ..EngineConfig::default()
        };
        let mut compensation = PowerCompensation::new(SheetDimension::Height);

        let mut ctx = CalibrationContext {
            microscope: &mut microscope,
            sink: Arc::new(TracingSink),
            finder: Arc::new(SmartArgMaxFinder::default()),
            timeout_base: Duration::from_secs(10),
            timeout_per_frame: Duration::from_secs(1),
        };
        compensation.calibrate(&mut ctx, 0, &config).unwrap();

        // the mock's height transmission is 2 / (1 + h), so ratio ≈ (1 + h) / 2
        let fit = compensation.fit(0).unwrap().clone();
        assert_relative_eq!(fit.eval(1.0), 1.0, epsilon = 0.06);
        assert_relative_eq!(fit.eval(0.1), 0.55, epsilon = 0.06);

        compensation.apply(microscope.devices_mut(), 0).unwrap();
        let mut frame = DeviceState::from_devices(microscope.devices());
        frame.light_sheets[0].height = 1.0;
        let full = microscope.spot_intensity(&frame);
        frame.light_sheets[0].height = 0.2;
        let narrow = microscope.spot_intensity(&frame);
        assert!((narrow / full - 1.0).abs() < 0.1, "ratio {}", narrow / full);
    }
}
