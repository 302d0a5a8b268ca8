//! Device control model
//!
//! Each light sheet and detection arm exposes bounded settings and the
//! functions that map a control value onto the hardware value actually
//! driven. Calibration never overwrites a mapping wholesale: corrections are
//! composed onto the existing function (`new = old ∘ delta`), except where a
//! module deliberately resets a function to identity.

use serde::{Deserialize, Serialize};
use sheet_math::Polynomial;
use thiserror::Error;

use super::state::LightSheetDof;

/// Errors addressing devices in the model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("light sheet index {index} out of range (have {count})")]
    LightSheetIndex { index: usize, count: usize },

    #[error("detection arm index {index} out of range (have {count})")]
    DetectionArmIndex { index: usize, count: usize },
}

/// A numeric setting with bounds and step granularity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundedSetting {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    /// Smallest step; `0.0` for continuous settings
    pub granularity: f64,
}

impl BoundedSetting {
    pub fn new(value: f64, min: f64, max: f64, granularity: f64) -> Self {
        let mut setting = Self {
            value,
            min,
            max,
            granularity,
        };
        setting.set(value);
        setting
    }

    /// Clamp and quantize `value`, store it, and return what was stored
    pub fn set(&mut self, value: f64) -> f64 {
        self.value = self.constrain(value);
        self.value
    }

    /// The value this setting would store for `value`
    pub fn constrain(&self, value: f64) -> f64 {
        let mut v = value.clamp(self.min, self.max);
        if self.granularity > 0.0 {
            v = self.min + ((v - self.min) / self.granularity).round() * self.granularity;
            v = v.clamp(self.min, self.max);
        }
        v
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Largest symmetric excursion around zero that stays in bounds
    pub fn max_symmetric_excursion(&self) -> f64 {
        self.min.abs().min(self.max.abs())
    }
}

/// `f(x) = slope·x + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineFunction {
    pub slope: f64,
    pub offset: f64,
}

impl AffineFunction {
    pub const IDENTITY: AffineFunction = AffineFunction {
        slope: 1.0,
        offset: 0.0,
    };

    pub fn axplusb(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }

    pub fn apply(&self, x: f64) -> f64 {
        self.slope * x + self.offset
    }

    /// Replace `self` by `self ∘ delta`, i.e. `x ↦ self(delta(x))`
    pub fn compose_with(&mut self, delta: &AffineFunction) {
        *self = AffineFunction {
            slope: self.slope * delta.slope,
            offset: self.slope * delta.offset + self.offset,
        };
    }

    pub fn inverse(&self) -> Option<AffineFunction> {
        if self.slope.abs() < f64::EPSILON {
            return None;
        }
        Some(AffineFunction {
            slope: 1.0 / self.slope,
            offset: -self.offset / self.slope,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::IDENTITY;
    }
}

impl Default for AffineFunction {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// The calibratable mappings of one light sheet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LightSheetFunctions {
    pub x: AffineFunction,
    pub y: AffineFunction,
    pub z: AffineFunction,
    pub alpha: AffineFunction,
    pub width: AffineFunction,
    pub height: AffineFunction,
    pub power: AffineFunction,
    pub height_power: Polynomial,
    pub width_power: Polynomial,
}

/// One illumination path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheet {
    pub x: BoundedSetting,
    pub y: BoundedSetting,
    pub z: BoundedSetting,
    pub alpha: BoundedSetting,
    pub width: BoundedSetting,
    pub height: BoundedSetting,
    pub power: BoundedSetting,
    pub functions: LightSheetFunctions,
    /// Scale power by the height/width compensation polynomials
    pub adapt_power_to_width_height: bool,
}

impl LightSheet {
    pub fn setting(&self, dof: LightSheetDof) -> &BoundedSetting {
        match dof {
            LightSheetDof::X => &self.x,
            LightSheetDof::Y => &self.y,
            LightSheetDof::Z => &self.z,
            LightSheetDof::Alpha => &self.alpha,
            LightSheetDof::Width => &self.width,
            LightSheetDof::Height => &self.height,
            LightSheetDof::Power => &self.power,
        }
    }

    pub fn setting_mut(&mut self, dof: LightSheetDof) -> &mut BoundedSetting {
        match dof {
            LightSheetDof::X => &mut self.x,
            LightSheetDof::Y => &mut self.y,
            LightSheetDof::Z => &mut self.z,
            LightSheetDof::Alpha => &mut self.alpha,
            LightSheetDof::Width => &mut self.width,
            LightSheetDof::Height => &mut self.height,
            LightSheetDof::Power => &mut self.power,
        }
    }

    pub fn function(&self, dof: LightSheetDof) -> &AffineFunction {
        let f = &self.functions;
        match dof {
            LightSheetDof::X => &f.x,
            LightSheetDof::Y => &f.y,
            LightSheetDof::Z => &f.z,
            LightSheetDof::Alpha => &f.alpha,
            LightSheetDof::Width => &f.width,
            LightSheetDof::Height => &f.height,
            LightSheetDof::Power => &f.power,
        }
    }

    pub fn function_mut(&mut self, dof: LightSheetDof) -> &mut AffineFunction {
        let f = &mut self.functions;
        match dof {
            LightSheetDof::X => &mut f.x,
            LightSheetDof::Y => &mut f.y,
            LightSheetDof::Z => &mut f.z,
            LightSheetDof::Alpha => &mut f.alpha,
            LightSheetDof::Width => &mut f.width,
            LightSheetDof::Height => &mut f.height,
            LightSheetDof::Power => &mut f.power,
        }
    }

    /// Hardware value driven for control value `value` of `dof`
    pub fn hardware_value(&self, dof: LightSheetDof, value: f64) -> f64 {
        self.function(dof).apply(value)
    }

    /// Hardware power for a control power at the given height and width
    pub fn hardware_power(&self, power: f64, height: f64, width: f64) -> f64 {
        let base = self.functions.power.apply(power);
        if self.adapt_power_to_width_height {
            base * self.functions.height_power.eval(height) * self.functions.width_power.eval(width)
        } else {
            base
        }
    }

    pub fn reset_functions(&mut self) {
        self.functions = LightSheetFunctions::default();
        self.adapt_power_to_width_height = false;
    }
}

impl Default for LightSheet {
    fn default() -> Self {
        Self {
            x: BoundedSetting::new(0.0, -1.0, 1.0, 0.0),
            y: BoundedSetting::new(0.0, -1.0, 1.0, 0.0),
            z: BoundedSetting::new(0.0, -50.0, 50.0, 0.0),
            alpha: BoundedSetting::new(0.0, -25.0, 25.0, 0.0),
            width: BoundedSetting::new(0.5, 0.0, 1.0, 0.0),
            height: BoundedSetting::new(1.0, 0.1, 1.0, 0.0),
            power: BoundedSetting::new(1.0, 0.0, 1.0, 0.0),
            functions: LightSheetFunctions::default(),
            adapt_power_to_width_height: false,
        }
    }
}

/// One imaging path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionArm {
    pub z: BoundedSetting,
    pub z_function: AffineFunction,
}

impl DetectionArm {
    pub fn reset_functions(&mut self) {
        self.z_function.reset();
    }
}

impl Default for DetectionArm {
    fn default() -> Self {
        Self {
            z: BoundedSetting::new(0.0, -50.0, 50.0, 0.0),
            z_function: AffineFunction::IDENTITY,
        }
    }
}

/// All light sheets and detection arms of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub light_sheets: Vec<LightSheet>,
    pub detection_arms: Vec<DetectionArm>,
}

impl DeviceModel {
    pub fn new(num_light_sheets: usize, num_detection_arms: usize) -> Self {
        Self {
            light_sheets: vec![LightSheet::default(); num_light_sheets],
            detection_arms: vec![DetectionArm::default(); num_detection_arms],
        }
    }

    pub fn num_light_sheets(&self) -> usize {
        self.light_sheets.len()
    }

    pub fn num_detection_arms(&self) -> usize {
        self.detection_arms.len()
    }

    pub fn light_sheet(&self, index: usize) -> Result<&LightSheet, DeviceError> {
        let count = self.light_sheets.len();
        self.light_sheets
            .get(index)
            .ok_or(DeviceError::LightSheetIndex { index, count })
    }

    pub fn light_sheet_mut(&mut self, index: usize) -> Result<&mut LightSheet, DeviceError> {
        let count = self.light_sheets.len();
        self.light_sheets
            .get_mut(index)
            .ok_or(DeviceError::LightSheetIndex { index, count })
    }

    pub fn detection_arm(&self, index: usize) -> Result<&DetectionArm, DeviceError> {
        let count = self.detection_arms.len();
        self.detection_arms
            .get(index)
            .ok_or(DeviceError::DetectionArmIndex { index, count })
    }

    pub fn detection_arm_mut(&mut self, index: usize) -> Result<&mut DetectionArm, DeviceError> {
        let count = self.detection_arms.len();
        self.detection_arms
            .get_mut(index)
            .ok_or(DeviceError::DetectionArmIndex { index, count })
    }

    /// Reset every calibration function to identity
    pub fn reset_functions(&mut self) {
        for light_sheet in &mut self.light_sheets {
            light_sheet.reset_functions();
        }
        for arm in &mut self.detection_arms {
            arm.reset_functions();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_applies_delta_first() {
        let mut f = AffineFunction::axplusb(2.0, 1.0);
        f.compose_with(&AffineFunction::axplusb(1.0, -0.5));

        // f(delta(3)) = 2 * (3 - 0.5) + 1
        assert_relative_eq!(f.apply(3.0), 6.0);
        assert_relative_eq!(f.slope, 2.0);
        assert_relative_eq!(f.offset, 0.0);
    }

    #[test]
    fn test_compose_is_incremental() {
        let mut f = AffineFunction::IDENTITY;
        f.compose_with(&AffineFunction::axplusb(1.0, 0.25));
        f.compose_with(&AffineFunction::axplusb(1.0, 0.25));

        assert_relative_eq!(f.offset, 0.5);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let f = AffineFunction::axplusb(0.8, -3.0);
        let inv = f.inverse().unwrap();
        assert_relative_eq!(inv.apply(f.apply(1.7)), 1.7, epsilon = 1e-12);
        assert!(AffineFunction::axplusb(0.0, 1.0).inverse().is_none());
    }

    #[test]
    fn test_bounded_setting_clamps_and_quantizes() {
        let mut setting = BoundedSetting::new(0.0, -1.0, 1.0, 0.25);

        assert_relative_eq!(setting.set(0.3), 0.25);
        assert_relative_eq!(setting.set(7.0), 1.0);
        assert_relative_eq!(setting.set(-0.9), -1.0);
        assert_relative_eq!(setting.span(), 2.0);
    }

    #[test]
    fn test_device_index_errors() {
        let model = DeviceModel::new(2, 1);

        assert!(model.light_sheet(1).is_ok());
        assert_eq!(
            model.light_sheet(2).unwrap_err(),
            DeviceError::LightSheetIndex { index: 2, count: 2 }
        );
        assert_eq!(
            model.detection_arm(3).unwrap_err(),
            DeviceError::DetectionArmIndex { index: 3, count: 1 }
        );
    }

    #[test]
    fn test_hardware_power_compensation() {
        let mut sheet = LightSheet::default();
        sheet.functions.height_power = Polynomial::new(vec![0.5, 0.5]);

        assert_relative_eq!(sheet.hardware_power(0.8, 0.2, 0.5), 0.8);

        sheet.adapt_power_to_width_height = true;
        assert_relative_eq!(sheet.hardware_power(0.8, 0.2, 0.5), 0.8 * 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_reset_functions_restores_identity() {
        let mut model = DeviceModel::new(1, 1);
        model.light_sheets[0].functions.z = AffineFunction::axplusb(1.0, 3.0);
        model.detection_arms[0].z_function = AffineFunction::axplusb(2.0, 0.0);

        model.reset_functions();

        assert_eq!(model.light_sheets[0].functions, LightSheetFunctions::default());
        assert_eq!(model.detection_arms[0].z_function, AffineFunction::IDENTITY);
    }
}
