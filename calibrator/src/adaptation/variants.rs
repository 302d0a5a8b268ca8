//! Concrete adaptation modules
//!
//! A variant names the light-sheet DOF it optimizes, whether its argmax is
//! an offset on top of the current table entry or an absolute value, and
//! which values to sweep.

use shared::microscope::{BoundedSetting, LightSheetDof};

use super::standard::{AdaptationSettings, StandardAdaptationModule};
use crate::config::AdaptationConfig;
use crate::modules::linspace;

/// Variant-specific part of an adaptation module
pub trait AdaptationVariant: Send {
    fn name(&self) -> &'static str;

    fn dof(&self) -> LightSheetDof;

    /// Whether sweep values and corrections are offsets from the table entry
    fn relative(&self) -> bool;

    /// Values to sweep at one grid point
    fn sweep(&self, setting: &BoundedSetting, num_samples: usize) -> Vec<f64>;
}

/// Light-sheet Z around each control plane, corrected in `IZ`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationZ {
    pub range: f64,
}

impl AdaptationZ {
    pub fn module(config: &AdaptationConfig) -> StandardAdaptationModule {
        StandardAdaptationModule::new(
            Box::new(Self {
                range: config.z_search_range,
            }),
            AdaptationSettings::from(config),
        )
    }
}

impl AdaptationVariant for AdaptationZ {
    fn name(&self) -> &'static str {
        "Adaptation Z"
    }

    fn dof(&self) -> LightSheetDof {
        LightSheetDof::Z
    }

    fn relative(&self) -> bool {
        true
    }

    fn sweep(&self, _setting: &BoundedSetting, num_samples: usize) -> Vec<f64> {
        linspace(-0.5 * self.range, 0.5 * self.range, num_samples)
    }
}

/// Light-sheet angle, corrected in `IA`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationA {
    pub range: f64,
}

impl AdaptationA {
    pub fn module(config: &AdaptationConfig) -> StandardAdaptationModule {
        StandardAdaptationModule::new(
            Box::new(Self {
                range: config.alpha_search_range,
            }),
            AdaptationSettings::from(config),
        )
    }
}

impl AdaptationVariant for AdaptationA {
    fn name(&self) -> &'static str {
        "Adaptation A"
    }

    fn dof(&self) -> LightSheetDof {
        LightSheetDof::Alpha
    }

    fn relative(&self) -> bool {
        true
    }

    fn sweep(&self, _setting: &BoundedSetting, num_samples: usize) -> Vec<f64> {
        linspace(-0.5 * self.range, 0.5 * self.range, num_samples)
    }
}

/// Light-sheet width over its full range, set absolutely in `IW`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AdaptationW;

impl AdaptationW {
    pub fn module(config: &AdaptationConfig) -> StandardAdaptationModule {
        StandardAdaptationModule::new(Box::new(Self), AdaptationSettings::from(config))
    }
}

impl AdaptationVariant for AdaptationW {
    fn name(&self) -> &'static str {
        "Adaptation W"
    }

    fn dof(&self) -> LightSheetDof {
        LightSheetDof::Width
    }

    fn relative(&self) -> bool {
        false
    }

    fn sweep(&self, setting: &BoundedSetting, num_samples: usize) -> Vec<f64> {
        linspace(setting.min, setting.max, num_samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweeps() {
        let setting = BoundedSetting::new(0.5, 0.0, 1.0, 0.0);

        let z = AdaptationZ { range: 10.0 }.sweep(&setting, 5);
        assert_eq!(z, vec![-5.0, -2.5, 0.0, 2.5, 5.0]);

        let w = AdaptationW.sweep(&setting, 3);
        assert_eq!(w, vec![0.0, 0.5, 1.0]);
        assert!(!AdaptationW.relative());
        assert_eq!(AdaptationA { range: 4.0 }.dof(), LightSheetDof::Alpha);
    }
}
