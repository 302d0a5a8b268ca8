//! Interpolated acquisition state
//!
//! For every light-sheet degree of freedom the acquisition state keeps one
//! correction per `(control plane, light sheet)`. At acquisition time the
//! value for an arbitrary detection depth is linearly interpolated between
//! the two surrounding control planes. Adaptation modules read and write
//! these tables.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use sheet_math::ControlPlaneLayout;
use thiserror::Error;

use super::queue::DeviceState;

/// Light-sheet degrees of freedom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightSheetDof {
    X,
    Y,
    Z,
    Alpha,
    Width,
    Height,
    Power,
}

impl LightSheetDof {
    pub const ALL: [LightSheetDof; 7] = [
        LightSheetDof::X,
        LightSheetDof::Y,
        LightSheetDof::Z,
        LightSheetDof::Alpha,
        LightSheetDof::Width,
        LightSheetDof::Height,
        LightSheetDof::Power,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Short label used in logs and charts
    pub fn label(self) -> &'static str {
        match self {
            LightSheetDof::X => "IX",
            LightSheetDof::Y => "IY",
            LightSheetDof::Z => "IZ",
            LightSheetDof::Alpha => "IA",
            LightSheetDof::Width => "IW",
            LightSheetDof::Height => "IH",
            LightSheetDof::Power => "IP",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("control plane {index} out of range (have {count})")]
    ControlPlane { index: usize, count: usize },

    #[error("light sheet {index} out of range (have {count})")]
    LightSheet { index: usize, count: usize },
}

/// Dense per-DOF correction tables indexed `(dof, control plane, light sheet)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationTables {
    layout: ControlPlaneLayout,
    values: Array3<f64>,
}

impl InterpolationTables {
    pub fn new(num_control_planes: usize, num_light_sheets: usize, layout: ControlPlaneLayout) -> Self {
        Self {
            layout,
            values: Array3::zeros((LightSheetDof::ALL.len(), num_control_planes, num_light_sheets)),
        }
    }

    pub fn num_control_planes(&self) -> usize {
        self.values.dim().1
    }

    pub fn num_light_sheets(&self) -> usize {
        self.values.dim().2
    }

    pub fn layout(&self) -> ControlPlaneLayout {
        self.layout
    }

    fn check(&self, control_plane: usize, light_sheet: usize) -> Result<(), TableError> {
        let (_, planes, sheets) = self.values.dim();
        if control_plane >= planes {
            return Err(TableError::ControlPlane {
                index: control_plane,
                count: planes,
            });
        }
        if light_sheet >= sheets {
            return Err(TableError::LightSheet {
                index: light_sheet,
                count: sheets,
            });
        }
        Ok(())
    }

    pub fn get(&self, dof: LightSheetDof, control_plane: usize, light_sheet: usize) -> Result<f64, TableError> {
        self.check(control_plane, light_sheet)?;
        Ok(self.values[[dof.index(), control_plane, light_sheet]])
    }

    /// Absolute update
    pub fn set(
        &mut self,
        dof: LightSheetDof,
        control_plane: usize,
        light_sheet: usize,
        value: f64,
    ) -> Result<(), TableError> {
        self.check(control_plane, light_sheet)?;
        self.values[[dof.index(), control_plane, light_sheet]] = value;
        Ok(())
    }

    /// Relative update
    pub fn add(
        &mut self,
        dof: LightSheetDof,
        control_plane: usize,
        light_sheet: usize,
        delta: f64,
    ) -> Result<(), TableError> {
        self.check(control_plane, light_sheet)?;
        self.values[[dof.index(), control_plane, light_sheet]] += delta;
        Ok(())
    }

    /// Normalized position of a control plane in `[0, 1]`
    pub fn control_plane_position(&self, control_plane: usize) -> f64 {
        self.layout.layout(self.num_control_planes(), control_plane)
    }

    /// Value at normalized depth `position` (clamped to `[0, 1]`)
    pub fn interpolate(&self, dof: LightSheetDof, position: f64, light_sheet: usize) -> Result<f64, TableError> {
        let planes = self.num_control_planes();
        self.check(0, light_sheet)?;
        if planes == 1 {
            return self.get(dof, 0, light_sheet);
        }

        let position = position.clamp(0.0, 1.0);
        let mut upper = 1;
        while upper < planes - 1 && self.control_plane_position(upper) < position {
            upper += 1;
        }
        let lower = upper - 1;

        let p0 = self.control_plane_position(lower);
        let p1 = self.control_plane_position(upper);
        let v0 = self.get(dof, lower, light_sheet)?;
        let v1 = self.get(dof, upper, light_sheet)?;

        if (p1 - p0).abs() < f64::EPSILON {
            return Ok(v0);
        }
        Ok(v0 + (v1 - v0) * (position - p0) / (p1 - p0))
    }

    pub fn clear(&mut self) {
        self.values.fill(0.0);
    }
}

/// Tables plus the detection range they span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolatedAcquisitionState {
    pub tables: InterpolationTables,
    /// Detection Z at the first control plane
    pub z_min: f64,
    /// Detection Z at the last control plane
    pub z_max: f64,
}

impl InterpolatedAcquisitionState {
    pub fn new(
        num_control_planes: usize,
        num_light_sheets: usize,
        layout: ControlPlaneLayout,
        z_min: f64,
        z_max: f64,
    ) -> Self {
        Self {
            tables: InterpolationTables::new(num_control_planes, num_light_sheets, layout),
            z_min,
            z_max,
        }
    }

    pub fn num_control_planes(&self) -> usize {
        self.tables.num_control_planes()
    }

    pub fn num_light_sheets(&self) -> usize {
        self.tables.num_light_sheets()
    }

    /// Detection Z of a control plane
    pub fn control_plane_z(&self, control_plane: usize) -> f64 {
        self.z_min + (self.z_max - self.z_min) * self.tables.control_plane_position(control_plane)
    }

    /// Load the state of one control plane into a frame
    ///
    /// Every detection arm is placed at the control-plane depth and light
    /// sheet `light_sheet` is selected, with the table corrections applied
    /// on top of that depth for Z and taken as-is for the other DOFs.
    pub fn apply_to_frame(
        &self,
        frame: &mut DeviceState,
        control_plane: usize,
        light_sheet: usize,
    ) -> Result<(), TableError> {
        let z = self.control_plane_z(control_plane);
        for dz in frame.detection_z.iter_mut() {
            *dz = z;
        }
        for (l, sheet) in frame.light_sheets.iter_mut().enumerate() {
            if l >= self.num_light_sheets() {
                break;
            }
            sheet.z = z + self.tables.get(LightSheetDof::Z, control_plane, l)?;
            sheet.x = self.tables.get(LightSheetDof::X, control_plane, l)?;
            sheet.y = self.tables.get(LightSheetDof::Y, control_plane, l)?;
            sheet.alpha = self.tables.get(LightSheetDof::Alpha, control_plane, l)?;
        }
        frame.selected_light_sheet = light_sheet;
        Ok(())
    }
}
