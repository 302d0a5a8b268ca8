//! Persisted calibration record
//!
//! A [`CalibrationData`] captures everything a calibration run changes: the
//! light-sheet and detection-arm functions, the XY transforms and the
//! positioners. It is stored as JSON through
//! [`shared::calibration_store::CalibrationStore`]; matrices are kept
//! row-major and floats round-trip exactly.

use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use shared::microscope::{AffineFunction, DeviceModel, LightSheetFunctions};
use sheet_math::{matrix_from_row_major, matrix_to_row_major};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::modules::xy::{SheetTransform, XyCalibration};
use crate::positioner::LightSheetPositioner;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("record has {record} light sheets, instrument has {instrument}")]
    LightSheetCount { record: usize, instrument: usize },

    #[error("record has {record} detection arms, instrument has {instrument}")]
    DetectionArmCount { record: usize, instrument: usize },
}

/// Calibrated functions of one light sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheetRecord {
    pub functions: LightSheetFunctions,
    pub adapt_power_to_width_height: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub light_sheet: usize,
    pub detection_arm: usize,
    /// Row-major control-to-sensor matrix
    pub matrix: [f64; 4],
    pub origin: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerRecord {
    pub light_sheet: usize,
    pub detection_arm: usize,
    pub positioner: LightSheetPositioner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    pub light_sheets: Vec<LightSheetRecord>,
    pub detection_arms: Vec<AffineFunction>,
    #[serde(default)]
    pub transforms: Vec<TransformRecord>,
    #[serde(default)]
    pub positioners: Vec<PositionerRecord>,
}

impl CalibrationData {
    /// Snapshot the current calibration state
    pub fn capture(
        devices: &DeviceModel,
        xy: &XyCalibration,
        positioners: &BTreeMap<(usize, usize), LightSheetPositioner>,
    ) -> Self {
        let mut transforms: Vec<TransformRecord> = xy
            .transforms()
            .map(|((light_sheet, detection_arm), t)| TransformRecord {
                light_sheet,
                detection_arm,
                matrix: matrix_to_row_major(&t.matrix),
                origin: [t.origin.x, t.origin.y],
            })
            .collect();
        transforms.sort_by_key(|t| (t.light_sheet, t.detection_arm));

        Self {
            created: Utc::now(),
            description: None,
            light_sheets: devices
                .light_sheets
                .iter()
                .map(|ls| LightSheetRecord {
                    functions: ls.functions.clone(),
                    adapt_power_to_width_height: ls.adapt_power_to_width_height,
                })
                .collect(),
            detection_arms: devices.detection_arms.iter().map(|d| d.z_function).collect(),
            transforms,
            positioners: positioners
                .iter()
                .map(|(&(light_sheet, detection_arm), p)| PositionerRecord {
                    light_sheet,
                    detection_arm,
                    positioner: *p,
                })
                .collect(),
        }
    }

    /// Write the stored functions into `devices`
    ///
    /// The record must describe the same number of light sheets and
    /// detection arms; nothing is changed otherwise.
    pub fn apply_to(&self, devices: &mut DeviceModel) -> Result<(), DataError> {
        if self.light_sheets.len() != devices.num_light_sheets() {
            return Err(DataError::LightSheetCount {
                record: self.light_sheets.len(),
                instrument: devices.num_light_sheets(),
            });
        }
        if self.detection_arms.len() != devices.num_detection_arms() {
            return Err(DataError::DetectionArmCount {
                record: self.detection_arms.len(),
                instrument: devices.num_detection_arms(),
            });
        }

        for (sheet, record) in devices.light_sheets.iter_mut().zip(&self.light_sheets) {
            sheet.functions = record.functions.clone();
            sheet.adapt_power_to_width_height = record.adapt_power_to_width_height;
        }
        for (arm, function) in devices.detection_arms.iter_mut().zip(&self.detection_arms) {
            arm.z_function = *function;
        }
        Ok(())
    }

    /// Put the stored transforms back into an XY calibration
    pub fn restore_transforms(&self, xy: &mut XyCalibration) {
        for t in &self.transforms {
            xy.set_transform(
                t.light_sheet,
                t.detection_arm,
                SheetTransform {
                    matrix: matrix_from_row_major(&t.matrix),
                    origin: Vector2::new(t.origin[0], t.origin[1]),
                },
            );
        }
    }

    pub fn positioner_map(&self) -> BTreeMap<(usize, usize), LightSheetPositioner> {
        self.positioners
            .iter()
            .map(|p| ((p.light_sheet, p.detection_arm), p.positioner))
            .collect()
    }
}
