//! Light-sheet X/Y position calibration
//!
//! X and Y are probed independently. For each probe amplitude `f` the sheet
//! is moved to `+f`, `0` and `-f` on the probed axis, allowed to settle with
//! the camera off, and imaged once. The brightest-region centroid of each
//! image, in `[-1, 1]` image-relative coordinates, gives
//!
//! - an origin estimate: the median centroid at `0`
//! - a unit vector: the median of `(P - N) / 2f` over the amplitudes
//!
//! Once both probes have completed, the two unit vectors form the columns of
//! a 2x2 transform from control X/Y to sensor position. Applying the
//! calibration inverts the transform, maps the averaged origin back to a
//! control offset, and composes that offset onto the X/Y functions.

use nalgebra::{Matrix2, Vector2};
use shared::image_proc::normalized_centroid;
use shared::microscope::{AffineFunction, DeviceModel, LightSheetDof};
use sheet_math::{invert_matrix, matrix_from_columns_checked, median};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{linspace, CalibrationContext, CalibrationError};
use crate::config::EngineConfig;

/// Pixels at or above this fraction of the peak define the bright region
const CENTROID_FRACTION: f64 = 0.5;

/// Smallest accepted angle between the X and Y unit vectors
const MIN_AXIS_ANGLE_DEG: f64 = 5.0;

const CHART: &str = "XY";

/// Probed control axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisProbe {
    X,
    Y,
}

impl AxisProbe {
    fn dof(self) -> LightSheetDof {
        match self {
            AxisProbe::X => LightSheetDof::X,
            AxisProbe::Y => LightSheetDof::Y,
        }
    }

    fn other(self) -> LightSheetDof {
        match self {
            AxisProbe::X => LightSheetDof::Y,
            AxisProbe::Y => LightSheetDof::X,
        }
    }
}

/// Result of probing one axis on one detection arm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeEstimate {
    pub origin: Vector2<f64>,
    pub unit_vector: Vector2<f64>,
}

/// Control-to-sensor mapping of one (light sheet, detection arm)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SheetTransform {
    pub matrix: Matrix2<f64>,
    pub origin: Vector2<f64>,
}

#[derive(Debug, Default)]
pub struct XyCalibration {
    probes: HashMap<(usize, usize, AxisProbe), ProbeEstimate>,
    transforms: HashMap<(usize, usize), SheetTransform>,
    /// Light sheets with transforms measured but not yet applied
    unapplied: HashSet<usize>,
}

impl XyCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform published for `(light_sheet, detection_arm)`
    pub fn transform(&self, light_sheet: usize, detection_arm: usize) -> Option<&SheetTransform> {
        self.transforms.get(&(light_sheet, detection_arm))
    }

    /// Every published transform keyed by `(light_sheet, detection_arm)`
    pub fn transforms(&self) -> impl Iterator<Item = ((usize, usize), &SheetTransform)> + '_ {
        self.transforms.iter().map(|(k, v)| (*k, v))
    }

    /// Replace a transform, used when loading a stored calibration
    pub fn set_transform(&mut self, light_sheet: usize, detection_arm: usize, transform: SheetTransform) {
        self.transforms.insert((light_sheet, detection_arm), transform);
    }

    /// Probe amplitudes between 0.5 and 0.7 of the usable X/Y excursion
    fn amplitudes(devices: &DeviceModel, light_sheet: usize, points: usize) -> Result<Vec<f64>, CalibrationError> {
        let sheet = devices.light_sheet(light_sheet)?;
        let excursion = sheet
            .x
            .max_symmetric_excursion()
            .min(sheet.y.max_symmetric_excursion());
        Ok(linspace(0.5 * excursion, 0.7 * excursion, points.max(1)))
    }

    /// Probe one axis and record the estimate of every detection arm
    pub fn probe(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        axis: AxisProbe,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        let amplitudes = Self::amplitudes(ctx.microscope.devices(), light_sheet, config.xy_points)?;
        let num_arms = ctx.microscope.num_detection_arms();

        let mut queue = ctx.microscope.build_queue();
        let frame = queue.current_mut();
        frame.selected_light_sheet = light_sheet;
        frame.set(light_sheet, axis.other(), 0.0);

        let mut positions = Vec::with_capacity(3 * amplitudes.len());
        for &f in &amplitudes {
            for position in [f, 0.0, -f] {
                queue.current_mut().set(light_sheet, axis.dof(), position);
                queue.current_mut().camera_on = false;
                for _ in 0..config.xy_settle_frames {
                    queue.add_current_state();
                }
                queue.current_mut().camera_on = true;
                queue.add_current_state();
                positions.push(position);
            }
        }

        let stacks = ctx.play(&queue)?;

        for arm in 0..num_arms {
            let stack = CalibrationContext::arm_stack(&stacks, arm, positions.len())?;
            let centers: Vec<Option<Vector2<f64>>> = stack
                .planes()
                .map(|plane| {
                    normalized_centroid(plane, CENTROID_FRACTION).map(|(x, y)| Vector2::new(x, y))
                })
                .collect();

            let series = format!("LS{light_sheet} D{arm} {axis:?}");
            for (i, (position, center)) in positions.iter().zip(&centers).enumerate() {
                if let Some(c) = center {
                    ctx.sink.add_point(CHART, &series, i == 0, *position, c.x);
                }
            }

            match estimate(&amplitudes, &centers) {
                Some(estimate) => {
                    debug!(
                        light_sheet,
                        arm,
                        ?axis,
                        origin_x = estimate.origin.x,
                        origin_y = estimate.origin.y,
                        "XY probe estimated"
                    );
                    self.probes.insert((light_sheet, arm, axis), estimate);
                }
                None => warn!(
                    "XY probe {:?} found no spot for light sheet {} on detection arm {}",
                    axis, light_sheet, arm
                ),
            }
        }
        Ok(())
    }

    /// Probe X then Y and publish transforms for arms where both succeeded
    pub fn calibrate(
        &mut self,
        ctx: &mut CalibrationContext<'_>,
        light_sheet: usize,
        config: &EngineConfig,
    ) -> Result<(), CalibrationError> {
        self.probes.retain(|(l, _, _), _| *l != light_sheet);
        self.transforms.retain(|(l, _), _| *l != light_sheet);
        self.unapplied.remove(&light_sheet);
        self.probe(ctx, light_sheet, AxisProbe::X, config)?;
        self.probe(ctx, light_sheet, AxisProbe::Y, config)?;

        for arm in 0..ctx.microscope.num_detection_arms() {
            let x = self.probes.get(&(light_sheet, arm, AxisProbe::X));
            let y = self.probes.get(&(light_sheet, arm, AxisProbe::Y));
            let (Some(x), Some(y)) = (x, y) else {
                continue;
            };
            match matrix_from_columns_checked(x.unit_vector, y.unit_vector, MIN_AXIS_ANGLE_DEG) {
                Ok(matrix) => {
                    self.unapplied.insert(light_sheet);
                    self.transforms.insert(
                        (light_sheet, arm),
                        SheetTransform {
                            matrix,
                            origin: (x.origin + y.origin) / 2.0,
                        },
                    );
                }
                Err(e) => warn!(
                    "Light sheet {} detection arm {}: {}",
                    light_sheet, arm, e
                ),
            }
        }
        Ok(())
    }

    /// Compose the centring offset onto the X/Y functions
    ///
    /// The height function is reset to identity. Returns `|ox| + |oy|` of
    /// the control offset, or infinity when no transform is available.
    pub fn apply(
        &mut self,
        devices: &mut DeviceModel,
        light_sheet: usize,
    ) -> Result<f64, CalibrationError> {
        if !self.unapplied.remove(&light_sheet) {
            warn!("No new XY transform for light sheet {}", light_sheet);
            return Ok(f64::INFINITY);
        }
        let transforms: Vec<SheetTransform> = self
            .transforms
            .iter()
            .filter(|((l, _), _)| *l == light_sheet)
            .map(|(_, t)| *t)
            .collect();
        if transforms.is_empty() {
            warn!("No XY transform for light sheet {}", light_sheet);
            return Ok(f64::INFINITY);
        }

        let n = transforms.len() as f64;
        let matrix = transforms.iter().map(|t| t.matrix).sum::<Matrix2<f64>>() / n;
        let origin = transforms.iter().map(|t| t.origin).sum::<Vector2<f64>>() / n;
        let offset = invert_matrix(&matrix)? * origin;

        let sheet = devices.light_sheet_mut(light_sheet)?;
        sheet
            .function_mut(LightSheetDof::X)
            .compose_with(&AffineFunction::axplusb(1.0, -offset.x));
        sheet
            .function_mut(LightSheetDof::Y)
            .compose_with(&AffineFunction::axplusb(1.0, -offset.y));
        sheet.function_mut(LightSheetDof::Height).reset();

        info!(
            "XY light sheet {}: origin ({:.4}, {:.4}), control offset ({:.4}, {:.4})",
            light_sheet, origin.x, origin.y, offset.x, offset.y
        );
        Ok(offset.x.abs() + offset.y.abs())
    }

    pub fn reset(&mut self) {
        self.probes.clear();
        self.transforms.clear();
        self.unapplied.clear();
    }
}

/// Origin and unit vector from centres ordered `[+f, 0, -f]` per amplitude
fn estimate(amplitudes: &[f64], centers: &[Option<Vector2<f64>>]) -> Option<ProbeEstimate> {
    let mut origins_x = Vec::new();
    let mut origins_y = Vec::new();
    let mut units_x = Vec::new();
    let mut units_y = Vec::new();

    for (&f, triple) in amplitudes.iter().zip(centers.chunks(3)) {
        let [p, z, n] = triple else {
            continue;
        };
        if let Some(z) = z {
            origins_x.push(z.x);
            origins_y.push(z.y);
        }
        if let (Some(p), Some(n)) = (p, n) {
            if f > 0.0 {
                let unit = (p - n) / (2.0 * f);
                units_x.push(unit.x);
                units_y.push(unit.y);
            }
        }
    }

    Some(ProbeEstimate {
        origin: Vector2::new(median(&origins_x).ok()?, median(&origins_y).ok()?),
        unit_vector: Vector2::new(median(&units_x).ok()?, median(&units_y).ok()?),
    })
}
