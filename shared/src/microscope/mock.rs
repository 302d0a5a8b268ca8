//! Simulated lightsheet microscope
//!
//! Renders each camera frame from a small optical model:
//!
//! - a fixed random sample texture, blurred by defocus between light sheet
//!   and detection plane, by angular misalignment and by width mismatch
//! - a Gaussian illumination spot whose sensor position is a hidden affine
//!   map of the hardware X/Y
//! - spot intensity proportional to hardware power and falling with sheet
//!   height and width
//!
//! Hidden per-device offsets ([`SheetTruth`]) are what the calibrators are
//! expected to discover. Rendering is deterministic for a given seed.

use nalgebra::Vector2;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use sheet_math::{matrix_from_row_major, matrix_to_row_major, sheet_response};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use super::devices::DeviceModel;
use super::queue::{AcquisitionQueue, DeviceState};
use super::state::LightSheetDof;
use super::{AcquisitionError, AcquisitionResult, Microscope};
use crate::image_proc::ImageStack;

/// Hidden physical parameters of one light sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetTruth {
    /// Hardware Z at which the sheet meets a detection plane at Z = 0
    pub z_offset: f64,
    /// Hardware angle giving the sharpest image
    pub alpha_offset: f64,
    /// Hardware width giving the sharpest image
    pub width_optimum: f64,
    /// Row-major map from hardware (X, Y) to normalized sensor position
    pub position_matrix: [f64; 4],
    /// Sensor position at hardware (0, 0)
    pub position_offset: [f64; 2],
    /// Relative brightness of this illumination path
    pub efficiency: f64,
}

/// Rendering and hidden-truth parameters of the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub image_width: usize,
    pub image_height: usize,
    pub seed: u64,
    /// Blur sigma in focus, pixels
    pub base_blur_px: f64,
    /// Additional blur per unit of defocus
    pub defocus_blur_px: f64,
    /// Additional blur per degree of angular error
    pub angle_blur_px: f64,
    /// Additional blur per unit of width error
    pub width_blur_px: f64,
    pub max_blur_px: f64,
    /// Illumination spot sigma in normalized sensor units
    pub spot_sigma: f64,
    /// Fraction of the spot modulated by the sample texture
    pub texture_contrast: f64,
    pub peak_counts: f64,
    pub background: f64,
    pub noise_sigma: f64,
    pub sheets: Vec<SheetTruth>,
    /// Hardware Z of each detection arm's focal plane
    pub detection_z_offsets: Vec<f64>,
}

impl Default for SimulationParams {
    fn default() -> Self {
        let m0 = sheet_response(0.1, 0.5, 0.5);
        Self {
            image_width: 64,
            image_height: 64,
            seed: 42,
            base_blur_px: 0.6,
            defocus_blur_px: 0.15,
            angle_blur_px: 0.25,
            width_blur_px: 8.0,
            max_blur_px: 6.0,
            spot_sigma: 0.25,
            texture_contrast: 0.4,
            peak_counts: 4000.0,
            background: 100.0,
            noise_sigma: 2.0,
            sheets: vec![
                SheetTruth {
                    z_offset: 3.0,
                    alpha_offset: 2.0,
                    width_optimum: 0.45,
                    position_matrix: matrix_to_row_major(&m0),
                    position_offset: [0.12, -0.08],
                    efficiency: 1.0,
                },
                SheetTruth {
                    z_offset: -2.0,
                    alpha_offset: -1.5,
                    width_optimum: 0.6,
                    position_matrix: [0.48, 0.06, -0.04, 0.52],
                    position_offset: [-0.1, 0.05],
                    efficiency: 0.8,
                },
            ],
            detection_z_offsets: vec![0.0, 1.5],
        }
    }
}

/// Deterministic stand-in for a lightsheet microscope
pub struct SimulatedMicroscope {
    devices: DeviceModel,
    params: SimulationParams,
    texture: Array2<f64>,
    blur_cache: HashMap<u64, Array2<f64>>,
    rng: StdRng,
    noise: Option<Normal<f64>>,
    pending_failures: VecDeque<AcquisitionError>,
    plays: usize,
}

const BLUR_CACHE_STEPS_PER_PX: f64 = 20.0;

impl SimulatedMicroscope {
    pub fn new(params: SimulationParams) -> Self {
        let devices = DeviceModel::new(params.sheets.len(), params.detection_z_offsets.len());
        Self::with_devices(params, devices)
    }

    pub fn with_devices(params: SimulationParams, devices: DeviceModel) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let texture = Array2::from_shape_fn((params.image_height, params.image_width), |_| {
            rng.gen::<f64>()
        });
        let noise = Normal::new(0.0, params.noise_sigma)
            .ok()
            .filter(|_| params.noise_sigma > 0.0);

        Self {
            devices,
            params,
            texture,
            blur_cache: HashMap::new(),
            rng,
            noise,
            pending_failures: VecDeque::new(),
            plays: 0,
        }
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Number of queues played, including failed ones
    pub fn plays(&self) -> usize {
        self.plays
    }

    /// Make the next play fail with `error`; calls accumulate in order
    pub fn fail_next(&mut self, error: AcquisitionError) {
        self.pending_failures.push_back(error);
    }

    /// Defocus seen by `arm` when sheet and arm are both commanded to `z`
    pub fn residual_defocus(&self, light_sheet: usize, arm: usize, z: f64) -> f64 {
        let sheet = &self.devices.light_sheets[light_sheet];
        let det = &self.devices.detection_arms[arm];
        let hw_sheet = sheet.hardware_value(LightSheetDof::Z, z);
        let hw_det = det.z_function.apply(z);
        (hw_sheet - self.params.sheets[light_sheet].z_offset)
            - (hw_det - self.params.detection_z_offsets[arm])
    }

    /// Angular error when the sheet is commanded to angle 0
    pub fn residual_alpha(&self, light_sheet: usize) -> f64 {
        self.devices.light_sheets[light_sheet].hardware_value(LightSheetDof::Alpha, 0.0)
            - self.params.sheets[light_sheet].alpha_offset
    }

    /// Width error when the sheet is commanded to `width`
    pub fn residual_width(&self, light_sheet: usize, width: f64) -> f64 {
        self.devices.light_sheets[light_sheet].hardware_value(LightSheetDof::Width, width)
            - self.params.sheets[light_sheet].width_optimum
    }

    /// Normalized sensor position of the spot for control `(x, y)`
    pub fn sensor_position(&self, light_sheet: usize, x: f64, y: f64) -> Vector2<f64> {
        let sheet = &self.devices.light_sheets[light_sheet];
        let truth = &self.params.sheets[light_sheet];
        let hw = Vector2::new(
            sheet.hardware_value(LightSheetDof::X, x),
            sheet.hardware_value(LightSheetDof::Y, y),
        );
        matrix_from_row_major(&truth.position_matrix) * hw
            + Vector2::new(truth.position_offset[0], truth.position_offset[1])
    }

    /// Spot peak above background for a frame
    pub fn spot_intensity(&self, frame: &DeviceState) -> f64 {
        let l = frame.selected_light_sheet;
        let state = &frame.light_sheets[l];
        let sheet = &self.devices.light_sheets[l];
        let hw_height = sheet.hardware_value(LightSheetDof::Height, state.height).max(0.0);
        let hw_width = sheet.hardware_value(LightSheetDof::Width, state.width).max(0.0);
        let power = sheet
            .hardware_power(state.power, state.height, state.width)
            .max(0.0);

        self.params.peak_counts
            * power
            * self.params.sheets[l].efficiency
            * (2.0 / (1.0 + hw_height))
            * (1.5 / (1.0 + hw_width))
    }

    fn blur_sigma(&self, frame: &DeviceState, arm: usize) -> f64 {
        let l = frame.selected_light_sheet;
        let state = &frame.light_sheets[l];
        let sheet = &self.devices.light_sheets[l];
        let truth = &self.params.sheets[l];
        let det = &self.devices.detection_arms[arm];

        let hw_sheet_z = sheet.hardware_value(LightSheetDof::Z, state.z);
        let hw_det_z = det.z_function.apply(frame.detection_z[arm]);
        let defocus = (hw_sheet_z - truth.z_offset)
            - (hw_det_z - self.params.detection_z_offsets[arm]);
        let alpha_error = sheet.hardware_value(LightSheetDof::Alpha, state.alpha) - truth.alpha_offset;
        let width_error = sheet.hardware_value(LightSheetDof::Width, state.width) - truth.width_optimum;

        let p = &self.params;
        (p.base_blur_px
            + p.defocus_blur_px * defocus.abs()
            + p.angle_blur_px * alpha_error.abs()
            + p.width_blur_px * width_error.abs())
        .min(p.max_blur_px)
    }

    fn blurred_texture(&mut self, sigma: f64) -> Array2<f64> {
        let key = (sigma * BLUR_CACHE_STEPS_PER_PX).round() as u64;
        if let Some(cached) = self.blur_cache.get(&key) {
            return cached.clone();
        }
        let blurred = gaussian_blur(&self.texture, key as f64 / BLUR_CACHE_STEPS_PER_PX);
        self.blur_cache.insert(key, blurred.clone());
        blurred
    }

    fn render(&mut self, frame: &DeviceState, arm: usize) -> Array2<u16> {
        let l = frame.selected_light_sheet;
        let state = frame.light_sheets[l];
        let sigma = self.blur_sigma(frame, arm);
        let texture = self.blurred_texture(sigma);
        let intensity = self.spot_intensity(frame);
        let position = self.sensor_position(l, state.x, state.y);

        let (h, w) = (self.params.image_height, self.params.image_width);
        let half_w = w as f64 / 2.0;
        let half_h = h as f64 / 2.0;
        let two_s2 = 2.0 * self.params.spot_sigma.powi(2);
        let contrast = self.params.texture_contrast;
        let background = self.params.background;

        let mut plane = Array2::zeros((h, w));
        for ((r, c), value) in plane.indexed_iter_mut() {
            let nx = (c as f64 - half_w) / half_w;
            let ny = (r as f64 - half_h) / half_h;
            let d2 = (nx - position.x).powi(2) + (ny - position.y).powi(2);
            let envelope = (-d2 / two_s2).exp();
            let modulation = 1.0 - contrast + contrast * texture[[r, c]];
            let noise = match &self.noise {
                Some(normal) => normal.sample(&mut self.rng),
                None => 0.0,
            };
            let v = background + intensity * envelope * modulation + noise;
            *value = v.clamp(0.0, u16::MAX as f64) as u16;
        }
        plane
    }
}

impl Microscope for SimulatedMicroscope {
    fn devices(&self) -> &DeviceModel {
        &self.devices
    }

    fn devices_mut(&mut self) -> &mut DeviceModel {
        &mut self.devices
    }

    fn play_queue(
        &mut self,
        queue: &AcquisitionQueue,
        timeout: Duration,
    ) -> AcquisitionResult<Vec<ImageStack>> {
        self.plays += 1;
        if let Some(error) = self.pending_failures.pop_front() {
            return Err(error);
        }
        if queue.duration() > timeout {
            return Err(AcquisitionError::Timeout(timeout));
        }

        let num_arms = self.devices.num_detection_arms();
        let num_sheets = self.devices.num_light_sheets();
        let mut planes: Vec<Vec<Array2<u16>>> = vec![Vec::new(); num_arms];

        for frame in queue.frames().iter().filter(|f| f.camera_on) {
            if frame.selected_light_sheet >= num_sheets
                || frame.light_sheets.len() != num_sheets
                || frame.detection_z.len() != num_arms
            {
                return Err(AcquisitionError::Execution(format!(
                    "frame does not match instrument ({num_sheets} light sheets, {num_arms} arms)"
                )));
            }
            for (arm, arm_planes) in planes.iter_mut().enumerate() {
                arm_planes.push(self.render(frame, arm));
            }
        }

        debug!(
            "Simulated queue: {} frames, {} recorded",
            queue.len(),
            queue.camera_frame_count()
        );

        planes
            .iter()
            .map(|p| {
                ImageStack::from_planes(p).map_err(|e| AcquisitionError::Execution(e.to_string()))
            })
            .collect()
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian blur with edge clamping
fn gaussian_blur(input: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma < 0.05 {
        return input.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let (h, w) = input.dim();

    let clamp = |i: i64, n: usize| i.clamp(0, n as i64 - 1) as usize;

    let horizontal = Array2::from_shape_fn((h, w), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| weight * input[[r, clamp(c as i64 + k as i64 - radius, w)]])
            .sum::<f64>()
    });
    Array2::from_shape_fn((h, w), |(r, c)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| weight * horizontal[[clamp(r as i64 + k as i64 - radius, h), c]])
            .sum::<f64>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::{dcts_per_plane, normalized_centroid};
    use approx::assert_relative_eq;

    fn single_frame(microscope: &SimulatedMicroscope, edit: impl Fn(&mut DeviceState)) -> AcquisitionQueue {
        let mut queue = microscope.build_queue();
        edit(queue.current_mut());
        queue.add_current_state();
        queue
    }

    #[test]
    fn test_one_stack_per_arm() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        let queue = single_frame(&microscope, |_| {});

        let stacks = microscope.play_queue(&queue, Duration::from_secs(5)).unwrap();

        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].num_planes(), 1);
        assert_eq!(stacks[1].plane_shape(), (64, 64));
    }

    #[test]
    fn test_camera_off_frames_are_not_recorded() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        let queue = single_frame(&microscope, |f| f.camera_on = false);

        let stacks = microscope.play_queue(&queue, Duration::from_secs(5)).unwrap();

        assert!(stacks.iter().all(|s| s.is_empty()));
    }

    #[test]
    fn test_timeout_when_queue_too_long() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        let queue = single_frame(&microscope, |f| f.exposure = Duration::from_secs(2));

        let err = microscope.play_queue(&queue, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, AcquisitionError::Timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_injected_failure_is_consumed() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        microscope.fail_next(AcquisitionError::Interrupted);
        let queue = single_frame(&microscope, |_| {});

        assert!(microscope.play_queue(&queue, Duration::from_secs(5)).is_err());
        assert!(microscope.play_queue(&queue, Duration::from_secs(5)).is_ok());
        assert_eq!(microscope.plays(), 2);
    }

    #[test]
    fn test_in_focus_frame_is_sharper() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        // sheet 0 is in focus on arm 0 at sheet Z = 3
        let focused = single_frame(&microscope, |f| f.light_sheets[0].z = 3.0);
        let defocused = single_frame(&microscope, |f| f.light_sheets[0].z = 23.0);

        let sharp = microscope.play_queue(&focused, Duration::from_secs(5)).unwrap();
        let soft = microscope.play_queue(&defocused, Duration::from_secs(5)).unwrap();

        assert!(dcts_per_plane(&sharp[0], 3.0)[0] > dcts_per_plane(&soft[0], 3.0)[0]);
    }

    #[test]
    fn test_spot_lands_at_hidden_offset() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        let queue = single_frame(&microscope, |_| {});

        let stacks = microscope.play_queue(&queue, Duration::from_secs(5)).unwrap();
        let (x, y) = normalized_centroid(stacks[0].plane(0), 0.5).unwrap();

        assert!((x - 0.12).abs() < 0.03, "x = {x}");
        assert!((y + 0.08).abs() < 0.03, "y = {y}");
    }

    #[test]
    fn test_residuals_follow_functions() {
        let mut microscope = SimulatedMicroscope::new(SimulationParams::default());
        assert_relative_eq!(microscope.residual_defocus(0, 0, 0.0), -3.0);
        assert_relative_eq!(microscope.residual_alpha(1), 1.5);

        microscope.devices_mut().light_sheets[0].functions.z.offset = 3.0;
        assert_relative_eq!(microscope.residual_defocus(0, 0, 0.0), 0.0);
    }

    #[test]
    fn test_blur_preserves_mean() {
        let input = Array2::from_shape_fn((16, 16), |(r, c)| ((r * 7 + c * 3) % 5) as f64);
        let blurred = gaussian_blur(&input, 1.5);
        let mean_in = input.mean().unwrap();
        let mean_out = blurred.mean().unwrap();
        assert!((mean_in - mean_out).abs() < 0.2);
        assert!(blurred.std(0.0) < input.std(0.0));
    }
}
