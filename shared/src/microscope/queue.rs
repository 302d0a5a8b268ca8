//! Acquisition queues
//!
//! A queue is an ordered list of device-state frames that the instrument
//! plays back as a single acquisition. Frames with the camera off move the
//! hardware without recording an image, which is how settle frames are
//! expressed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::devices::DeviceModel;
use super::state::LightSheetDof;

/// Control values of one light sheet within a frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightSheetState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub alpha: f64,
    pub width: f64,
    pub height: f64,
    pub power: f64,
}

impl LightSheetState {
    pub fn get(&self, dof: LightSheetDof) -> f64 {
        match dof {
            LightSheetDof::X => self.x,
            LightSheetDof::Y => self.y,
            LightSheetDof::Z => self.z,
            LightSheetDof::Alpha => self.alpha,
            LightSheetDof::Width => self.width,
            LightSheetDof::Height => self.height,
            LightSheetDof::Power => self.power,
        }
    }

    pub fn set(&mut self, dof: LightSheetDof, value: f64) {
        match dof {
            LightSheetDof::X => self.x = value,
            LightSheetDof::Y => self.y = value,
            LightSheetDof::Z => self.z = value,
            LightSheetDof::Alpha => self.alpha = value,
            LightSheetDof::Width => self.width = value,
            LightSheetDof::Height => self.height = value,
            LightSheetDof::Power => self.power = value,
        }
    }
}

/// Full instrument state for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub light_sheets: Vec<LightSheetState>,
    /// Light sheet switched on for this frame
    pub selected_light_sheet: usize,
    /// Control Z of each detection arm
    pub detection_z: Vec<f64>,
    /// Record an image on every detection arm
    pub camera_on: bool,
    pub exposure: Duration,
}

impl DeviceState {
    /// All positions at zero, width at half and height and power at full scale
    pub fn zero(num_light_sheets: usize, num_detection_arms: usize) -> Self {
        Self {
            light_sheets: vec![
                LightSheetState {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    alpha: 0.0,
                    width: 0.5,
                    height: 1.0,
                    power: 1.0,
                };
                num_light_sheets
            ],
            selected_light_sheet: 0,
            detection_z: vec![0.0; num_detection_arms],
            camera_on: true,
            exposure: Duration::from_millis(10),
        }
    }

    /// Current setting values of every device
    pub fn from_devices(devices: &DeviceModel) -> Self {
        Self {
            light_sheets: devices
                .light_sheets
                .iter()
                .map(|ls| LightSheetState {
                    x: ls.x.value,
                    y: ls.y.value,
                    z: ls.z.value,
                    alpha: ls.alpha.value,
                    width: ls.width.value,
                    height: ls.height.value,
                    power: ls.power.value,
                })
                .collect(),
            selected_light_sheet: 0,
            detection_z: devices.detection_arms.iter().map(|d| d.z.value).collect(),
            camera_on: true,
            exposure: Duration::from_millis(10),
        }
    }

    /// Set one DOF of one light sheet; out-of-range indices are ignored
    pub fn set(&mut self, light_sheet: usize, dof: LightSheetDof, value: f64) {
        if let Some(state) = self.light_sheets.get_mut(light_sheet) {
            state.set(dof, value);
        }
    }

    pub fn get(&self, light_sheet: usize, dof: LightSheetDof) -> Option<f64> {
        self.light_sheets.get(light_sheet).map(|s| s.get(dof))
    }

    /// Move every detection arm to the same control Z
    pub fn set_all_detection_z(&mut self, z: f64) {
        for dz in self.detection_z.iter_mut() {
            *dz = z;
        }
    }
}

/// Ordered frames played back as one acquisition
///
/// Build frames by editing [`AcquisitionQueue::current_mut`] and then
/// calling [`AcquisitionQueue::add_current_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionQueue {
    current: DeviceState,
    frames: Vec<DeviceState>,
    transition_time: Duration,
}

impl AcquisitionQueue {
    pub fn new(initial: DeviceState) -> Self {
        Self {
            current: initial,
            frames: Vec::new(),
            transition_time: Duration::ZERO,
        }
    }

    pub fn current(&self) -> &DeviceState {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut DeviceState {
        &mut self.current
    }

    /// Append a snapshot of the current state
    pub fn add_current_state(&mut self) {
        self.frames.push(self.current.clone());
    }

    pub fn add_frame(&mut self, frame: DeviceState) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[DeviceState] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames that produce an image
    pub fn camera_frame_count(&self) -> usize {
        self.frames.iter().filter(|f| f.camera_on).count()
    }

    pub fn transition_time(&self) -> Duration {
        self.transition_time
    }

    pub fn set_transition_time(&mut self, transition_time: Duration) {
        self.transition_time = transition_time;
    }

    /// Wall time the instrument needs to play this queue
    pub fn duration(&self) -> Duration {
        self.transition_time
            + self
                .frames
                .iter()
                .map(|f| f.exposure)
                .sum::<Duration>()
    }

    /// `base + per_frame × len`
    pub fn timeout(&self, base: Duration, per_frame: Duration) -> Duration {
        base + per_frame * self.frames.len() as u32
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_current_state_snapshots() {
        let mut queue = AcquisitionQueue::new(DeviceState::zero(2, 1));

        queue.current_mut().set(1, LightSheetDof::Alpha, 3.0);
        queue.add_current_state();
        queue.current_mut().set(1, LightSheetDof::Alpha, -3.0);
        queue.current_mut().camera_on = false;
        queue.add_current_state();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.frames()[0].get(1, LightSheetDof::Alpha), Some(3.0));
        assert_eq!(queue.frames()[1].get(1, LightSheetDof::Alpha), Some(-3.0));
        assert_eq!(queue.camera_frame_count(), 1);
    }

    #[test]
    fn test_timeout_scales_with_length() {
        let mut queue = AcquisitionQueue::new(DeviceState::zero(1, 1));
        for _ in 0..7 {
            queue.add_current_state();
        }

        let timeout = queue.timeout(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(timeout, Duration::from_secs(17));
    }

    #[test]
    fn test_duration_includes_transition() {
        let mut queue = AcquisitionQueue::new(DeviceState::zero(1, 1));
        queue.current_mut().exposure = Duration::from_millis(20);
        queue.add_current_state();
        queue.add_current_state();
        queue.set_transition_time(Duration::from_millis(5));

        assert_eq!(queue.duration(), Duration::from_millis(45));
    }

    #[test]
    fn test_from_devices_reads_settings() {
        let mut devices = DeviceModel::new(1, 2);
        devices.light_sheets[0].width.set(0.7);
        devices.detection_arms[1].z.set(12.0);

        let state = DeviceState::from_devices(&devices);

        assert_eq!(state.get(0, LightSheetDof::Width), Some(0.7));
        assert_eq!(state.detection_z, vec![0.0, 12.0]);
    }
}
