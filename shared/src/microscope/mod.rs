//! Instrument abstraction used by every calibrator
//!
//! A [`Microscope`] exposes its device control model and plays acquisition
//! queues, returning one [`ImageStack`] per detection arm. Hardware drivers
//! implement this trait; [`mock::SimulatedMicroscope`] implements it with
//! a deterministic optical model for tests and dry runs.

pub mod devices;
pub mod lock;
pub mod mock;
pub mod queue;
pub mod state;

pub use devices::{
    AffineFunction, BoundedSetting, DetectionArm, DeviceError, DeviceModel, LightSheet,
    LightSheetFunctions,
};
pub use lock::{TaskConflict, TaskGuard, TaskSlot};
pub use mock::{SheetTruth, SimulatedMicroscope, SimulationParams};
pub use queue::{AcquisitionQueue, DeviceState, LightSheetState};
pub use state::{InterpolatedAcquisitionState, InterpolationTables, LightSheetDof, TableError};

use std::time::Duration;
use thiserror::Error;

use crate::image_proc::ImageStack;

/// Failures from playing an acquisition queue
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),

    #[error("acquisition interrupted")]
    Interrupted,

    #[error("acquisition failed: {0}")]
    Execution(String),
}

pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

/// An instrument that can be commanded through acquisition queues
pub trait Microscope: Send {
    fn devices(&self) -> &DeviceModel;

    fn devices_mut(&mut self) -> &mut DeviceModel;

    fn num_light_sheets(&self) -> usize {
        self.devices().num_light_sheets()
    }

    fn num_detection_arms(&self) -> usize {
        self.devices().num_detection_arms()
    }

    /// Empty queue whose current state mirrors the device settings
    fn build_queue(&self) -> AcquisitionQueue {
        AcquisitionQueue::new(DeviceState::from_devices(self.devices()))
    }

    /// Play `queue` and wait for the stacks, one per detection arm
    ///
    /// A detection arm that recorded no frame returns an empty stack.
    fn play_queue(
        &mut self,
        queue: &AcquisitionQueue,
        timeout: Duration,
    ) -> AcquisitionResult<Vec<ImageStack>>;
}
