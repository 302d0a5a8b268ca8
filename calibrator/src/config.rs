//! Configuration for calibration and adaptation runs
//!
//! Both structs derive `clap::Args` so binaries can flatten them straight
//! into their command line, and `serde` so a run's parameters can be stored
//! next to its results.

use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};
use sheet_math::ControlPlaneLayout;
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::ExecutionMode;

/// Parameters of the calibration orchestrator and its axis modules
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Calibrate light-sheet Z against the detection focal plane",
        long_help = "Sweep detection Z at several light-sheet Z positions, locate the sharpest \
            plane and correct the light-sheet Z function. Runs first, and again after angle \
            or XY calibration changed the sheet geometry."
    )]
    pub calibrate_z: bool,

    #[arg(long, help = "Calibrate light-sheet angle")]
    pub calibrate_angle: bool,

    #[arg(long, help = "Calibrate light-sheet X/Y position transform")]
    pub calibrate_xy: bool,

    #[arg(
        long,
        help = "Balance power across light sheets",
        long_help = "Measure a robust intensity for every light sheet at the same control power \
            and rescale each power function so all light sheets match light sheet 0. Runs once \
            after XY and once more at the end of the sequence."
    )]
    pub calibrate_power: bool,

    #[arg(long, help = "Align light-sheet width functions")]
    pub calibrate_width: bool,

    #[arg(long, help = "Fit power compensation against sheet height")]
    pub calibrate_height_power: bool,

    #[arg(long, help = "Fit power compensation against sheet width")]
    pub calibrate_width_power: bool,

    #[arg(
        long = "skip-light-sheet",
        value_name = "INDEX",
        help = "Light sheet to leave out of per-sheet calibrations (repeatable)"
    )]
    pub skipped_light_sheets: Vec<usize>,

    #[arg(
        long,
        default_value_t = 3,
        help = "Calibrate+apply cycles per axis",
        long_help = "Hard cap on calibrate+apply cycles for one axis. Reaching the cap is not a \
            failure: the run reports the last residual and moves on."
    )]
    pub max_iterations: usize,

    #[arg(long, default_value_t = 0.02, help = "Residual below which Z calibration stops")]
    pub z_threshold: f64,

    #[arg(long, default_value_t = 0.5, help = "Residual (degrees) below which angle calibration stops")]
    pub angle_threshold: f64,

    #[arg(long, default_value_t = 0.05, help = "Residual below which XY calibration stops")]
    pub xy_threshold: f64,

    #[arg(long, default_value_t = 0.04, help = "Residual below which power balancing stops")]
    pub power_threshold: f64,

    #[arg(long, default_value_t = 0.05, help = "Residual below which width alignment stops")]
    pub width_threshold: f64,

    #[arg(long, default_value_t = 13, help = "Detection Z samples per Z sweep")]
    pub z_samples: usize,

    #[arg(
        long,
        default_value_t = 3,
        help = "Light-sheet Z positions probed per Z calibration",
        long_help = "Number of light-sheet Z positions, spread over the middle half of the Z \
            range, at which the in-focus detection Z is measured. Two or more are needed to fit \
            the Z gain as well as the offset."
    )]
    pub z_illumination_positions: usize,

    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Align detection arms to each other during Z calibration of light sheet 0"
    )]
    pub adjust_detection_z: bool,

    #[arg(long, default_value_t = 32, help = "Angles sampled per angle sweep")]
    pub angle_samples: usize,

    #[arg(long, default_value_t = 4, help = "Repeats averaged per sampled angle")]
    pub angle_repeats: usize,

    #[arg(long, default_value_t = 20.0, help = "Total angle range swept, degrees")]
    pub angle_range: f64,

    #[arg(long, default_value_t = 3, help = "Probe amplitudes per XY axis")]
    pub xy_points: usize,

    #[arg(long, default_value_t = 6, help = "Settle frames before each XY probe image")]
    pub xy_settle_frames: usize,

    #[arg(long, default_value_t = 8, help = "Frames per light sheet for power balancing")]
    pub power_samples: usize,

    #[arg(long, default_value_t = 16, help = "Width samples per width sweep")]
    pub width_samples: usize,

    #[arg(long, default_value_t = 8, help = "Height or width samples for power compensation")]
    pub dimension_samples: usize,

    #[arg(long, default_value_t = 16, help = "Power samples per compensation point")]
    pub dimension_power_samples: usize,

    #[arg(long, default_value_t = 0, help = "Detection arm used for power compensation")]
    pub compensation_detection_arm: usize,

    #[arg(
        long,
        default_value_t = 10.0,
        help = "Acquisition timeout base, seconds",
        long_help = "Every queue is given `base + per_frame × frames` to complete before the \
            acquisition is treated as failed."
    )]
    pub timeout_base_s: f64,

    #[arg(long, default_value_t = 1.0, help = "Acquisition timeout per frame, seconds")]
    pub timeout_per_frame_s: f64,

    #[arg(long, default_value = "system", help = "Name of the stored calibration record")]
    pub calibration_name: String,

    #[arg(
        long,
        help = "Directory holding calibration records",
        long_help = "Directory where calibration records are saved and loaded as <name>.json. \
            Defaults to ~/.lsm_config/calibration."
    )]
    pub calibration_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn timeout_base(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_base_s.max(0.0))
    }

    pub fn timeout_per_frame(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_per_frame_s.max(0.0))
    }

    pub fn is_light_sheet_enabled(&self, light_sheet: usize) -> bool {
        !self.skipped_light_sheets.contains(&light_sheet)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            calibrate_z: true,
            calibrate_angle: false,
            calibrate_xy: false,
            calibrate_power: false,
            calibrate_width: false,
            calibrate_height_power: false,
            calibrate_width_power: false,
            skipped_light_sheets: Vec::new(),
            max_iterations: 3,
            z_threshold: 0.02,
            angle_threshold: 0.5,
            xy_threshold: 0.05,
            power_threshold: 0.04,
            width_threshold: 0.05,
            z_samples: 13,
            z_illumination_positions: 3,
            adjust_detection_z: true,
            angle_samples: 32,
            angle_repeats: 4,
            angle_range: 20.0,
            xy_points: 3,
            xy_settle_frames: 6,
            power_samples: 8,
            width_samples: 16,
            dimension_samples: 8,
            dimension_power_samples: 16,
            compensation_detection_arm: 0,
            timeout_base_s: 10.0,
            timeout_per_frame_s: 1.0,
            calibration_name: "system".to_string(),
            calibration_dir: None,
        }
    }
}

/// Parameters of the ND-iterator adaptation modules
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationConfig {
    #[arg(long = "adaptation-samples", default_value_t = 17, help = "Samples per adaptation sweep")]
    pub num_samples: usize,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Minimum fit probability to trust a measured correction",
        long_help = "If the best detection arm's fit probability is below this value the measured \
            correction is discarded and replaced by one interpolated from neighbouring control \
            planes."
    )]
    pub probability_threshold: f64,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Minimum metric peak to trust a measured correction"
    )]
    pub metric_threshold: f64,

    #[arg(long, default_value_t = 0.01, help = "Exposure per adaptation frame, seconds")]
    pub exposure_s: f64,

    #[arg(long, default_value_t = 1.0, help = "Laser power during adaptation sweeps")]
    pub laser_power: f64,

    #[arg(long, help = "Flip the sign of measured corrections")]
    pub flip_sign: bool,

    #[arg(long, value_enum, default_value_t = ExecutionMode::Concurrent, help = "Metric task execution")]
    pub execution_mode: ExecutionMode,

    #[arg(long, default_value_t = 2, help = "Metric worker threads")]
    pub workers: usize,

    #[arg(long, default_value_t = 4, help = "Duplicated stacks alive at once")]
    pub recycler_capacity: usize,

    #[arg(long, default_value_t = 5, help = "Control planes along the detection range")]
    pub control_planes: usize,

    #[arg(long, help = "Pack control planes towards both ends of the range")]
    pub circular_layout: bool,

    #[arg(long, default_value_t = 10.0, help = "Half range of the Z adaptation sweep")]
    pub z_search_range: f64,

    #[arg(long, default_value_t = 10.0, help = "Half range of the angle adaptation sweep, degrees")]
    pub alpha_search_range: f64,

    #[arg(long, default_value_t = 10.0, help = "Adaptation acquisition timeout base, seconds")]
    pub adaptation_timeout_base_s: f64,

    #[arg(long, default_value_t = 1.0, help = "Adaptation acquisition timeout per frame, seconds")]
    pub adaptation_timeout_per_frame_s: f64,
}

impl AdaptationConfig {
    pub fn exposure(&self) -> Duration {
        Duration::from_secs_f64(self.exposure_s.max(0.0))
    }

    pub fn timeout_base(&self) -> Duration {
        Duration::from_secs_f64(self.adaptation_timeout_base_s.max(0.0))
    }

    pub fn timeout_per_frame(&self) -> Duration {
        Duration::from_secs_f64(self.adaptation_timeout_per_frame_s.max(0.0))
    }

    pub fn layout(&self) -> ControlPlaneLayout {
        if self.circular_layout {
            ControlPlaneLayout::Circular
        } else {
            ControlPlaneLayout::Linear
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            num_samples: 17,
            probability_threshold: 0.2,
            metric_threshold: 0.0,
            exposure_s: 0.01,
            laser_power: 1.0,
            flip_sign: false,
            execution_mode: ExecutionMode::Concurrent,
            workers: 2,
            recycler_capacity: 4,
            control_planes: 5,
            circular_layout: false,
            z_search_range: 10.0,
            alpha_search_range: 10.0,
            adaptation_timeout_base_s: 10.0,
            adaptation_timeout_per_frame_s: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        engine: EngineConfig,
        #[command(flatten)]
        adaptation: AdaptationConfig,
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert!(config.calibrate_z);
        assert!(!config.calibrate_xy);
        assert_eq!(config.max_iterations, 3);
        assert_abs_diff_eq!(config.z_threshold, 0.02, epsilon = f64::EPSILON);
        assert_abs_diff_eq!(config.angle_threshold, 0.5, epsilon = f64::EPSILON);
        assert_abs_diff_eq!(config.xy_threshold, 0.05, epsilon = f64::EPSILON);
        assert_abs_diff_eq!(config.power_threshold, 0.04, epsilon = f64::EPSILON);
        assert_eq!(config.z_samples, 13);
        assert_eq!(config.timeout_base(), Duration::from_secs(10));
    }

    #[test]
    fn test_cli_defaults_match_default_impl() {
        let cli = TestCli::parse_from(["test"]);

        assert_eq!(cli.engine, EngineConfig::default());
        assert_eq!(cli.adaptation, AdaptationConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = TestCli::parse_from([
            "test",
            "--calibrate-z",
            "false",
            "--calibrate-xy",
            "--skip-light-sheet",
            "1",
            "--execution-mode",
            "sequential",
        ]);

        assert!(!cli.engine.calibrate_z);
        assert!(cli.engine.calibrate_xy);
        assert!(!cli.engine.is_light_sheet_enabled(1));
        assert!(cli.engine.is_light_sheet_enabled(0));
        assert_eq!(cli.adaptation.execution_mode, ExecutionMode::Sequential);
    }
}
