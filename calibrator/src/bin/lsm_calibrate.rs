//! Lightsheet calibration runner
//!
//! Runs the calibration sequence against the simulated microscope, stores
//! the result under the configured calibration name and prints the
//! calibrated functions. With `--adapt` it then runs Z and width adaptation
//! over the control planes and prints the resulting tables.

use anyhow::{Context, Result};
use calibrator::adaptation::{AdaptationW, AdaptationZ, AdaptiveEngine};
use calibrator::{AdaptationConfig, CalibrationEngine, CancellationToken, EngineConfig};
use clap::Parser;
use shared::microscope::{
    InterpolatedAcquisitionState, LightSheetDof, Microscope, SimulatedMicroscope, SimulationParams,
    TaskSlot,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Lightsheet calibration runner
#[derive(Parser, Debug)]
#[command(name = "lsm_calibrate")]
#[command(
    about = "Calibrate a lightsheet microscope and store the result",
    long_about = "Runs the closed-loop calibration sequence on a simulated lightsheet \
        microscope.\n\n\
        The sequence:\n  \
        1. Z focus per light sheet\n  \
        2. Angle and XY position per light sheet, if enabled\n  \
        3. Power balance between light sheets, if enabled\n  \
        4. Z again after angle or XY changes\n  \
        5. Width alignment and power compensation, if enabled\n\n\
        Each step repeats until its residual falls below the axis threshold or \
        the iteration cap is reached. The calibrated functions are saved under \
        --calibration-name."
)]
struct Args {
    #[arg(
        long,
        help = "Load a stored calibration before starting",
        long_help = "Name of a stored calibration to apply before the run. The run then \
            refines that calibration instead of starting from identity functions."
    )]
    load: Option<String>,

    #[arg(
        long,
        help = "Simulation parameters as JSON",
        long_help = "Path to a JSON file with simulation parameters (hidden light-sheet \
            offsets, blur model, noise). Defaults to the built-in two light sheet, \
            two detection arm instrument."
    )]
    simulation: Option<PathBuf>,

    #[arg(
        long,
        help = "Run Z and width adaptation after calibration",
        long_help = "After a completed calibration, sweep light-sheet Z and width at every \
            control plane and light sheet, and write the corrections into the \
            interpolation tables."
    )]
    adapt: bool,

    #[arg(
        long,
        default_value_t = 20.0,
        help = "Detection depth spanned by the control planes"
    )]
    stack_depth: f64,

    #[command(flatten)]
    engine: EngineConfig,

    #[command(flatten)]
    adaptation: AdaptationConfig,
}

fn load_simulation(path: Option<&PathBuf>) -> Result<SimulationParams> {
    let Some(path) = path else {
        return Ok(SimulationParams::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read simulation parameters {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid simulation parameters in {}", path.display()))
}

fn print_functions(microscope: &SimulatedMicroscope) {
    let devices = microscope.devices();
    println!("Calibrated functions (slope, offset):");
    for (l, sheet) in devices.light_sheets.iter().enumerate() {
        println!("  Light sheet {l}:");
        for dof in LightSheetDof::ALL {
            let f = sheet.function(dof);
            println!("    {:<3} {:>9.4} {:>9.4}", dof.label(), f.slope, f.offset);
        }
        if sheet.adapt_power_to_width_height {
            println!(
                "    power vs height {:?}, vs width {:?}",
                sheet.functions.height_power.coefficients(),
                sheet.functions.width_power.coefficients()
            );
        }
    }
    for (d, arm) in devices.detection_arms.iter().enumerate() {
        println!(
            "  Detection arm {d}: DZ {:>9.4} {:>9.4}",
            arm.z_function.slope, arm.z_function.offset
        );
    }
}

fn print_tables(state: &InterpolatedAcquisitionState) -> Result<()> {
    println!("Adapted corrections:");
    for l in 0..state.num_light_sheets() {
        println!("  Light sheet {l}:");
        for cp in 0..state.num_control_planes() {
            let z = state.tables.get(LightSheetDof::Z, cp, l)?;
            let w = state.tables.get(LightSheetDof::Width, cp, l)?;
            println!(
                "    plane {cp} (DZ {:>7.2}): IZ {:>8.4}  IW {:>7.4}",
                state.control_plane_z(cp),
                z,
                w
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("Lightsheet calibration");
    info!("Calibration name:  {}", args.engine.calibration_name);
    info!("Max iterations:    {}", args.engine.max_iterations);
    info!(
        "Axes:              Z={} A={} XY={} P={} W={} HP={} WP={}",
        args.engine.calibrate_z,
        args.engine.calibrate_angle,
        args.engine.calibrate_xy,
        args.engine.calibrate_power,
        args.engine.calibrate_width,
        args.engine.calibrate_height_power,
        args.engine.calibrate_width_power
    );
    if !args.engine.skipped_light_sheets.is_empty() {
        info!("Skipped sheets:    {:?}", args.engine.skipped_light_sheets);
    }

    let params = load_simulation(args.simulation.as_ref())?;
    let microscope = Arc::new(Mutex::new(SimulatedMicroscope::new(params)));
    let slot = TaskSlot::new();
    let cancel = CancellationToken::new();

    let mut engine = CalibrationEngine::new(
        Arc::clone(&microscope),
        slot.clone(),
        args.engine.clone(),
        cancel.clone(),
    );

    if let Some(name) = &args.load {
        if !engine
            .load(name)
            .with_context(|| format!("Failed to load calibration '{name}'"))?
        {
            warn!("No stored calibration named '{}', starting from identity", name);
        }
    }

    let completed = engine.run().context("Calibration could not start")?;
    if !completed {
        warn!("Calibration did not complete, nothing saved");
        return Ok(());
    }

    let path = engine
        .save(&args.engine.calibration_name)
        .context("Failed to save calibration")?;
    info!("Saved calibration to {}", path.display());

    {
        let microscope = microscope.lock().unwrap_or_else(|e| e.into_inner());
        print_functions(&microscope);
    }

    if args.adapt {
        let num_light_sheets = microscope
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .num_light_sheets();
        let half_depth = 0.5 * args.stack_depth.abs();
        let state = InterpolatedAcquisitionState::new(
            args.adaptation.control_planes,
            num_light_sheets,
            args.adaptation.layout(),
            -half_depth,
            half_depth,
        );

        let mut adaptive = AdaptiveEngine::new(
            Arc::clone(&microscope),
            slot,
            state,
            args.adaptation.clone(),
            cancel,
        );
        adaptive.add_module(AdaptationZ::module(&args.adaptation));
        adaptive.add_module(AdaptationW::module(&args.adaptation));

        if adaptive.run().context("Adaptation failed")? {
            print_tables(adaptive.state())?;
        } else {
            warn!("Adaptation cancelled");
        }
    }

    Ok(())
}
