//! Shared components for the lightsheet calibration tools.
//!
//! This crate holds the pieces every calibrator needs but none owns: the
//! device control model and acquisition queue, interpolation tables
//! consulted at acquisition time, image-stack metrics, the stack
//! recycler, a simulated instrument, and named calibration storage.

pub mod calibration_store;
pub mod image_proc;
pub mod microscope;
