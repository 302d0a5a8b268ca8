//! Closed-loop calibration of multi-axis lightsheet microscopes
//!
//! [`engine::CalibrationEngine`] runs the per-axis calibrations of
//! [`modules`] in a fixed sequence of bounded convergence loops;
//! [`adaptation::AdaptiveEngine`] refines per-control-plane corrections
//! afterwards.

pub mod adaptation;
pub mod cancel;
pub mod config;
pub mod data;
pub mod engine;
pub mod modules;
pub mod positioner;
pub mod progress;
pub mod worker;

pub use cancel::CancellationToken;
pub use config::{AdaptationConfig, EngineConfig};
pub use engine::{CalibrationEngine, EngineError};
