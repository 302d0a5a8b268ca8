//! Driver running adaptation modules against an instrument

use shared::image_proc::StackRecycler;
use shared::microscope::{InterpolatedAcquisitionState, Microscope, TaskSlot};
use sheet_math::{ArgMaxFinder, SmartArgMaxFinder};
use std::sync::{Arc, Mutex};
use tracing::info;

use super::standard::{StandardAdaptationModule, StepContext};
use super::AdaptationError;
use crate::cancel::CancellationToken;
use crate::config::AdaptationConfig;
use crate::progress::{Progress, ProgressSink, TracingSink};
use crate::worker::WorkerPool;

/// Name under which an adaptation run claims the instrument
pub const ADAPTATION_TASK: &str = "adaptation";

/// Owns the acquisition state and steps each module over its grid in turn
pub struct AdaptiveEngine<M: Microscope> {
    microscope: Arc<Mutex<M>>,
    slot: TaskSlot,
    config: AdaptationConfig,
    state: InterpolatedAcquisitionState,
    modules: Vec<StandardAdaptationModule>,
    progress: Progress,
    sink: Arc<dyn ProgressSink>,
    finder: Arc<dyn ArgMaxFinder>,
    cancel: CancellationToken,
}

impl<M: Microscope> AdaptiveEngine<M> {
    pub fn new(
        microscope: Arc<Mutex<M>>,
        slot: TaskSlot,
        state: InterpolatedAcquisitionState,
        config: AdaptationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            microscope,
            slot,
            config,
            state,
            modules: Vec::new(),
            progress: Progress::default(),
            sink: Arc::new(TracingSink),
            finder: Arc::new(SmartArgMaxFinder::default()),
            cancel,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_finder(mut self, finder: Arc<dyn ArgMaxFinder>) -> Self {
        self.finder = finder;
        self
    }

    pub fn add_module(&mut self, module: StandardAdaptationModule) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[StandardAdaptationModule] {
        &self.modules
    }

    pub fn state(&self) -> &InterpolatedAcquisitionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InterpolatedAcquisitionState {
        &mut self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress.fraction()
    }

    /// Run every module once over the full grid
    ///
    /// Cancellation is checked before each grid point; a cancelled run joins
    /// its outstanding tasks, leaves the tables untouched by the current
    /// module and returns `Ok(false)`.
    pub fn run(&mut self) -> Result<bool, AdaptationError> {
        let _guard = self.slot.try_start(ADAPTATION_TASK)?;

        let microscope = Arc::clone(&self.microscope);
        let mut microscope = microscope.lock().unwrap_or_else(|e| e.into_inner());

        let num_control_planes = self.state.num_control_planes();
        let num_light_sheets = self.state.num_light_sheets().min(microscope.num_light_sheets());
        let num_arms = microscope.num_detection_arms();

        // one grid point holds a duplicate per arm, so fewer slots would deadlock
        let capacity = self.config.recycler_capacity.max(num_arms).max(1);
        let recycler = StackRecycler::new(ADAPTATION_TASK, capacity);
        let pool = WorkerPool::new(self.config.workers, capacity);

        self.progress = Progress::new(self.modules.len() * num_control_planes * num_light_sheets);
        self.sink.set_progress(0.0);

        for module in &mut self.modules {
            module.reset(num_control_planes, num_light_sheets, num_arms);
            info!(
                "{}: {} control planes x {} light sheets",
                module.name(),
                num_control_planes,
                num_light_sheets
            );

            let mut ctx = StepContext {
                microscope: &mut *microscope,
                pool: &pool,
                recycler: &recycler,
                sink: Arc::clone(&self.sink),
                finder: Arc::clone(&self.finder),
                mode: self.config.execution_mode,
                timeout_base: self.config.timeout_base(),
                timeout_per_frame: self.config.timeout_per_frame(),
            };
            loop {
                if self.cancel.is_cancelled() {
                    info!("{}: cancelled", module.name());
                    module.join();
                    return Ok(false);
                }
                if !module.step(&mut ctx, &self.state)? {
                    break;
                }
                self.progress.advance(self.sink.as_ref());
            }

            module.join();
            let written = module.update_state(&mut self.state)?;
            info!("{}: {} corrections written", module.name(), written);
        }

        pool.wait_for_completion();
        self.progress.finish(self.sink.as_ref());
        Ok(true)
    }
}
