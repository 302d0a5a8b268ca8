//! Grid-sweeping adaptation module
//!
//! A [`StandardAdaptationModule`] visits every `(control plane, light sheet)`
//! grid point. At each point it sweeps one light-sheet DOF, hands the
//! per-detection-arm stacks to the worker pool, and stores one
//! [`FitResult`] per arm. Once the grid is exhausted and every metric task
//! has finished, [`StandardAdaptationModule::update_state`] arbitrates
//! between the arms and writes one correction per grid point into the
//! interpolation tables.
//!
//! A correction whose best evidence is too weak, or whose fit found no peak
//! at all, is replaced by one derived from the neighbouring control planes. Grid points without any result
//! are left untouched.

use shared::image_proc::{dcts_per_plane, StackRecycler, DCTS_DEFAULT_PSF_SUPPORT};
use shared::microscope::{
    AcquisitionQueue, InterpolatedAcquisitionState, InterpolationTables, LightSheetDof,
    Microscope, TableError,
};
use sheet_math::ArgMaxFinder;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::iterator::NdIterator;
use super::results::{FitResult, ResultTable};
use super::variants::AdaptationVariant;
use super::AdaptationError;
use crate::config::AdaptationConfig;
use crate::progress::ProgressSink;
use crate::worker::{ExecutionMode, TaskHandle, WorkerPool};

/// Sweep and acceptance parameters shared by every variant
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSettings {
    pub num_samples: usize,
    /// Fits below this confidence fall back to neighbouring planes
    pub probability_threshold: f64,
    /// Curves peaking below this metric fall back to neighbouring planes
    pub metric_threshold: f64,
    pub exposure: Duration,
    pub laser_power: f64,
    /// Negate direct corrections
    pub flip_sign: bool,
}

impl From<&AdaptationConfig> for AdaptationSettings {
    fn from(config: &AdaptationConfig) -> Self {
        Self {
            num_samples: config.num_samples,
            probability_threshold: config.probability_threshold,
            metric_threshold: config.metric_threshold,
            exposure: config.exposure(),
            laser_power: config.laser_power,
            flip_sign: config.flip_sign,
        }
    }
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self::from(&AdaptationConfig::default())
    }
}

/// Instrument and services used while stepping through the grid
pub struct StepContext<'a> {
    pub microscope: &'a mut dyn Microscope,
    pub pool: &'a WorkerPool,
    pub recycler: &'a StackRecycler,
    pub sink: Arc<dyn ProgressSink>,
    pub finder: Arc<dyn ArgMaxFinder>,
    pub mode: ExecutionMode,
    pub timeout_base: Duration,
    pub timeout_per_frame: Duration,
}

pub struct StandardAdaptationModule {
    variant: Box<dyn AdaptationVariant>,
    settings: AdaptationSettings,
    iterator: Option<NdIterator>,
    results: ResultTable,
    pending: Vec<TaskHandle<()>>,
}

impl StandardAdaptationModule {
    pub fn new(variant: Box<dyn AdaptationVariant>, settings: AdaptationSettings) -> Self {
        Self {
            variant,
            settings,
            iterator: None,
            results: ResultTable::new(0, 0, 0),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.variant.name()
    }

    pub fn dof(&self) -> LightSheetDof {
        self.variant.dof()
    }

    pub fn settings(&self) -> &AdaptationSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut AdaptationSettings {
        &mut self.settings
    }

    pub fn results(&self) -> &ResultTable {
        &self.results
    }

    /// Grid points not yet visited
    pub fn remaining(&self) -> usize {
        self.iterator.as_ref().map_or(0, |it| it.size_hint().0)
    }

    /// Start a new pass over a `control planes × light sheets` grid
    ///
    /// Outstanding metric tasks are joined first so none of them writes
    /// into the fresh result table.
    pub fn reset(&mut self, num_control_planes: usize, num_light_sheets: usize, num_detection_arms: usize) {
        self.join();
        self.iterator = Some(NdIterator::new(&[num_control_planes, num_light_sheets]));
        self.results = ResultTable::new(num_control_planes, num_light_sheets, num_detection_arms);
    }

    /// Visit the next grid point
    ///
    /// Returns `Ok(false)` once the grid is exhausted. A grid point whose
    /// acquisition fails is skipped and leaves no result.
    pub fn step(
        &mut self,
        ctx: &mut StepContext<'_>,
        state: &InterpolatedAcquisitionState,
    ) -> Result<bool, AdaptationError> {
        let name = self.variant.name();
        let Some(iterator) = self.iterator.as_mut() else {
            return Err(AdaptationError::NotReset(name.to_string()));
        };
        let Some(point) = iterator.next() else {
            return Ok(false);
        };
        let (control_plane, light_sheet) = (point[0], point[1]);

        let (queue, values) = self.build_queue(&*ctx.microscope, state, control_plane, light_sheet)?;
        if let Some(handle) = self.find_best_dof_value(ctx, control_plane, light_sheet, &queue, values) {
            self.pending.push(handle);
        }
        self.collect_finished();
        Ok(true)
    }

    /// Sweep queue for one grid point and the DOF value of each frame
    ///
    /// Relative variants sweep offsets around the table state and report
    /// the offsets actually commanded after clamping to the device range.
    pub fn build_queue(
        &self,
        microscope: &dyn Microscope,
        state: &InterpolatedAcquisitionState,
        control_plane: usize,
        light_sheet: usize,
    ) -> Result<(AcquisitionQueue, Vec<f64>), AdaptationError> {
        let dof = self.variant.dof();
        let setting = *microscope.devices().light_sheet(light_sheet)?.setting(dof);

        let mut queue = microscope.build_queue();
        let frame = queue.current_mut();
        state.apply_to_frame(frame, control_plane, light_sheet)?;
        frame.camera_on = true;
        frame.exposure = self.settings.exposure;
        frame.set(light_sheet, LightSheetDof::Power, self.settings.laser_power);
        let base = frame.get(light_sheet, dof).unwrap_or(0.0);

        let relative = self.variant.relative();
        let sweep = self.variant.sweep(&setting, self.settings.num_samples.max(3));
        let mut values = Vec::with_capacity(sweep.len());
        for v in sweep {
            let command = setting.constrain(if relative { base + v } else { v });
            queue.current_mut().set(light_sheet, dof, command);
            queue.add_current_state();
            values.push(if relative { command - base } else { command });
        }
        Ok((queue, values))
    }

    /// Play a sweep and dispatch its metric computation
    ///
    /// Returns `None` when the acquisition failed or produced no stacks.
    pub fn find_best_dof_value(
        &self,
        ctx: &mut StepContext<'_>,
        control_plane: usize,
        light_sheet: usize,
        queue: &AcquisitionQueue,
        values: Vec<f64>,
    ) -> Option<TaskHandle<()>> {
        let name = self.variant.name();
        let timeout = queue.timeout(ctx.timeout_base, ctx.timeout_per_frame);
        let stacks = match ctx.microscope.play_queue(queue, timeout) {
            Ok(stacks) => stacks,
            Err(e) => {
                warn!(
                    "{}: skipping control plane {} light sheet {}: {}",
                    name, control_plane, light_sheet, e
                );
                return None;
            }
        };

        let duplicates: Vec<_> = stacks
            .iter()
            .enumerate()
            .filter(|(_, stack)| !stack.is_empty())
            .map(|(arm, stack)| (arm, ctx.recycler.duplicate(stack)))
            .collect();
        drop(stacks);
        if duplicates.is_empty() {
            debug!(
                "{}: no images for control plane {} light sheet {}",
                name, control_plane, light_sheet
            );
            return None;
        }

        let results = self.results.clone();
        let finder = Arc::clone(&ctx.finder);
        let sink = Arc::clone(&ctx.sink);
        let x_label = self.variant.dof().label();

        Some(ctx.pool.dispatch(ctx.mode, move || {
            for (arm, stack) in duplicates {
                let metric = dcts_per_plane(&stack, DCTS_DEFAULT_PSF_SUPPORT);
                drop(stack);
                if metric.len() != values.len() {
                    warn!(
                        "{}: arm {} returned {} planes for {} sweep values",
                        name,
                        arm,
                        metric.len(),
                        values.len()
                    );
                    continue;
                }

                let series = format!("CPI={control_plane}|LS={light_sheet}|D={arm}");
                sink.configure_chart(name, &series, x_label, "focus metric");
                for (i, (&x, &m)) in values.iter().zip(&metric).enumerate() {
                    sink.add_point(name, &series, i == 0, x, m);
                }

                let result = FitResult::evaluate(finder.as_ref(), &values, &metric);
                debug!(
                    control_plane,
                    light_sheet,
                    arm,
                    argmax = result.argmax,
                    metric_max = result.metric_max,
                    probability = result.probability,
                    "{} fit",
                    name
                );
                if let Err(e) = results.set(control_plane, light_sheet, arm, result) {
                    warn!("{}: {}", name, e);
                }
            }
        }))
    }

    fn collect_finished(&mut self) {
        let name = self.variant.name();
        for mut handle in mem::take(&mut self.pending) {
            if handle.is_finished() {
                if let Err(e) = handle.wait() {
                    error!("{}: metric task failed: {}", name, e);
                }
            } else {
                self.pending.push(handle);
            }
        }
    }

    /// Wait for every outstanding metric task
    pub fn join(&mut self) {
        let name = self.variant.name();
        for handle in mem::take(&mut self.pending) {
            if let Err(e) = handle.wait() {
                error!("{}: metric task failed: {}", name, e);
            }
        }
    }

    /// Grid exhausted and no metric task outstanding
    pub fn is_ready(&mut self) -> bool {
        self.collect_finished();
        self.iterator.as_ref().is_some_and(|it| !it.has_next()) && self.pending.is_empty()
    }

    /// Detection arm with the largest `metric_max × probability`
    ///
    /// Missing arms are skipped; the first arm wins ties.
    pub fn select_best(arms: &[Option<FitResult>]) -> Option<(usize, FitResult)> {
        let mut best: Option<(usize, FitResult)> = None;
        for (arm, result) in arms.iter().enumerate() {
            let Some(result) = result else {
                continue;
            };
            if best.map_or(true, |(_, b)| result.evidence() > b.evidence()) {
                best = Some((arm, *result));
            }
        }
        best
    }

    /// Correction that moves a table entry towards its neighbours
    ///
    /// In relative mode the current entry is subtracted, in absolute mode
    /// the neighbour value itself is the correction. Returns `None` when
    /// there is only one control plane.
    pub fn neighbour_correction(
        &self,
        tables: &InterpolationTables,
        control_plane: usize,
        light_sheet: usize,
    ) -> Result<Option<f64>, TableError> {
        let dof = self.variant.dof();
        let planes = tables.num_control_planes();
        if planes < 2 {
            return Ok(None);
        }

        let base = if self.variant.relative() {
            tables.get(dof, control_plane, light_sheet)?
        } else {
            0.0
        };
        let value = |cp: usize| tables.get(dof, cp, light_sheet);

        let correction = if control_plane == 0 {
            value(1)? - base
        } else if control_plane == planes - 1 {
            value(control_plane - 1)? - base
        } else {
            0.5 * (value(control_plane - 1)? + value(control_plane + 1)?) - base
        };
        Ok(Some(correction))
    }

    /// Write one correction per grid point into `state`
    ///
    /// Returns the number of table entries written.
    pub fn update_state(&mut self, state: &mut InterpolatedAcquisitionState) -> Result<usize, AdaptationError> {
        let name = self.variant.name();
        if !self.is_ready() {
            return Err(AdaptationError::NotReady(name.to_string()));
        }

        let dof = self.variant.dof();
        let relative = self.variant.relative();
        let sign = if self.settings.flip_sign { -1.0 } else { 1.0 };
        let (planes, sheets, _) = self.results.shape();
        info!("{}: updating {} control planes x {} light sheets", name, planes, sheets);

        let mut written = 0;
        for cp in 0..planes {
            for l in 0..sheets {
                let arms = self.results.arms(cp, l)?;
                let Some((arm, result)) = Self::select_best(&arms) else {
                    error!("{}: no result for cpi={}, l={}", name, cp, l);
                    continue;
                };

                let no_peak = result.is_fallback();
                let probability_low = result.probability < self.settings.probability_threshold;
                let metric_low = result.metric_max < self.settings.metric_threshold;
                if no_peak {
                    warn!(
                        "{}: no peak found for cpi={}, l={}, using neighbouring planes",
                        name, cp, l
                    );
                } else if probability_low {
                    warn!(
                        "{}: probability too low ({} < {}) for cpi={}, l={}, using neighbouring planes",
                        name, result.probability, self.settings.probability_threshold, cp, l
                    );
                }
                if metric_low {
                    warn!(
                        "{}: metric maximum too low ({} < {}) for cpi={}, l={}, using neighbouring planes",
                        name, result.metric_max, self.settings.metric_threshold, cp, l
                    );
                }

                let fallback = no_peak || probability_low || metric_low;
                let correction = if fallback {
                    match self.neighbour_correction(&state.tables, cp, l)? {
                        Some(correction) => correction,
                        None => {
                            warn!(
                                "{}: no neighbouring control plane for cpi={}, l={}, entry unchanged",
                                name, cp, l
                            );
                            continue;
                        }
                    }
                } else {
                    sign * result.argmax
                };

                info!(
                    control_plane = cp,
                    light_sheet = l,
                    detection_arm = arm,
                    correction,
                    fallback,
                    "{} correction",
                    name
                );
                if relative {
                    state.tables.add(dof, cp, l, correction)?;
                } else {
                    state.tables.set(dof, cp, l, correction)?;
                }
                written += 1;
            }
        }
        Ok(written)
    }
}
