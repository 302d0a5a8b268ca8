//! Progress and chart reporting
//!
//! Calibration modules publish sampled curves and the orchestrator publishes
//! its completion fraction through a [`ProgressSink`]. Sinks are purely
//! observational: nothing reads back from them to make decisions.

use std::sync::Mutex;
use tracing::{debug, info};

pub trait ProgressSink: Send + Sync {
    /// Declare a chart series before points are added to it
    fn configure_chart(&self, _chart: &str, _series: &str, _x_label: &str, _y_label: &str) {}

    /// Append a point; `clear` starts the series over
    fn add_point(&self, _chart: &str, _series: &str, _clear: bool, _x: f64, _y: f64) {}

    /// Completion fraction in `[0, 1]`
    fn set_progress(&self, _fraction: f64) {}
}

/// Completed units of a run and the fraction published from them
///
/// The fraction never decreases within a run and reaches 1.0 only through
/// [`Progress::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    completed: usize,
    total: usize,
    finished: bool,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            finished: false,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn fraction(&self) -> f64 {
        if self.finished {
            1.0
        } else if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    /// Count one unit as done and publish the new fraction
    pub fn advance(&mut self, sink: &dyn ProgressSink) {
        self.completed = (self.completed + 1).min(self.total);
        sink.set_progress(self.fraction());
    }

    pub fn finish(&mut self, sink: &dyn ProgressSink) {
        self.completed = self.total;
        self.finished = true;
        sink.set_progress(1.0);
    }
}

/// Forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn configure_chart(&self, chart: &str, series: &str, x_label: &str, y_label: &str) {
        debug!(chart, series, x_label, y_label, "chart configured");
    }

    fn add_point(&self, chart: &str, series: &str, _clear: bool, x: f64, y: f64) {
        debug!(chart, series, x, y, "chart point");
    }

    fn set_progress(&self, fraction: f64) {
        info!("Calibration progress: {:.0}%", fraction * 100.0);
    }
}

/// One recorded chart point
#[derive(Debug, Clone, PartialEq)]
pub struct ChartPoint {
    pub chart: String,
    pub series: String,
    pub x: f64,
    pub y: f64,
}

/// Keeps every point and progress update in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    points: Mutex<Vec<ChartPoint>>,
    progress: Mutex<Vec<f64>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<ChartPoint> {
        self.points.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Points of one chart, in insertion order
    pub fn series(&self, chart: &str) -> Vec<ChartPoint> {
        self.points()
            .into_iter()
            .filter(|p| p.chart == chart)
            .collect()
    }

    pub fn progress_history(&self) -> Vec<f64> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressSink for RecordingSink {
    fn add_point(&self, chart: &str, series: &str, _clear: bool, x: f64, y: f64) {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ChartPoint {
                chart: chart.to_string(),
                series: series.to_string(),
                x,
                y,
            });
    }

    fn set_progress(&self, fraction: f64) {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fraction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic_and_ends_at_one() {
        let sink = RecordingSink::new();
        let mut progress = Progress::new(3);

        for _ in 0..5 {
            progress.advance(&sink);
        }
        progress.finish(&sink);

        let history = sink.progress_history();
        assert!(history.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(history.last(), Some(&1.0));
        assert_eq!(progress.completed(), 3);
    }

    #[test]
    fn test_recording_sink_filters_by_chart() {
        let sink = RecordingSink::new();
        sink.add_point("Z", "LS0", true, 1.0, 2.0);
        sink.add_point("A", "LS0", true, 3.0, 4.0);
        sink.add_point("Z", "LS1", false, 5.0, 6.0);

        let z = sink.series("Z");
        assert_eq!(z.len(), 2);
        assert_eq!(z[1].series, "LS1");
        assert_eq!(sink.points().len(), 3);
    }
}
