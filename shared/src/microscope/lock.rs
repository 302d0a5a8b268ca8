//! Exclusive use of the instrument
//!
//! Calibration and adaptation runs both drive the hardware, so only one may
//! run at a time. A run claims the [`TaskSlot`] for its whole duration; a
//! second claim is refused with the name of the current holder instead of
//! being queued.

use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("instrument busy: '{holder}' is running, refusing to start '{requested}'")]
pub struct TaskConflict {
    pub holder: String,
    pub requested: String,
}

/// Shared slot naming the task that currently owns the instrument
#[derive(Debug, Clone, Default)]
pub struct TaskSlot {
    holder: Arc<Mutex<Option<String>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the instrument for `task`, released when the guard drops
    pub fn try_start(&self, task: &str) -> Result<TaskGuard, TaskConflict> {
        let mut holder = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = holder.as_ref() {
            return Err(TaskConflict {
                holder: current.clone(),
                requested: task.to_string(),
            });
        }
        *holder = Some(task.to_string());
        Ok(TaskGuard {
            holder: self.holder.clone(),
        })
    }

    /// Name of the running task, if any
    pub fn current(&self) -> Option<String> {
        self.holder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

/// Held for the duration of a run
#[derive(Debug)]
pub struct TaskGuard {
    holder: Arc<Mutex<Option<String>>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        *self.holder.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_start_is_refused() {
        let slot = TaskSlot::new();
        let _guard = slot.try_start("calibration").unwrap();

        let conflict = slot.try_start("adaptation").unwrap_err();

        assert_eq!(conflict.holder, "calibration");
        assert_eq!(conflict.requested, "adaptation");
        assert_eq!(slot.current().as_deref(), Some("calibration"));
    }

    #[test]
    fn test_guard_drop_frees_slot() {
        let slot = TaskSlot::new();
        {
            let _guard = slot.try_start("calibration").unwrap();
            assert!(slot.is_busy());
        }
        assert!(!slot.is_busy());
        assert!(slot.clone().try_start("adaptation").is_ok());
    }
}
