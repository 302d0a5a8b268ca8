//! Bounded pool of duplicated image stacks
//!
//! Acquired stacks belong to the instrument and are overwritten by the next
//! queue, so metric tasks work on duplicates. The recycler caps how many
//! duplicates are alive at once: requesting one beyond the cap blocks until
//! another is dropped. Release happens in `Drop`, so a task that skips,
//! fails or panics still returns its slot.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::ops::Deref;
use std::time::Duration;
use tracing::debug;

use super::ImageStack;

/// Hands out [`RecycledStack`] duplicates, at most `capacity` at a time
#[derive(Debug, Clone)]
pub struct StackRecycler {
    name: String,
    permits: Sender<()>,
    returns: Receiver<()>,
}

impl StackRecycler {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (permits, returns) = bounded(capacity.max(1));
        Self {
            name: name.into(),
            permits,
            returns,
        }
    }

    /// Duplicate `source`, blocking while the pool is at capacity
    pub fn duplicate(&self, source: &ImageStack) -> RecycledStack {
        // the sender and receiver live in `self`, so the channel cannot disconnect
        let _ = self.permits.send(());
        self.wrap(source)
    }

    /// Duplicate `source`, giving up after `timeout` if no slot frees up
    pub fn try_duplicate(&self, source: &ImageStack, timeout: Duration) -> Option<RecycledStack> {
        match self.permits.send_timeout((), timeout) {
            Ok(()) => Some(self.wrap(source)),
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                debug!("Recycler '{}' full after {:?}", self.name, timeout);
                None
            }
        }
    }

    fn wrap(&self, source: &ImageStack) -> RecycledStack {
        RecycledStack {
            stack: source.clone(),
            release: self.returns.clone(),
        }
    }

    /// Number of duplicates currently alive
    pub fn in_flight(&self) -> usize {
        self.permits.len()
    }

    pub fn capacity(&self) -> usize {
        self.permits.capacity().unwrap_or(usize::MAX)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A duplicated stack holding one recycler slot until dropped
#[derive(Debug)]
pub struct RecycledStack {
    stack: ImageStack,
    release: Receiver<()>,
}

impl Deref for RecycledStack {
    type Target = ImageStack;

    fn deref(&self) -> &ImageStack {
        &self.stack
    }
}

impl Drop for RecycledStack {
    fn drop(&mut self) {
        let _ = self.release.try_recv();
    }
}
