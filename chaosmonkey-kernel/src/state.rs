//! Shared run state
//!
//! The sequencer appends each finished `ExperimentOutcome` to an `OutcomeLog`
//! as soon as the target completes, so callers holding a clone of the log can
//! read partial results even if the batch is interrupted.

use crate::models::ExperimentOutcome;
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Append-only log of completed target outcomes
#[derive(Clone, Default)]
pub struct OutcomeLog {
    entries: Shared<Vec<ExperimentOutcome>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self { entries: new_state(Vec::new()) }
    }

    pub fn push(&self, outcome: ExperimentOutcome) {
        self.entries.lock().push(outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> Vec<ExperimentOutcome> {
        self.entries.lock().clone()
    }
}
