//! Thread-safe table of precomputed dirtiness results (`spec.md` §4, §5):
//! lets a background worker run `isClean` ahead of the scheduler without the
//! scheduler blocking on it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::manifest::StepIndex;
use crate::oracle::Verdict;

/// Per-step slot: at most one entry live per step index, `insert` overwrites,
/// `pop` is destructive so memory is reclaimed as the scheduler drains it.
#[derive(Default)]
pub struct CacheLookupTable {
    slots: Mutex<HashMap<StepIndex, Verdict>>,
}

impl CacheLookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, step: StepIndex, verdict: Verdict) {
        self.slots.lock().unwrap().insert(step, verdict);
    }

    pub fn pop(&self, step: StepIndex) -> Option<Verdict> {
        self.slots.lock().unwrap().remove(&step)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
