//! Build-status callback (`spec.md` §6.5): the engine invokes a sink on
//! step start/finish but does not prescribe rendering.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::manifest::StepIndex;

pub trait StatusSink: Send + Sync {
    fn step_started(&self, step: StepIndex);
    fn step_finished(&self, step: StepIndex, success: bool, output: &[u8]);
}

/// Discards every callback; the default for headless/test use.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn step_started(&self, _step: StepIndex) {}
    fn step_finished(&self, _step: StepIndex, _success: bool, _output: &[u8]) {}
}

/// Test double counting calls, so tests can assert on `stepStarted`/
/// `stepFinished` totals (`spec.md` §8's restat scenario counts these).
#[derive(Default)]
pub struct CountingStatusSink {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl StatusSink for CountingStatusSink {
    fn step_started(&self, _step: StepIndex) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn step_finished(&self, _step: StepIndex, _success: bool, _output: &[u8]) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls() {
        let sink = CountingStatusSink::default();
        sink.step_started(StepIndex(0));
        sink.step_finished(StepIndex(0), true, b"");
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }
}
