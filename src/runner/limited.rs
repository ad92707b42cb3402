//! Limited runner (`spec.md` §4.7.3): gates dispatch on parallelism and
//! system load, without ever queuing work itself — it just says no to the
//! scheduler until the inner runner has drained enough in-flight work.

use super::{Completion, Invocation, Runner};

pub trait LoadProvider: Send {
    fn load_average(&self) -> f64;
}

/// Reads `/proc/loadavg`'s 1-minute figure; `0.0` (never throttles) on
/// platforms without it.
pub struct SystemLoadProvider;

impl LoadProvider for SystemLoadProvider {
    fn load_average(&self) -> f64 {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_owned))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    }
}

/// Test double reporting a fixed load figure.
pub struct FixedLoadProvider(pub f64);

impl LoadProvider for FixedLoadProvider {
    fn load_average(&self) -> f64 {
        self.0
    }
}

pub struct LimitedRunner<R: Runner, L: LoadProvider> {
    inner: R,
    parallelism: usize,
    load_threshold: Option<f64>,
    load: L,
}

impl<R: Runner, L: LoadProvider> LimitedRunner<R, L> {
    pub fn new(inner: R, parallelism: usize, load_threshold: Option<f64>, load: L) -> Self {
        Self { inner, parallelism: parallelism.max(1), load_threshold, load }
    }
}

impl<R: Runner, L: LoadProvider> Runner for LimitedRunner<R, L> {
    fn invoke(&mut self, job: Invocation, callback: Completion) {
        self.inner.invoke(job, callback);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        let in_flight = self.inner.size();
        if in_flight >= self.parallelism {
            return false;
        }
        if let Some(threshold) = self.load_threshold {
            if in_flight > 0 && self.load.load_average() > threshold {
                return false;
            }
        }
        true
    }

    fn run_commands(&mut self) -> bool {
        self.inner.run_commands()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::executor::ScriptedExecutor;
    use crate::runner::platform::PlatformRunner;
    use crate::tracer::NullTracer;
    use crate::fs_util::{FileSystem, InMemoryFileSystem};
    use crate::manifest::StepIndex;
    use std::sync::Arc;

    fn runner() -> PlatformRunner<ScriptedExecutor, NullTracer> {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        PlatformRunner::new(ScriptedExecutor::new(fs), NullTracer, vec![], 4)
    }

    #[test]
    fn parallelism_gate_blocks_once_at_capacity() {
        let mut limited = LimitedRunner::new(runner(), 1, None, FixedLoadProvider(0.0));
        assert!(limited.can_run_more());
        limited.invoke(
            Invocation { command: "a=>".into(), step: StepIndex(0), pool: String::new(), traced: false },
            Box::new(|_, _| {}),
        );
        assert!(!limited.can_run_more());
        while limited.size() > 0 {
            limited.run_commands();
        }
        assert!(limited.can_run_more());
    }

    #[test]
    fn load_gate_blocks_only_when_something_is_in_flight() {
        let mut limited = LimitedRunner::new(runner(), 8, Some(1.0), FixedLoadProvider(5.0));
        // Nothing in flight yet: load alone does not block.
        assert!(limited.can_run_more());
        limited.invoke(
            Invocation { command: "a=>".into(), step: StepIndex(0), pool: String::new(), traced: false },
            Box::new(|_, _| {}),
        );
        assert!(!limited.can_run_more());
    }
}
