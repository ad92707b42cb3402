//! Pooled runner (`spec.md` §4.7.2): gates dispatch by named pool capacity.
//! The built-in `console` pool always has capacity 1; the empty pool name is
//! unrestricted. Delayed commands queue FIFO per pool and are released as
//! capacity frees up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::manifest::StepIndex;

use super::{Completion, Invocation, Runner};

struct Delayed {
    command: String,
    step: StepIndex,
    traced: bool,
    callback: Completion,
}

pub struct PooledRunner<R: Runner> {
    inner: R,
    remaining: HashMap<String, u32>,
    delayed: HashMap<String, VecDeque<Delayed>>,
    delayed_count: usize,
    /// Pool names freed by completions observed during the most recent
    /// `inner.run_commands()`; drained and acted on right after that call
    /// returns, since the completion closures fire on this same thread but
    /// can't hold `&mut self` across `inner`'s call stack.
    released: Arc<Mutex<VecDeque<String>>>,
}

impl<R: Runner> PooledRunner<R> {
    /// `pools` is the manifest's named pool capacities; `console` (capacity
    /// 1) is always present regardless of what's passed in.
    pub fn new(inner: R, pools: impl IntoIterator<Item = (String, u32)>) -> Self {
        let mut remaining: HashMap<String, u32> = pools.into_iter().collect();
        remaining.insert("console".to_string(), 1);
        Self {
            inner,
            remaining,
            delayed: HashMap::new(),
            delayed_count: 0,
            released: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn forward(&mut self, pool: String, command: String, step: StepIndex, traced: bool, callback: Completion) {
        let released = self.released.clone();
        let pool_name = pool.clone();
        let wrapped: Completion = Box::new(move |step, result| {
            released.lock().unwrap().push_back(pool_name);
            callback(step, result);
        });
        self.inner.invoke(Invocation { command, step, pool, traced }, wrapped);
    }

    fn release(&mut self, pool: &str) {
        if let Some(slot) = self.remaining.get_mut(pool) {
            *slot += 1;
        }
        self.dispatch_next(pool);
    }

    fn dispatch_next(&mut self, pool: &str) {
        let has_slot = self.remaining.get(pool).copied().unwrap_or(0) > 0;
        if !has_slot {
            return;
        }
        let Some(job) = self.delayed.get_mut(pool).and_then(VecDeque::pop_front) else { return };
        self.delayed_count -= 1;
        if let Some(slot) = self.remaining.get_mut(pool) {
            *slot -= 1;
        }
        self.forward(pool.to_string(), job.command, job.step, job.traced, job.callback);
    }
}

impl<R: Runner> Runner for PooledRunner<R> {
    fn invoke(&mut self, job: Invocation, callback: Completion) {
        if job.pool.is_empty() {
            self.inner.invoke(job, callback);
            return;
        }

        let has_capacity = self.remaining.get(&job.pool).copied().unwrap_or(u32::MAX) > 0;
        if has_capacity {
            if let Some(slot) = self.remaining.get_mut(&job.pool) {
                *slot -= 1;
            }
            self.forward(job.pool.clone(), job.command, job.step, job.traced, callback);
        } else {
            self.delayed.entry(job.pool.clone()).or_default().push_back(Delayed {
                command: job.command,
                step: job.step,
                traced: job.traced,
                callback,
            });
            self.delayed_count += 1;
        }
    }

    fn size(&self) -> usize {
        self.inner.size() + self.delayed_count
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    fn run_commands(&mut self) -> bool {
        let interrupted = self.inner.run_commands();
        let released: Vec<String> = {
            let mut queue = self.released.lock().unwrap();
            queue.drain(..).collect()
        };
        for pool in released {
            self.release(&pool);
        }
        interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::{FileSystem, InMemoryFileSystem};
    use crate::manifest::StepIndex;
    use crate::runner::executor::ScriptedExecutor;
    use crate::runner::platform::PlatformRunner;
    use crate::tracer::NullTracer;
    use std::sync::{mpsc, Arc};

    fn platform() -> PlatformRunner<ScriptedExecutor, NullTracer> {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        PlatformRunner::new(ScriptedExecutor::new(fs), NullTracer, vec![], 4)
    }

    #[test]
    fn unpooled_commands_bypass_capacity_tracking() {
        let mut pooled = PooledRunner::new(platform(), []);
        let (tx, rx) = mpsc::channel();
        pooled.invoke(
            Invocation { command: "a=>".into(), step: StepIndex(0), pool: String::new(), traced: false },
            Box::new(move |s, r| tx.send((s, r)).unwrap()),
        );
        assert_eq!(pooled.size(), 1);
        while pooled.size() > 0 {
            pooled.run_commands();
        }
        rx.recv().unwrap();
    }

    #[test]
    fn zero_capacity_pool_delays_second_command_until_the_first_releases() {
        let mut pooled = PooledRunner::new(platform(), [("build".to_string(), 1)]);
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pooled.invoke(
            Invocation { command: "a=>".into(), step: StepIndex(0), pool: "build".into(), traced: false },
            Box::new(move |s, r| tx.send((s, r)).unwrap()),
        );
        pooled.invoke(
            Invocation { command: "b=>".into(), step: StepIndex(1), pool: "build".into(), traced: false },
            Box::new(move |s, r| tx2.send((s, r)).unwrap()),
        );
        assert_eq!(pooled.size(), 2);

        let mut seen = 0;
        while seen < 2 {
            pooled.run_commands();
            while rx.try_recv().is_ok() {
                seen += 1;
            }
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn console_pool_has_builtin_capacity_one() {
        let pooled = PooledRunner::new(platform(), []);
        assert_eq!(pooled.remaining.get("console"), Some(&1));
    }
}
