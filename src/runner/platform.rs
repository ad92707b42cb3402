//! Platform runner (`spec.md` §4.7.1): the leaf of the decorator stack.
//! Spawns each command on a `rayon` thread pool and, unless the step bypasses
//! tracing, runs it through the [`Tracer`] contract instead of executing it
//! directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::manifest::StepIndex;
use crate::tracer::Tracer;

use super::executor::Executor;
use super::{CommandResult, Completion, ExitStatus, Invocation, Runner};

struct Job {
    step: StepIndex,
    callback: Completion,
}

pub struct PlatformRunner<E: Executor + 'static, T: Tracer + 'static> {
    pool: rayon::ThreadPool,
    executor: Arc<E>,
    tracer: Arc<T>,
    ignored_prefixes: Arc<Vec<PathBuf>>,
    sender: Sender<(u64, CommandResult)>,
    receiver: Receiver<(u64, CommandResult)>,
    pending: HashMap<u64, Job>,
    next_id: u64,
    interrupted: Arc<AtomicBool>,
}

impl<E: Executor + 'static, T: Tracer + 'static> PlatformRunner<E, T> {
    pub fn new(executor: E, tracer: T, ignored_prefixes: Vec<PathBuf>, worker_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .build()
            .expect("failed to build platform runner thread pool");
        let (sender, receiver) = mpsc::channel();
        Self {
            pool,
            executor: Arc::new(executor),
            tracer: Arc::new(tracer),
            ignored_prefixes: Arc::new(ignored_prefixes),
            sender,
            receiver,
            pending: HashMap::new(),
            next_id: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation; the next [`Runner::run_commands`] call returns
    /// `true` without waiting, though in-flight jobs keep running until a
    /// later `run_commands` drains them (`spec.md` §5 cancellation).
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

impl<E: Executor + 'static, T: Tracer + 'static> Runner for PlatformRunner<E, T> {
    fn invoke(&mut self, job: Invocation, callback: Completion) {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, Job { step: job.step, callback });

        let executor = self.executor.clone();
        let tracer = self.tracer.clone();
        let ignored_prefixes = self.ignored_prefixes.clone();
        let sender = self.sender.clone();
        let command = job.command;
        let traced = job.traced;

        self.pool.spawn(move || {
            let result = if traced {
                match tracer.run(&command, &ignored_prefixes) {
                    Ok((success, trace)) => CommandResult {
                        exit_status: if success { ExitStatus::Success } else { ExitStatus::Failure },
                        output: Vec::new(),
                        input_files: trace.input_files,
                        output_files: trace.output_files,
                    },
                    Err(err) => CommandResult::failure(err.to_string().into_bytes()),
                }
            } else {
                match executor.execute(&command) {
                    Ok((success, output)) => CommandResult {
                        exit_status: if success { ExitStatus::Success } else { ExitStatus::Failure },
                        output,
                        input_files: Default::default(),
                        output_files: Default::default(),
                    },
                    Err(err) => CommandResult::failure(err.to_string().into_bytes()),
                }
            };
            let _ = sender.send((id, result));
        });
    }

    fn size(&self) -> usize {
        self.pending.len()
    }

    fn can_run_more(&self) -> bool {
        true
    }

    fn run_commands(&mut self) -> bool {
        if self.interrupted.load(Ordering::SeqCst) {
            return true;
        }
        if self.pending.is_empty() {
            return false;
        }
        // Block for at least one completion, then drain whatever else is ready.
        if let Ok((id, result)) = self.receiver.recv() {
            self.complete(id, result);
        }
        while let Ok((id, result)) = self.receiver.try_recv() {
            self.complete(id, result);
        }
        false
    }
}

impl<E: Executor + 'static, T: Tracer + 'static> PlatformRunner<E, T> {
    fn complete(&mut self, id: u64, result: CommandResult) {
        if let Some(job) = self.pending.remove(&id) {
            (job.callback)(job.step, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::executor::ScriptedExecutor;
    use crate::tracer::NullTracer;
    use crate::fs_util::{FileSystem, InMemoryFileSystem};
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn untraced_command_runs_via_executor_and_completes() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        fs.write(std::path::Path::new("one"), b"ONE").unwrap();
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs.clone()), NullTracer, vec![], 2);

        let (tx, rx) = std_mpsc::channel();
        runner.invoke(
            Invocation { command: "two=>one".into(), step: StepIndex(0), pool: String::new(), traced: false },
            Box::new(move |step, result| tx.send((step, result)).unwrap()),
        );
        assert_eq!(runner.size(), 1);
        while runner.size() > 0 {
            runner.run_commands();
        }
        let (step, result) = rx.recv().unwrap();
        assert_eq!(step, StepIndex(0));
        assert_eq!(result.exit_status, ExitStatus::Success);
        assert_eq!(fs.read(std::path::Path::new("two")).unwrap(), b"two\nONE");
    }

    #[test]
    fn failing_command_reports_failure() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs), NullTracer, vec![], 2);
        let (tx, rx) = std_mpsc::channel();
        runner.invoke(
            Invocation { command: "FAIL".into(), step: StepIndex(0), pool: String::new(), traced: false },
            Box::new(move |step, result| tx.send((step, result)).unwrap()),
        );
        while runner.size() > 0 {
            runner.run_commands();
        }
        let (_, result) = rx.recv().unwrap();
        assert_eq!(result.exit_status, ExitStatus::Failure);
    }

    #[test]
    fn interrupt_is_reported_without_waiting() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs), NullTracer, vec![], 1);
        runner.interrupt();
        assert!(runner.run_commands());
    }
}
