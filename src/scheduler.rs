//! Scheduler (`spec.md` §4.8): drains `ready_steps`, dispatches through the
//! runner stack, consumes completions, updates the invocation log,
//! propagates readiness, and enforces the failure budget.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc;

use crate::error::Error;
use crate::fingerprint::{self, FileId, Fingerprint};
use crate::fs_util::{FileSystem, FileType};
use crate::invocation_log::InvocationLog;
use crate::manifest::{CompiledManifest, Step, StepIndex};
use crate::oracle::{self, FingerprintMemo, Verdict};
use crate::plan::{self, Build};
use crate::reaper;
use crate::runner::{CommandResult, ExitStatus, Invocation, Runner};
use crate::status::StatusSink;

/// Drives `build` to completion against `compiled`. Returns the first
/// command failure once the failure budget is exhausted, or an interrupted
/// build; on success every reachable step has run, bypassed, or been
/// counted against the budget.
///
/// **Restat bypass.** Rather than tracking a separate `clean_steps` set
/// (`spec.md` §4.8's "Canonical bypass"), this re-invokes [`oracle::is_clean`]
/// against live filesystem state at the moment each step is popped from
/// `ready_steps`. [`plan::discard_clean_steps`] has already removed every
/// step that was clean *before* scheduling began, so anything this loop
/// pops was dirty at plan time; it can only have become bypassable because
/// a dependency just produced byte-identical output during this build,
/// which re-running the oracle against the current filesystem detects
/// directly — without a second bookkeeping structure.
#[allow(clippy::too_many_arguments)]
pub fn run(
    build: &mut Build,
    compiled: &CompiledManifest,
    fs: &dyn FileSystem,
    log: &mut dyn InvocationLog,
    runner: &mut dyn Runner,
    status: &dyn StatusSink,
    memo: &FingerprintMemo,
    ignored_trace_prefixes: &[PathBuf],
) -> Result<(), Error> {
    let (tx, rx) = mpsc::channel::<(StepIndex, CommandResult)>();
    let mut stopping = false;
    let mut first_failure: Option<Error> = None;
    let mut rspfiles_in_flight: HashMap<StepIndex, PathBuf> = HashMap::new();
    let mut depfiles_in_flight: HashMap<StepIndex, PathBuf> = HashMap::new();

    loop {
        while !stopping && !build.ready_steps.is_empty() && runner.can_run_more() {
            let idx = build.ready_steps.pop_front().unwrap();
            let step = compiled.step(idx);

            if step.is_phony() {
                status.step_started(idx);
                status.step_finished(idx, true, &[]);
                build.mark_step_node_as_done(idx, &[]);
                continue;
            }

            if !build.nodes[idx.index()].unconditionally_dirty {
                if let Verdict::Clean { should_refresh } = oracle::is_clean(step, log.invocations(), fs, memo) {
                    status.step_started(idx);
                    status.step_finished(idx, true, &[]);
                    if should_refresh {
                        refresh_invocation_record(step, log, fs, memo)?;
                    }
                    let output_ids = plan::output_file_ids_for_build_step(step, fs);
                    build.mark_step_node_as_done(idx, &output_ids);
                    continue;
                }
            }

            reaper::delete_old_outputs(log.invocations(), step.step_hash, fs);

            for dir in &step.output_dirs {
                if fs.metadata(dir).file_type == FileType::Missing {
                    fs.create_dir_all(dir).map_err(|e| Error::io(dir.clone(), e))?;
                    let _ = log.created_directory(dir);
                }
            }

            if let Some(rsp) = &step.rspfile {
                fs.write(&rsp.path, rsp.content.as_bytes()).map_err(|e| Error::io(rsp.path.clone(), e))?;
                rspfiles_in_flight.insert(idx, rsp.path.clone());
            }
            if let Some(dep) = &step.depfile {
                depfiles_in_flight.insert(idx, dep.clone());
            }

            status.step_started(idx);
            let pool = step.pool.clone();
            let command = step.command.clone().expect("non-phony step carries a command");
            let traced = pool != "console" && !step.generator;
            let result_tx = tx.clone();
            runner.invoke(
                Invocation { command, step: idx, pool, traced },
                Box::new(move |step_idx, result| {
                    let _ = result_tx.send((step_idx, result));
                }),
            );
        }

        if runner.size() == 0 && (stopping || build.ready_steps.is_empty()) {
            break;
        }

        if runner.run_commands() {
            for path in rspfiles_in_flight.values().chain(depfiles_in_flight.values()) {
                let _ = fs.remove_file(path);
            }
            return Err(Error::Interrupted);
        }

        while let Ok((idx, result)) = rx.try_recv() {
            let step = compiled.step(idx);
            if let Some(path) = depfiles_in_flight.remove(&idx) {
                let _ = fs.remove_file(&path);
            }

            match result.exit_status {
                ExitStatus::Success => {
                    if let Some(path) = rspfiles_in_flight.remove(&idx) {
                        let _ = fs.remove_file(&path);
                    }
                    record_success(build, compiled, step, idx, &result, fs, log, memo, ignored_trace_prefixes)?;
                    status.step_finished(idx, true, &result.output);
                }
                ExitStatus::Failure | ExitStatus::Interrupted => {
                    // Retained on disk for debugging (`spec.md` §8).
                    rspfiles_in_flight.remove(&idx);
                    status.step_finished(idx, false, &result.output);
                    build.remaining_failures -= 1;
                    if first_failure.is_none() {
                        first_failure = Some(Error::CommandFailed { step: idx });
                    }
                    if build.remaining_failures <= 0 {
                        stopping = true;
                    }
                }
            }
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// `canSkipBuildCommand`'s should-refresh branch (`spec.md` §4.4): the step's
/// recorded fingerprints are stale (same content, new stat) and must be
/// rewritten without re-running the command.
fn refresh_invocation_record(
    step: &Step,
    log: &mut dyn InvocationLog,
    fs: &dyn FileSystem,
    memo: &FingerprintMemo,
) -> Result<(), Error> {
    let Some(record) = log.invocations().entries.get(&step.step_hash).cloned() else {
        return Ok(());
    };
    let now = fs.now();
    let refresh = |entries: &[(PathBuf, Fingerprint)]| -> Vec<(PathBuf, Fingerprint)> {
        entries
            .iter()
            .map(|(path, prior)| {
                let (refreshed, _) = fingerprint::retake(fs, now, path, prior);
                memo.invalidate(path);
                (path.clone(), refreshed)
            })
            .collect()
    };
    log.ran_command(
        step.step_hash,
        &refresh(&record.output_files),
        &refresh(&record.input_files),
        &record.ignored_dependencies,
        &record.additional_dependencies,
    )
    .map_err(|e| Error::io(PathBuf::from("<invocation log>"), e))
}

/// Step 5-8 of the scheduler loop (`spec.md` §4.8): output-conflict check,
/// fingerprinting, used/ignored/additional dependency computation, the log
/// write, and marking the node done.
#[allow(clippy::too_many_arguments)]
fn record_success(
    build: &mut Build,
    compiled: &CompiledManifest,
    step: &Step,
    idx: StepIndex,
    result: &CommandResult,
    fs: &dyn FileSystem,
    log: &mut dyn InvocationLog,
    memo: &FingerprintMemo,
    ignored_trace_prefixes: &[PathBuf],
) -> Result<(), Error> {
    let mut written: HashSet<PathBuf> = step.declared_outputs.iter().cloned().collect();
    written.extend(result.output_files.iter().cloned());
    // A sibling step may have already stated one of these paths through
    // `memo` (e.g. while this step was still in flight); its cached stat is
    // now stale since this command just wrote the path.
    for path in &written {
        memo.invalidate(path);
    }
    for path in &written {
        let meta = fs.metadata(path);
        if meta.file_type == FileType::Missing {
            continue;
        }
        let file_id = FileId::from_metadata(&meta);
        if let Some(&existing) = build.output_files.get(&file_id) {
            if existing != idx {
                return Err(Error::OutputConflict { path: path.clone(), first_writer: existing });
            }
        }
    }

    let now = fs.now();
    let output_fingerprints: Vec<(PathBuf, Fingerprint)> = step
        .declared_outputs
        .iter()
        .map(|path| {
            let (fp, _) = log.fingerprint(now, path);
            (path.clone(), fp)
        })
        .collect();

    let mut observed_inputs: HashSet<PathBuf> = step.all_declared_inputs().cloned().collect();
    for path in &result.input_files {
        if ignored_trace_prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            continue;
        }
        // A step reading back its own declared output isn't a dependency on
        // anything; undeclared reads of *other* steps' outputs are exactly
        // what `usedDependencies` below needs to discover.
        if step.declared_outputs.contains(path) {
            continue;
        }
        observed_inputs.insert(path.clone());
    }
    let input_fingerprints: Vec<(PathBuf, Fingerprint)> = observed_inputs
        .iter()
        .map(|path| {
            let (fp, _) = log.fingerprint(now, path);
            (path.clone(), fp)
        })
        .collect();

    let observed_input_file_ids: Vec<FileId> = observed_inputs
        .iter()
        .filter_map(|path| {
            let meta = fs.metadata(path);
            (meta.file_type != FileType::Missing).then(|| FileId::from_metadata(&meta))
        })
        .collect();

    let used = plan::used_dependencies(&build.output_files, &observed_input_file_ids);
    let (ignored, additional) = plan::ignored_and_additional_dependencies(compiled, step, &used);

    log.ran_command(step.step_hash, &output_fingerprints, &input_fingerprints, &ignored, &additional)
        .map_err(|e| Error::io(PathBuf::from("<invocation log>"), e))?;

    // `output_files` must cover every path this step actually wrote, not just
    // its declared outputs, so a later step's undeclared read of a
    // traced-only write resolves to this step via `usedDependencies`, and so
    // two steps writing the same undeclared path conflict on the second one.
    let output_ids: Vec<FileId> = if step.generator {
        Vec::new()
    } else {
        written
            .iter()
            .filter_map(|path| {
                let meta = fs.metadata(path);
                (meta.file_type != FileType::Missing).then(|| FileId::from_metadata(&meta))
            })
            .collect()
    };
    build.mark_step_node_as_done(idx, &output_ids);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation_log::InMemoryInvocationLog;
    use crate::manifest::{RawManifest, RawStep};
    use crate::runner::{Executor, PlatformRunner, ScriptedExecutor};
    use crate::status::CountingStatusSink;
    use crate::tracer::{DeclaredOnlyTracer, NullTracer};
    use std::sync::Arc;

    fn raw_step(command: &str, inputs: &[&str], outputs: &[&str]) -> RawStep {
        RawStep {
            command: Some(command.to_string()),
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            ..Default::default()
        }
    }

    /// Wraps an [`Executor`], counting how many commands it actually ran —
    /// distinct from `status.started`, which fires for bypassed steps too.
    #[derive(Clone)]
    struct CountingExecutor<E> {
        inner: E,
        ran: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl<E: Executor> Executor for CountingExecutor<E> {
        fn execute(&self, command: &str) -> std::io::Result<(bool, Vec<u8>)> {
            self.ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.execute(command)
        }
    }

    fn script_for(step: &Step) -> String {
        format!(
            "{}=>{}",
            step.declared_outputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(","),
            step.all_declared_inputs().map(|p| p.display().to_string()).collect::<Vec<_>>().join(","),
        )
    }

    /// Builds a manifest whose step commands already follow the
    /// `ScriptedExecutor`'s `"outputs=>inputs"` convention, so the fixture
    /// commands match the content each step actually declares. Runs on the
    /// `console` pool so the scheduler bypasses tracing and the executor
    /// actually writes the files these tests assert on.
    fn compile_scripted(raw: RawManifest) -> CompiledManifest {
        let mut compiled = CompiledManifest::compile(&raw).unwrap();
        for step in &mut compiled.steps {
            if !step.is_phony() {
                step.command = Some(script_for(step));
                step.pool = "console".to_string();
            }
        }
        compiled
    }

    /// Tracer double that actually executes the command through a shared
    /// executor (so file writes happen) and reports exactly the paths the
    /// `"outputs=>inputs"` command string names, the same way a real tracer
    /// would observe a process that reads and writes those paths.
    struct ScriptedTracer {
        executor: ScriptedExecutor,
    }

    impl crate::tracer::Tracer for ScriptedTracer {
        fn run(&self, command: &str, _ignored_prefixes: &[PathBuf]) -> std::io::Result<(bool, crate::tracer::TraceResult)> {
            let (success, _) = self.executor.execute(command)?;
            let (outputs, inputs) = command.split_once("=>").unwrap_or((command, ""));
            let input_files = inputs.split(',').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
            let output_files = outputs.split(',').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
            Ok((success, crate::tracer::TraceResult { input_files, output_files }))
        }
    }

    fn drain(fs: &Arc<dyn FileSystem>, build: &mut Build, compiled: &CompiledManifest, runner: &mut dyn Runner, log: &mut dyn InvocationLog, status: &dyn StatusSink) -> Result<(), Error> {
        let memo = FingerprintMemo::new();
        run(build, compiled, fs.as_ref(), log, runner, status, &memo, &[])
    }

    #[test]
    fn single_chain_rebuild_runs_twice_then_zero_commands() {
        let fs: Arc<dyn FileSystem> = Arc::new(crate::fs_util::InMemoryFileSystem::new());
        let raw = RawManifest {
            steps: vec![raw_step("", &[], &["one"]), raw_step("", &["one"], &["two"])],
            ..Default::default()
        };
        let compiled = compile_scripted(raw);
        let mut log = InMemoryInvocationLog::new(fs.clone());
        let status = CountingStatusSink::default();

        let mut build = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(1)]).unwrap();
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs.clone()), NullTracer, vec![], 4);
        drain(&fs, &mut build, &compiled, &mut runner, &mut log, &status).unwrap();
        assert_eq!(status.started.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(fs.read(std::path::Path::new("two")).unwrap(), b"two\none\n");

        // Second build, nothing changed: zero commands run.
        let status2 = CountingStatusSink::default();
        let mut build2 = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(1)]).unwrap();
        let memo2 = FingerprintMemo::new();
        let clean = plan::discard_clean_steps(&mut build2, &compiled, log.invocations(), fs.as_ref(), &memo2);
        assert_eq!(clean.len(), 2);
        let mut runner2 = PlatformRunner::new(ScriptedExecutor::new(fs.clone()), NullTracer, vec![], 4);
        run(&mut build2, &compiled, fs.as_ref(), &mut log, &mut runner2, &status2, &memo2, &[]).unwrap();
        assert_eq!(status2.started.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn restat_bypass_skips_downstream_when_upstream_output_is_byte_identical() {
        let fs: Arc<dyn FileSystem> = Arc::new(crate::fs_util::InMemoryFileSystem::new());
        let raw = RawManifest {
            steps: vec![
                raw_step("", &[], &["out1"]),
                raw_step("", &["out1"], &["out2"]),
                raw_step("", &["out2"], &["out3"]),
            ],
            ..Default::default()
        };
        let compiled = compile_scripted(raw);
        let mut log = InMemoryInvocationLog::new(fs.clone());
        let status = CountingStatusSink::default();
        let mut build = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(2)]).unwrap();
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs.clone()), NullTracer, vec![], 4);
        drain(&fs, &mut build, &compiled, &mut runner, &mut log, &status).unwrap();
        assert_eq!(status.started.load(std::sync::atomic::Ordering::SeqCst), 3);

        // Delete out1; cmd1 will reproduce it byte-identical. cmd2/cmd3 bypass.
        fs.remove_file(std::path::Path::new("out1")).unwrap();
        let status2 = CountingStatusSink::default();
        let mut build2 = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(2)]).unwrap();
        // Single memo shared across plan and scheduler phases, the way
        // `Engine::build` shares one: exercises that a step's write is
        // visible to a sibling's `is_clean` check later in the same build.
        let memo2 = FingerprintMemo::new();
        plan::discard_clean_steps(&mut build2, &compiled, log.invocations(), fs.as_ref(), &memo2);
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let executor = CountingExecutor { inner: ScriptedExecutor::new(fs.clone()), ran: ran.clone() };
        let mut runner2 = PlatformRunner::new(executor, NullTracer, vec![], 4);
        run(&mut build2, &compiled, fs.as_ref(), &mut log, &mut runner2, &status2, &memo2, &[]).unwrap();

        // cmd2/cmd3 are still counted as started/finished per `spec.md` §8
        // scenario 3, but only cmd1 actually dispatched a command.
        assert_eq!(fs.read(std::path::Path::new("out1")).unwrap(), b"out1\n");
        assert_eq!(status2.started.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn output_conflict_between_traced_writes_is_fatal() {
        let fs: Arc<dyn FileSystem> = Arc::new(crate::fs_util::InMemoryFileSystem::new());
        fs.write(std::path::Path::new("shared"), b"first").unwrap();
        let raw = RawManifest {
            steps: vec![raw_step("a", &[], &["a_out"]), raw_step("b", &[], &["b_out"])],
            ..Default::default()
        };
        let compiled = CompiledManifest::compile(&raw).unwrap();
        let mut log = InMemoryInvocationLog::new(fs.clone());
        let status = CountingStatusSink::default();
        let mut build = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(0), StepIndex(1)]).unwrap();

        // Both steps' tracers report writing to `shared`, a path neither
        // declares: the second completion to be recorded must conflict.
        let mut runner = PlatformRunner::new(
            ScriptedExecutor::new(fs.clone()),
            DeclaredOnlyTracer::new([], [PathBuf::from("shared")]),
            vec![],
            1,
        );
        let memo = FingerprintMemo::new();
        let err = run(&mut build, &compiled, fs.as_ref(), &mut log, &mut runner, &status, &memo, &[]).unwrap_err();
        assert!(matches!(err, Error::OutputConflict { .. }));
    }

    #[test]
    fn undeclared_input_is_recorded_as_additional_dependency() {
        let fs: Arc<dyn FileSystem> = Arc::new(crate::fs_util::InMemoryFileSystem::new());
        let raw = RawManifest {
            steps: vec![
                raw_step("", &[], &["one"]),
                raw_step("", &[], &["two"]),
                raw_step("", &[], &["three"]),
            ],
            ..Default::default()
        };
        let mut compiled = CompiledManifest::compile(&raw).unwrap();
        for step in &mut compiled.steps {
            step.command = Some(script_for(step));
        }
        // `three` actually reads `one` without declaring it.
        compiled.steps[2].command = Some("three=>one".to_string());

        let mut log = InMemoryInvocationLog::new(fs.clone());
        let status = CountingStatusSink::default();
        let mut build =
            Build::construct(&compiled, log.invocations(), 1, &[StepIndex(0), StepIndex(1), StepIndex(2)]).unwrap();
        // These three steps share no declared dependency edge, so without a
        // parallelism gate they'd dispatch concurrently and `three`'s
        // undeclared read of `one` would race `one`'s write. Limit to one
        // in-flight command so `one` is registered in `output_files` before
        // `three` is dispatched.
        let platform = PlatformRunner::new(
            ScriptedExecutor::new(fs.clone()),
            ScriptedTracer { executor: ScriptedExecutor::new(fs.clone()) },
            vec![],
            4,
        );
        let mut runner = crate::runner::LimitedRunner::new(platform, 1, None, crate::runner::FixedLoadProvider(0.0));
        let memo = FingerprintMemo::new();
        run(&mut build, &compiled, fs.as_ref(), &mut log, &mut runner, &status, &memo, &[]).unwrap();

        let three_hash = compiled.steps[2].step_hash;
        let record = &log.invocations().entries[&three_hash];
        assert_eq!(record.additional_dependencies, vec![compiled.steps[0].step_hash]);
    }

    #[test]
    fn command_failure_does_not_enqueue_dependents() {
        let fs: Arc<dyn FileSystem> = Arc::new(crate::fs_util::InMemoryFileSystem::new());
        let raw = RawManifest {
            steps: vec![raw_step("FAIL", &[], &["one"]), raw_step("", &["one"], &["two"])],
            ..Default::default()
        };
        let mut compiled = CompiledManifest::compile(&raw).unwrap();
        compiled.steps[0].command = Some("FAIL".to_string());
        compiled.steps[0].pool = "console".to_string();
        compiled.steps[1].command = Some(script_for(&compiled.steps[1].clone()));
        compiled.steps[1].pool = "console".to_string();

        let mut log = InMemoryInvocationLog::new(fs.clone());
        let status = CountingStatusSink::default();
        let mut build = Build::construct(&compiled, log.invocations(), 1, &[StepIndex(1)]).unwrap();
        let mut runner = PlatformRunner::new(ScriptedExecutor::new(fs.clone()), NullTracer, vec![], 4);
        let memo = FingerprintMemo::new();
        let err = run(&mut build, &compiled, fs.as_ref(), &mut log, &mut runner, &status, &memo, &[]).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { step } if step == StepIndex(0)));
        assert!(!log.invocations().entries.contains_key(&compiled.steps[1].step_hash));
    }
}
