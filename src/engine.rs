//! `Engine`: the crate's single public entry point for "run a build",
//! wiring config → compiled manifest → reaper → planner → scheduler the way
//! the teacher's `Project` facade orchestrates cache + resolver + compiler
//! for "run solc" (`SPEC_FULL.md` §4).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::BuildConfig;
use crate::error::{CompileError, Error, PlanError};
use crate::fs_util::{FileSystem, RealFileSystem};
use crate::invocation_log::{InvocationLog, PersistentInvocationLog};
use crate::manifest::{parse_and_compile, CompiledManifest, RawManifest, StepIndex};
use crate::oracle::{self, FingerprintMemo};
use crate::plan::{self, Build};
use crate::reaper;
use crate::runner::{
    Completion, Executor, Invocation, LimitedRunner, PlatformRunner, PooledRunner, Runner, ShellExecutor,
    SystemLoadProvider,
};
use crate::scheduler;
use crate::status::StatusSink;
use crate::tracer::{NullTracer, Tracer};

/// Counts actual dispatches to the inner runner, as opposed to steps the
/// scheduler short-circuits (phony aliases, clean bypass, restat bypass) —
/// those never reach `invoke`. Lets [`Engine::build`] report how many
/// commands it truly ran.
struct CountingRunner<R: Runner> {
    inner: R,
    invoked: Arc<AtomicUsize>,
}

impl<R: Runner> Runner for CountingRunner<R> {
    fn invoke(&mut self, job: Invocation, callback: Completion) {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(job, callback);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    fn run_commands(&mut self) -> bool {
        self.inner.run_commands()
    }
}

/// How many times the manifest-regenerator step is allowed to re-run before
/// the engine gives up and reports the manifest as still dirty
/// (`spec.md` §8 scenario 6: regeneration must converge, not loop forever).
const MAX_REGENERATION_PASSES: u32 = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub commands_run: usize,
    pub manifest_regenerations: u32,
}

/// A parser for manifest surface syntax is an external collaborator
/// (`spec.md` §1); the engine only needs something that turns a manifest
/// path into a [`RawManifest`].
pub type ManifestParser<'a> = dyn Fn(&Path) -> Result<RawManifest, CompileError> + 'a;

/// The build engine. Generic over the command [`Executor`] and [`Tracer`]
/// the same way the teacher's `Project<C, T>` is generic over its compiler
/// and artifact-output strategies — defaults are the production shapes
/// (`ShellExecutor`, `NullTracer`), tests substitute scripted doubles.
pub struct Engine<E: Executor + Clone + 'static = ShellExecutor, T: Tracer + Clone + 'static = NullTracer> {
    config: BuildConfig,
    fs: Arc<dyn FileSystem>,
    executor: E,
    tracer: T,
}

impl Engine<ShellExecutor, NullTracer> {
    pub fn new(config: BuildConfig) -> Self {
        Self::with_collaborators(config, Arc::new(RealFileSystem), ShellExecutor, NullTracer)
    }
}

impl<E: Executor + Clone + 'static, T: Tracer + Clone + 'static> Engine<E, T> {
    pub fn with_collaborators(config: BuildConfig, fs: Arc<dyn FileSystem>, executor: E, tracer: T) -> Self {
        Self { config, fs, executor, tracer }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Runs a build to completion: loads (or compiles) the manifest,
    /// re-runs the manifest regenerator if one exists and is dirty, reaps
    /// stale outputs, plans, and schedules. `targets` selects output paths;
    /// an empty slice means "the manifest's defaults, else its roots"
    /// (`spec.md` §6.6).
    pub fn build(
        &self,
        manifest_path: &Path,
        parse: &ManifestParser<'_>,
        targets: &[PathBuf],
        status: &dyn StatusSink,
    ) -> Result<BuildReport, Error> {
        let fs = self.fs.as_ref();
        let (mut log, needs_recompaction) = PersistentInvocationLog::open(
            self.fs.clone(),
            self.config.log_path.clone(),
            self.config.invocation_log,
        )
        .map_err(|e| Error::io(self.config.log_path.clone(), e))?;

        let (compiled, regenerations) = self.compile_with_regeneration(manifest_path, parse, &mut log, status)?;

        if compiled.steps.is_empty() {
            return Ok(BuildReport { commands_run: 0, manifest_regenerations: regenerations });
        }

        let targets = self.resolve_targets(&compiled, targets)?;

        let live_hashes: HashSet<_> = compiled.steps.iter().map(|s| s.step_hash).collect();
        let invocations = log.invocations().clone();
        reaper::delete_stale_outputs(&invocations, &live_hashes, fs, &mut log);

        let mut build = Build::construct(&compiled, log.invocations(), self.config.allowed_failures, &targets)
            .map_err(Error::Plan)?;
        let memo = FingerprintMemo::new();
        plan::discard_clean_steps(&mut build, &compiled, log.invocations(), fs, &memo);

        let platform = PlatformRunner::new(
            self.executor.clone(),
            self.tracer.clone(),
            self.config.ignored_trace_prefixes.clone(),
            self.config.parallelism,
        );
        let limited = LimitedRunner::new(platform, self.config.parallelism, self.config.max_load_average, SystemLoadProvider);
        let pooled = PooledRunner::new(limited, compiled.pools.clone());
        let invoked = Arc::new(AtomicUsize::new(0));
        let mut runner = CountingRunner { inner: pooled, invoked: invoked.clone() };

        scheduler::run(
            &mut build,
            &compiled,
            fs,
            &mut log,
            &mut runner,
            status,
            &memo,
            &self.config.ignored_trace_prefixes,
        )?;

        if needs_recompaction {
            log.recompact().map_err(|e| Error::io(self.config.log_path.clone(), e))?;
        }

        let bytes = compiled.serialize();
        fs.write(&self.config.compiled_manifest_path, &bytes)
            .map_err(|e| Error::io(self.config.compiled_manifest_path.clone(), e))?;

        Ok(BuildReport { commands_run: invoked.load(Ordering::SeqCst), manifest_regenerations: regenerations })
    }

    /// Dry-run: reports which steps would run without touching the
    /// filesystem, invoking any command, or writing to the log
    /// (`spec.md` §6.6).
    pub fn plan_dry_run(
        &self,
        manifest_path: &Path,
        parse: &ManifestParser<'_>,
        targets: &[PathBuf],
    ) -> Result<Vec<StepIndex>, Error> {
        let fs = self.fs.as_ref();
        let (compiled, _) =
            parse_and_compile(fs, manifest_path, &self.config.compiled_manifest_path, |p| parse(p))
                .map_err(Error::Compile)?;
        let (log, _) = PersistentInvocationLog::open(
            self.fs.clone(),
            self.config.log_path.clone(),
            self.config.invocation_log,
        )
        .map_err(|e| Error::io(self.config.log_path.clone(), e))?;

        let targets = self.resolve_targets(&compiled, targets)?;
        let mut build = Build::construct(&compiled, log.invocations(), self.config.allowed_failures, &targets)
            .map_err(Error::Plan)?;
        let memo = FingerprintMemo::new();
        plan::discard_clean_steps(&mut build, &compiled, log.invocations(), fs, &memo);
        Ok(build.ready_steps.iter().copied().collect())
    }

    /// Clean mode (`spec.md` §6.6): runs the reaper over every output the
    /// log currently tracks — as if no step in the manifest were live — and
    /// returns without scheduling anything.
    pub fn clean(&self, manifest_path: &Path, parse: &ManifestParser<'_>) -> Result<(), Error> {
        let fs = self.fs.as_ref();
        let _ = parse_and_compile(fs, manifest_path, &self.config.compiled_manifest_path, |p| parse(p))
            .map_err(Error::Compile)?;
        let (mut log, _) = PersistentInvocationLog::open(
            self.fs.clone(),
            self.config.log_path.clone(),
            self.config.invocation_log,
        )
        .map_err(|e| Error::io(self.config.log_path.clone(), e))?;
        let empty = HashSet::new();
        let invocations = log.invocations().clone();
        reaper::delete_stale_outputs(&invocations, &empty, fs, &mut log);
        Ok(())
    }

    fn resolve_targets(&self, compiled: &CompiledManifest, targets: &[PathBuf]) -> Result<Vec<StepIndex>, Error> {
        if targets.is_empty() {
            if !compiled.defaults.is_empty() {
                return Ok(compiled.defaults.clone());
            }
            return Ok(compiled.roots.clone());
        }
        targets
            .iter()
            .map(|t| {
                if t.as_os_str() == "clean" {
                    return Err(Error::Plan(PlanError::CleanIsNotATarget));
                }
                if t.as_os_str() == "help" {
                    return Err(Error::Plan(PlanError::HelpIsNotATarget));
                }
                compiled
                    .outputs
                    .get(t)
                    .copied()
                    .ok_or_else(|| Error::Plan(PlanError::UnknownTarget(t.display().to_string())))
            })
            .collect()
    }

    /// `spec.md` §8 scenario 6: if the manifest declares a regenerator step,
    /// run it (and only it) ahead of everything else whenever it's dirty,
    /// then re-parse and re-compile the manifest it produced. Repeats until
    /// the regenerator reports clean or the pass budget is exhausted.
    fn compile_with_regeneration(
        &self,
        manifest_path: &Path,
        parse: &ManifestParser<'_>,
        log: &mut PersistentInvocationLog,
        status: &dyn StatusSink,
    ) -> Result<(CompiledManifest, u32), Error> {
        let fs = self.fs.as_ref();
        let (mut compiled, _) =
            parse_and_compile(fs, manifest_path, &self.config.compiled_manifest_path, |p| parse(p))
                .map_err(Error::Compile)?;

        let mut passes = 0;
        while let Some(regen_idx) = compiled.manifest_regenerator {
            let memo = FingerprintMemo::new();
            let step = compiled.step(regen_idx);
            if oracle::is_clean(step, log.invocations(), fs, &memo).is_clean() {
                break;
            }
            if passes >= MAX_REGENERATION_PASSES {
                warn!(path = %manifest_path.display(), "manifest regenerator still dirty after max passes, proceeding with stale manifest");
                break;
            }

            let mut regen_build =
                Build::construct(&compiled, log.invocations(), 1, std::slice::from_ref(&regen_idx)).map_err(Error::Plan)?;
            let regen_memo = FingerprintMemo::new();
            plan::discard_clean_steps(&mut regen_build, &compiled, log.invocations(), fs, &regen_memo);

            let platform = PlatformRunner::new(self.executor.clone(), self.tracer.clone(), Vec::new(), 1);
            let limited = LimitedRunner::new(platform, 1, None, SystemLoadProvider);
            let mut runner = PooledRunner::new(limited, std::iter::empty());
            scheduler::run(&mut regen_build, &compiled, fs, log, &mut runner, status, &regen_memo, &[])?;

            passes += 1;
            let (recompiled, _) =
                parse_and_compile(fs, manifest_path, &self.config.compiled_manifest_path, |p| parse(p))
                    .map_err(Error::Compile)?;
            compiled = recompiled;
        }

        Ok((compiled, passes))
    }
}
