//! Build configuration (ambient stack): root/build/log paths, parallelism,
//! failure budget, and pool defaults, constructed via a builder the way the
//! teacher's `Project`/`ProjectBuilder` is constructed rather than scattered
//! free functions (`SPEC_FULL.md` §2).

use std::path::{Path, PathBuf};

use crate::invocation_log::InvocationLogConfig;

/// Resolved configuration for one [`crate::Engine`].
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// Directory build-relative paths are resolved against.
    pub root_dir: PathBuf,
    /// Where steps write their outputs; also scoped for output-directory
    /// creation bookkeeping.
    pub build_dir: PathBuf,
    /// Path to the persistent invocation log (`spec.md` §6.1).
    pub log_path: PathBuf,
    /// Path to the precompiled manifest cache (`spec.md` §6.2).
    pub compiled_manifest_path: PathBuf,
    /// Maximum commands in flight at once.
    pub parallelism: usize,
    /// Commands allowed to fail before the scheduler stops dispatching new
    /// work (`spec.md` §4.8's failure budget). `0` means "fail fast".
    pub allowed_failures: i64,
    /// 1-minute load average above which dispatch pauses, once at least one
    /// command is already in flight. `None` disables load throttling.
    pub max_load_average: Option<f64>,
    /// Path prefixes the tracer's observed sets should be filtered through
    /// before they reach `usedDependencies` (`spec.md` §6.4c) — OS tmp,
    /// system libraries, and the like.
    pub ignored_trace_prefixes: Vec<PathBuf>,
    pub invocation_log: InvocationLogConfig,
}

impl BuildConfig {
    pub fn builder(root_dir: impl Into<PathBuf>) -> BuildConfigBuilder {
        BuildConfigBuilder::new(root_dir)
    }
}

pub struct BuildConfigBuilder {
    root_dir: PathBuf,
    build_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    compiled_manifest_path: Option<PathBuf>,
    parallelism: Option<usize>,
    allowed_failures: i64,
    max_load_average: Option<f64>,
    ignored_trace_prefixes: Vec<PathBuf>,
    invocation_log: InvocationLogConfig,
}

impl BuildConfigBuilder {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            build_dir: None,
            log_path: None,
            compiled_manifest_path: None,
            parallelism: None,
            allowed_failures: 1,
            max_load_average: None,
            ignored_trace_prefixes: Vec::new(),
            invocation_log: InvocationLogConfig::default(),
        }
    }

    #[must_use]
    pub fn build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn compiled_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.compiled_manifest_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = Some(n);
        self
    }

    /// Allows every command to fail without stopping the build (`-k0`-style
    /// "keep going" budgets use `i64::MAX`).
    #[must_use]
    pub fn keep_going(self) -> Self {
        self.allowed_failures(i64::MAX)
    }

    #[must_use]
    pub fn allowed_failures(mut self, n: i64) -> Self {
        self.allowed_failures = n;
        self
    }

    #[must_use]
    pub fn max_load_average(mut self, load: f64) -> Self {
        self.max_load_average = Some(load);
        self
    }

    #[must_use]
    pub fn ignore_trace_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.ignored_trace_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn invocation_log_config(mut self, config: InvocationLogConfig) -> Self {
        self.invocation_log = config;
        self
    }

    pub fn build(self) -> BuildConfig {
        let build_dir = self.build_dir.unwrap_or_else(|| self.root_dir.join("build"));
        BuildConfig {
            log_path: self.log_path.unwrap_or_else(|| build_dir.join(".stepgraph_log")),
            compiled_manifest_path: self
                .compiled_manifest_path
                .unwrap_or_else(|| build_dir.join(".stepgraph_manifest")),
            parallelism: self.parallelism.unwrap_or_else(num_cpus::get),
            allowed_failures: self.allowed_failures,
            max_load_average: self.max_load_average,
            ignored_trace_prefixes: self.ignored_trace_prefixes,
            invocation_log: self.invocation_log,
            root_dir: self.root_dir,
            build_dir,
        }
    }
}

impl BuildConfig {
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}
