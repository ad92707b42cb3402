//! Tracer contract (`spec.md` §6.4): an external collaborator that reports,
//! for one command invocation, the files it read and the files it wrote. The
//! core only depends on this trait; per-OS syscall capture is out of scope.

use std::collections::HashSet;
use std::path::PathBuf;

/// Observed read/write sets for one traced command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceResult {
    pub input_files: HashSet<PathBuf>,
    pub output_files: HashSet<PathBuf>,
}

/// Produces the observed file-system footprint of a command. Generator and
/// console-pool steps bypass tracing entirely (`spec.md` §4.7) and never
/// call this trait.
pub trait Tracer: Send + Sync {
    /// Runs `command`, returning its exit success and the paths it touched.
    /// `ignored_prefixes` lets the caller exclude OS tmp/system-library
    /// paths from the observed sets.
    fn run(&self, command: &str, ignored_prefixes: &[PathBuf]) -> std::io::Result<(bool, TraceResult)>;
}

/// A tracer that reports empty observed sets, for commands the spec says
/// are never traced (generator steps, the `console` pool).
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn run(&self, _command: &str, _ignored_prefixes: &[PathBuf]) -> std::io::Result<(bool, TraceResult)> {
        Ok((true, TraceResult::default()))
    }
}

/// Test double that reports exactly a fixed, caller-supplied set of
/// observed inputs/outputs regardless of what `command` says, so tests can
/// exercise undeclared-input discovery without a real syscall tracer.
#[derive(Clone, Debug)]
pub struct DeclaredOnlyTracer {
    pub result: TraceResult,
    pub succeed: bool,
}

impl DeclaredOnlyTracer {
    pub fn new(inputs: impl IntoIterator<Item = PathBuf>, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            result: TraceResult { input_files: inputs.into_iter().collect(), output_files: outputs.into_iter().collect() },
            succeed: true,
        }
    }
}

impl Tracer for DeclaredOnlyTracer {
    fn run(&self, _command: &str, _ignored_prefixes: &[PathBuf]) -> std::io::Result<(bool, TraceResult)> {
        Ok((self.succeed, self.result.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tracer_reports_nothing() {
        let (ok, result) = NullTracer.run("anything", &[]).unwrap();
        assert!(ok);
        assert!(result.input_files.is_empty());
        assert!(result.output_files.is_empty());
    }

    #[test]
    fn declared_only_tracer_reports_fixed_set() {
        let tracer = DeclaredOnlyTracer::new([PathBuf::from("in")], [PathBuf::from("out")]);
        let (ok, result) = tracer.run("cmd", &[]).unwrap();
        assert!(ok);
        assert!(result.input_files.contains(&PathBuf::from("in")));
        assert!(result.output_files.contains(&PathBuf::from("out")));
    }
}
