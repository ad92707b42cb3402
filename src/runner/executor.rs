//! Untraced command execution: the bottom of the platform runner for steps
//! that bypass tracing entirely (generator steps, the `console` pool).

use std::sync::Arc;

use crate::fs_util::FileSystem;

pub trait Executor: Send + Sync {
    /// Runs `command` to completion, returning its success and captured
    /// combined stdout/stderr.
    fn execute(&self, command: &str) -> std::io::Result<(bool, Vec<u8>)>;
}

/// Runs `command` through `sh -c`, the way a real build step executes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn execute(&self, command: &str) -> std::io::Result<(bool, Vec<u8>)> {
        let output = std::process::Command::new("sh").arg("-c").arg(command).output()?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok((output.status.success(), combined))
    }
}

/// Test double driven entirely off the command string, against a shared
/// [`FileSystem`]: `"out1,out2=>in1,in2"` reads each input's content, writes
/// each output as `"{output_path}\n{concatenated input contents}"`, matching
/// the `cmd(inputs→outputs)` convention used by the scenario tests. The
/// literal command `"FAIL"` always fails without touching the filesystem.
#[derive(Clone)]
pub struct ScriptedExecutor {
    fs: Arc<dyn FileSystem>,
}

impl ScriptedExecutor {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, command: &str) -> std::io::Result<(bool, Vec<u8>)> {
        if command == "FAIL" {
            return Ok((false, b"scripted failure".to_vec()));
        }
        let (outputs, inputs) = command.split_once("=>").unwrap_or((command, ""));
        let input_paths: Vec<&str> = inputs.split(',').filter(|s| !s.is_empty()).collect();
        let mut contents = Vec::new();
        for input in &input_paths {
            contents.extend_from_slice(&self.fs.read(std::path::Path::new(input))?);
        }
        for output in outputs.split(',').filter(|s| !s.is_empty()) {
            let mut body = format!("{output}\n").into_bytes();
            body.extend_from_slice(&contents);
            self.fs.write(std::path::Path::new(output), &body)?;
        }
        Ok((true, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::InMemoryFileSystem;

    #[test]
    fn scripted_executor_writes_outputs_from_concatenated_inputs() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        fs.write(std::path::Path::new("one"), b"ONE").unwrap();
        let executor = ScriptedExecutor::new(fs.clone());
        let (ok, _) = executor.execute("two=>one").unwrap();
        assert!(ok);
        assert_eq!(fs.read(std::path::Path::new("two")).unwrap(), b"two\nONE");
    }

    #[test]
    fn scripted_executor_fail_sentinel_does_not_write() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let executor = ScriptedExecutor::new(fs.clone());
        let (ok, _) = executor.execute("FAIL").unwrap();
        assert!(!ok);
        assert!(fs.read(std::path::Path::new("FAIL")).is_err());
    }
}
