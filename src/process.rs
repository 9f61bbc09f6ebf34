//! Subprocess interface for every external tool the builder shells out to.
//!
//! All side-effecting invocations (losetup, mount, parted, chroot, docker...)
//! go through [`Cmd`], which resolves against a [`Runner`]. The default
//! [`HostRunner`] executes for real; tests inject a [`RecordingRunner`] that
//! captures the call sequence and replays scripted outputs.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::errors::BuildError;

/// A fully-described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_clear: bool,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl CmdSpec {
    /// Rendered `program arg1 arg2 ...` line, used in logs and test assertions.
    pub fn render(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Executes command specs. One real implementation, one recording fake.
pub trait Runner: Send + Sync {
    fn run(&self, spec: &CmdSpec) -> Result<CmdOutput>;
}

/// Executes on the host via `std::process::Command`.
#[derive(Debug, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, spec: &CmdSpec) -> Result<CmdOutput> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if spec.env_clear {
            command.env_clear();
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let output = if let Some(input) = &spec.stdin {
            let mut child = command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("Failed to spawn {}", spec.program))?;
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                stdin.write_all(input)?;
            }
            child
                .wait_with_output()
                .with_context(|| format!("Failed to wait for {}", spec.program))?
        } else {
            command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .with_context(|| format!("Failed to run {}", spec.program))?
        };

        Ok(CmdOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Records every spec it receives and pops scripted outputs in order.
/// When the script is exhausted it returns success with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CmdSpec>>,
    script: Mutex<Vec<CmdOutput>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next output to return. Calls are consumed FIFO.
    pub fn push_output(&self, output: CmdOutput) {
        self.script.lock().unwrap().push(output);
    }

    /// Convenience: queue a successful invocation with the given stdout.
    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(CmdOutput {
            status: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        });
    }

    /// Convenience: queue a failing invocation with the given stderr.
    pub fn push_failure(&self, status: i32, stderr: &str) {
        self.push_output(CmdOutput {
            status,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        });
    }

    /// Rendered command lines in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(CmdSpec::render).collect()
    }

    /// Raw specs in invocation order.
    pub fn specs(&self) -> Vec<CmdSpec> {
        self.calls.lock().unwrap().clone()
    }
}

impl Runner for RecordingRunner {
    fn run(&self, spec: &CmdSpec) -> Result<CmdOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(CmdOutput::default())
        } else {
            Ok(script.remove(0))
        }
    }
}

/// Builder over [`CmdSpec`] with the failure policy attached.
///
/// `run()` fails on non-zero exit unless `allow_fail()` was set; when an
/// `error_msg` is present it leads the error, followed by captured stderr.
pub struct Cmd<'r> {
    spec: CmdSpec,
    runner: &'r dyn Runner,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl<'r> Cmd<'r> {
    pub fn new(runner: &'r dyn Runner, program: &str) -> Self {
        Self {
            spec: CmdSpec {
                program: program.to_string(),
                args: Vec::new(),
                env: Vec::new(),
                env_clear: false,
                cwd: None,
                stdin: None,
            },
            runner,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.spec.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.spec.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.spec.args.push(path.display().to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.spec.env_clear = true;
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.spec.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn stdin_bytes(mut self, bytes: &[u8]) -> Self {
        self.spec.stdin = Some(bytes.to_vec());
        self
    }

    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn run(self) -> Result<CmdOutput> {
        let output = self.runner.run(&self.spec)?;
        if output.success() || self.allow_fail {
            return Ok(output);
        }
        let detail = match self.error_msg {
            Some(msg) => format!("{}: {}", msg, output.stderr_str()),
            None => output.stderr_str(),
        };
        Err(BuildError::ExternalTool {
            command: self.spec.render(),
            status: output.status,
            detail,
        }
        .into())
    }
}

/// Shared runner handle the way components hold it.
pub type SharedRunner = Arc<dyn Runner>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_runner_captures_output() {
        let runner = HostRunner;
        let out = Cmd::new(&runner, "echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_str(), "hello");
    }

    #[test]
    fn nonzero_exit_becomes_external_tool_error() {
        let runner = HostRunner;
        let err = Cmd::new(&runner, "false")
            .error_msg("false failed")
            .run()
            .unwrap_err();
        let kind = err.downcast_ref::<BuildError>().unwrap();
        assert!(matches!(kind, BuildError::ExternalTool { .. }));
    }

    #[test]
    fn allow_fail_suppresses_error() {
        let runner = HostRunner;
        let out = Cmd::new(&runner, "false").allow_fail().run().unwrap();
        assert!(!out.success());
    }

    #[test]
    fn recording_runner_replays_script_in_order() {
        let runner = RecordingRunner::new();
        runner.push_stdout("/dev/loop0");
        runner.push_failure(1, "busy");

        let first = Cmd::new(&runner, "losetup").args(["-f"]).run().unwrap();
        assert_eq!(first.stdout_str(), "/dev/loop0");

        let second = Cmd::new(&runner, "umount").allow_fail().run().unwrap();
        assert_eq!(second.status, 1);

        // Script exhausted: defaults to success.
        let third = Cmd::new(&runner, "sync").run().unwrap();
        assert!(third.success());

        assert_eq!(runner.calls(), vec!["losetup -f", "umount", "sync"]);
    }

    #[test]
    fn spec_render_includes_args() {
        let runner = RecordingRunner::new();
        Cmd::new(&runner, "parted")
            .args(["-s", "/dev/loop0", "resizepart", "2", "100%"])
            .run()
            .unwrap();
        assert_eq!(runner.calls(), vec!["parted -s /dev/loop0 resizepart 2 100%"]);
    }
}
