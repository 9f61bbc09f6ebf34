//! Foreign-architecture chroot executor.
//!
//! Runs shell command lines inside the mounted root of a target image whose
//! CPU architecture differs from the host, via a statically linked user-space
//! emulator registered with the kernel's binfmt dispatcher.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::BuildError;
use crate::process::{Cmd, SharedRunner};

/// Host directory the static qemu binaries are installed in.
const QEMU_HOST_DIR: &str = "/usr/bin";

pub struct ChrootExecutor {
    root: PathBuf,
    qemu_binary: String,
    runner: SharedRunner,
    /// Extra environment on top of the cleared one.
    env: Vec<(String, String)>,
    dev_bound: bool,
}

impl ChrootExecutor {
    pub fn new(root: &Path, qemu_binary: &str, runner: SharedRunner) -> Self {
        Self {
            root: root.to_path_buf(),
            qemu_binary: qemu_binary.to_string(),
            runner,
            env: vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())],
            dev_bound: false,
        }
    }

    /// Prepare the chroot: emulator binary, /dev bind, resolver file,
    /// binfmt registration, and the echo probe.
    pub fn setup(&mut self) -> Result<()> {
        let host_qemu = Path::new(QEMU_HOST_DIR).join(&self.qemu_binary);
        let target_qemu = self.root.join("usr/bin").join(&self.qemu_binary);
        fs::copy(&host_qemu, &target_qemu).with_context(|| {
            format!(
                "copying emulator '{}' into target (is qemu-user-static installed?)",
                host_qemu.display()
            )
        })?;

        Cmd::new(self.runner.as_ref(), "mount")
            .arg("--bind")
            .arg("/dev")
            .arg_path(&self.root.join("dev"))
            .error_msg("bind-mounting /dev into target failed")
            .run()?;
        self.dev_bound = true;

        // Minimal resolver so apt can reach mirrors from inside.
        let resolv = self.root.join("etc/resolv.conf");
        fs::copy("/etc/resolv.conf", &resolv)
            .with_context(|| format!("copying resolv.conf to '{}'", resolv.display()))?;

        let binfmt_name = self
            .qemu_binary
            .trim_end_matches("-static")
            .to_string();
        Cmd::new(self.runner.as_ref(), "update-binfmts")
            .args(["--enable", &binfmt_name])
            .allow_fail()
            .run()?;

        self.probe()?;
        Ok(())
    }

    /// Trivial echo through the emulated chroot. "Exec format error" means
    /// the binfmt registration is not functional on this host.
    fn probe(&self) -> Result<()> {
        let out = self.command("echo dt-chroot-probe").allow_fail().run()?;
        let stderr = out.stderr_str();
        if stderr.contains("Exec format error") {
            return Err(BuildError::EmulationMisconfigured(format!(
                "probe failed inside '{}'; install qemu-user-static and binfmt-support",
                self.root.display()
            ))
            .into());
        }
        if !out.success() {
            return Err(BuildError::EmulationMisconfigured(format!(
                "probe exited with status {}: {}",
                out.status, stderr
            ))
            .into());
        }
        Ok(())
    }

    fn command(&self, shell_line: &str) -> Cmd<'_> {
        let mut cmd = Cmd::new(self.runner.as_ref(), "chroot")
            .arg_path(&self.root)
            .args(["/bin/bash", "-c", shell_line])
            .env_clear();
        for (key, value) in &self.env {
            cmd = cmd.env(key, value);
        }
        cmd
    }

    /// Run a Bourne shell command line inside the target root.
    pub fn run(&self, shell_line: &str) -> Result<()> {
        println!("  chroot$ {shell_line}");
        self.command(shell_line)
            .error_msg(&format!("chroot command failed: {shell_line}"))
            .run()?;
        Ok(())
    }

    /// OS-level update plus install of the declared package set. On failure
    /// the /dev bind is released first, then the original error surfaces.
    pub fn upgrade_and_install(&mut self, packages: &[String]) -> Result<()> {
        let result = (|| -> Result<()> {
            self.run("apt-get update")?;
            self.run("apt-get -y upgrade")?;
            if !packages.is_empty() {
                self.run(&format!("apt-get -y install {}", packages.join(" ")))?;
            }
            Ok(())
        })();
        if result.is_err() {
            self.teardown();
        }
        result
    }

    /// Release the /dev bind. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.dev_bound {
            let _ = Cmd::new(self.runner.as_ref(), "umount")
                .arg_path(&self.root.join("dev"))
                .allow_fail()
                .run();
            self.dev_bound = false;
        }
    }
}

impl Drop for ChrootExecutor {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingRunner;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn run_clears_environment_and_keeps_declared_vars() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let executor = ChrootExecutor::new(tmp.path(), "qemu-aarch64-static", runner.clone());

        executor.run("apt-get update").unwrap();
        let specs = runner.specs();
        assert_eq!(specs[0].program, "chroot");
        assert!(specs[0].env_clear);
        assert!(specs[0]
            .env
            .contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
        assert_eq!(specs[0].args[1], "/bin/bash");
        assert_eq!(specs[0].args[3], "apt-get update");
    }

    #[test]
    fn probe_detects_exec_format_error() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.push_failure(126, "/bin/bash: Exec format error");

        let executor = ChrootExecutor::new(tmp.path(), "qemu-aarch64-static", runner);
        let err = executor.probe().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::EmulationMisconfigured(_))
        ));
    }

    #[test]
    fn failed_install_unwinds_dev_bind_first() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mut executor = ChrootExecutor::new(tmp.path(), "qemu-aarch64-static", runner.clone());
        executor.dev_bound = true;

        runner.push_failure(100, "apt broke"); // apt-get update fails
        let err = executor
            .upgrade_and_install(&["rsync".to_string()])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ExternalTool { .. })
        ));

        // The umount of <root>/dev happened during unwind.
        let calls = runner.calls();
        assert!(calls.last().unwrap().starts_with("umount"));
        assert!(!executor.dev_bound);
    }

    #[test]
    fn teardown_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mut executor = ChrootExecutor::new(tmp.path(), "qemu-aarch64-static", runner.clone());
        executor.dev_bound = true;
        executor.teardown();
        executor.teardown();
        assert_eq!(
            runner.calls().iter().filter(|c| c.starts_with("umount")).count(),
            1
        );
    }
}
