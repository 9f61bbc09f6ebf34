//! Preflight checks for build validation.
//!
//! Validates the host before the pipeline starts so the build fails with a
//! readable message instead of a cryptic error three steps in.

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Required host tools for building disk images.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("blkid", "util-linux"),
    ("lsof", "lsof"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("chroot", "coreutils"),
    ("parted", "parted"),
    ("sgdisk", "gdisk"),
    ("partprobe", "parted"),
    ("e2fsck", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("docker", "docker-ce"),
    ("update-binfmts", "binfmt-support"),
];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with the package that
/// provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// True when running as root. Loop devices, mounts, and chroots all need
/// it.
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Check that the host can run the full pipeline: all tools present and
/// the process is privileged.
pub fn check_host(qemu_binary: &str) -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    if !command_exists(qemu_binary) {
        bail!("Missing required host tool:\n  {qemu_binary} (install: qemu-user-static)");
    }
    if !is_privileged() {
        bail!("This tool needs root privileges (loop devices, mounts, chroot). Re-run with sudo.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_ubiquitous_command() {
        assert!(command_exists("ls"));
    }

    #[test]
    fn rejects_a_missing_command() {
        assert!(!command_exists("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn missing_tools_are_listed_with_packages() {
        let tools = &[("ls", "coreutils"), ("no-such-tool-abc", "some-package")];
        let err = check_required_tools(tools).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no-such-tool-abc"));
        assert!(msg.contains("some-package"));
        assert!(!msg.contains("coreutils"));
    }
}
