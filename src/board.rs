//! Board profiles.
//!
//! Everything board-specific lives here as data: partition geometry, the base
//! image naming scheme and download key, the target CPU architecture, the
//! module images to pre-seed, and any extra pipeline behavior. Boards are a
//! tagged enum; there is no inheritance to chase.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::BuildError;

/// Supported target boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    RaspberryPi64,
    JetsonNano,
}

impl Board {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "rpi64" | "raspberry-pi-64" => Ok(Board::RaspberryPi64),
            "jetson-nano" => Ok(Board::JetsonNano),
            other => Err(BuildError::Config(format!("unknown board '{other}'")).into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Board::RaspberryPi64 => "rpi64",
            Board::JetsonNano => "jetson-nano",
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered mapping from partition label to partition number (1..N).
///
/// Labels are unique, numbers are a contiguous prefix of positive integers,
/// and the distinguished root partition is the last one so `resize` can grow
/// it to 100% of the device.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    entries: Vec<(String, u32)>,
    root_label: String,
}

impl PartitionTable {
    pub fn new(entries: &[(&str, u32)], root_label: &str) -> Result<Self> {
        let mut seen = BTreeMap::new();
        for (label, number) in entries {
            if seen.insert(label.to_string(), *number).is_some() {
                return Err(
                    BuildError::Config(format!("duplicate partition label '{label}'")).into(),
                );
            }
        }
        let mut numbers: Vec<u32> = entries.iter().map(|(_, n)| *n).collect();
        numbers.sort_unstable();
        for (i, number) in numbers.iter().enumerate() {
            if *number != (i as u32) + 1 {
                return Err(BuildError::Config(format!(
                    "partition numbers must be 1..{} without gaps",
                    entries.len()
                ))
                .into());
            }
        }
        if !seen.contains_key(root_label) {
            return Err(
                BuildError::Config(format!("root partition '{root_label}' not in table")).into(),
            );
        }
        let last = entries
            .iter()
            .max_by_key(|(_, n)| *n)
            .map(|(l, _)| l.to_string())
            .unwrap_or_default();
        if last != root_label {
            return Err(BuildError::Config(format!(
                "root partition '{root_label}' must be the last partition"
            ))
            .into());
        }
        Ok(Self {
            entries: entries
                .iter()
                .map(|(l, n)| (l.to_string(), *n))
                .collect(),
            root_label: root_label.to_string(),
        })
    }

    pub fn number(&self, label: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, n)| *n)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.number(label).is_some()
    }

    /// Labels in partition-number order.
    pub fn labels(&self) -> Vec<&str> {
        let mut ordered: Vec<&(String, u32)> = self.entries.iter().collect();
        ordered.sort_by_key(|(_, n)| *n);
        ordered.iter().map(|(l, _)| l.as_str()).collect()
    }

    pub fn root_label(&self) -> &str {
        &self.root_label
    }

    pub fn root_number(&self) -> u32 {
        self.number(&self.root_label).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A container image to pre-seed into the target's engine storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImageRef {
    pub registry: String,
    pub owner: String,
    pub name: String,
    pub tag: String,
}

impl ModuleImageRef {
    pub fn new(registry: &str, owner: &str, name: &str, tag: &str) -> Self {
        Self {
            registry: registry.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Fully-qualified reference used for `docker pull`.
    pub fn reference(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.owner, self.name, self.tag)
    }

    /// Repository without registry or tag.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Strings an autoboot stack entry may legally resolve to: the
    /// registry-qualified and bare tagged forms, plus the repository alone.
    pub fn candidates(&self) -> Vec<String> {
        vec![
            self.reference(),
            format!("{}:{}", self.repository(), self.tag),
            self.repository(),
        ]
    }
}

/// Extra partition appended by the `partition` step.
#[derive(Debug, Clone)]
pub struct ExtraPartition {
    pub label: String,
    pub fs_type: String,
}

/// Board-specific extra pipeline behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraStep {
    /// Repair a GPT whose secondary header was truncated by image trimming.
    GptFix,
}

/// The full bundle of board constants the pipeline is parameterized by.
#[derive(Debug, Clone)]
pub struct BoardProfile {
    pub board: Board,
    pub table: PartitionTable,
    /// Filesystem block size of the root partition; placeholder budgets are
    /// multiples of this.
    pub root_block_size: u64,
    /// Base archive family, combined as `<family>-<board>-v<version>.zip`.
    pub base_family: String,
    pub base_version: String,
    /// Object-store key prefix the archive is downloaded from.
    pub download_base: String,
    /// Docker platform architecture, with accepted aliases for substitution.
    pub arch: String,
    pub arch_aliases: Vec<String>,
    /// Emulator binary for the foreign-arch chroot.
    pub qemu_binary: String,
    /// Packages installed during the `upgrade` step.
    pub packages: Vec<String>,
    pub modules: Vec<ModuleImageRef>,
    /// Template directory name under the templates root.
    pub template_dir: String,
    pub extra_partition: Option<ExtraPartition>,
    pub extra_steps: Vec<ExtraStep>,
}

impl BoardProfile {
    pub fn for_board(board: Board) -> Result<Self> {
        match board {
            Board::RaspberryPi64 => Ok(Self {
                board,
                table: PartitionTable::new(&[("bootfs", 1), ("rootfs", 2)], "rootfs")?,
                root_block_size: 4096,
                base_family: "dt-base".to_string(),
                base_version: "3.0.0".to_string(),
                download_base: "https://duckietown-public-storage.s3.amazonaws.com/disk_image"
                    .to_string(),
                arch: "arm64v8".to_string(),
                arch_aliases: vec!["arm64v8".to_string(), "aarch64".to_string()],
                qemu_binary: "qemu-aarch64-static".to_string(),
                packages: vec![
                    "rsync".to_string(),
                    "network-manager".to_string(),
                    "avahi-daemon".to_string(),
                ],
                modules: vec![
                    ModuleImageRef::new("docker.io", "duckietown", "dt-device-health", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "duckietown", "dt-files-api", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "duckietown", "dt-code-api", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "portainer", "portainer-ce", "linux-arm64"),
                ],
                template_dir: "rpi64".to_string(),
                extra_partition: None,
                extra_steps: vec![],
            }),
            Board::JetsonNano => Ok(Self {
                board,
                table: PartitionTable::new(&[("bootfs", 1), ("APP", 2)], "APP")?,
                root_block_size: 4096,
                base_family: "dt-base".to_string(),
                base_version: "3.0.0".to_string(),
                download_base: "https://duckietown-public-storage.s3.amazonaws.com/disk_image"
                    .to_string(),
                arch: "arm64v8".to_string(),
                arch_aliases: vec!["arm64v8".to_string(), "aarch64".to_string()],
                qemu_binary: "qemu-aarch64-static".to_string(),
                packages: vec![
                    "rsync".to_string(),
                    "network-manager".to_string(),
                    "avahi-daemon".to_string(),
                ],
                modules: vec![
                    ModuleImageRef::new("docker.io", "duckietown", "dt-device-health", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "duckietown", "dt-files-api", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "duckietown", "dt-code-api", "ente-arm64v8"),
                    ModuleImageRef::new("docker.io", "portainer", "portainer-ce", "linux-arm64"),
                ],
                template_dir: "jetson-nano".to_string(),
                extra_partition: None,
                extra_steps: vec![ExtraStep::GptFix],
            }),
        }
    }

    /// Archive stem per the base naming scheme.
    pub fn base_stem(&self) -> String {
        format!("{}-{}-v{}", self.base_family, self.board, self.base_version)
    }

    pub fn base_archive_name(&self) -> String {
        format!("{}.zip", self.base_stem())
    }

    pub fn download_url(&self) -> String {
        format!("{}/{}", self.download_base, self.base_archive_name())
    }
}
