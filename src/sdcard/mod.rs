//! Virtual SD card: a raw disk-image file, optionally attached to a host
//! loopback device, with its partitions mounted by label.
//!
//! Lifecycle: created detached, attached (loop bound), partitions mounted
//! individually, unmounted, detached. Detach is refused while any partition
//! is mounted. At most one loopback is ever bound to the image file; an
//! advisory lock on the image backs that up across processes.

pub mod geometry;

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::board::PartitionTable;
use crate::errors::BuildError;
use crate::process::{Cmd, Runner, SharedRunner};

/// Byte offset of the 32-bit MBR disk identifier in sector 0.
const MBR_DISK_ID_OFFSET: u64 = 440;

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct VirtualSDCard {
    image: PathBuf,
    table: PartitionTable,
    runner: SharedRunner,
    mount_root: PathBuf,
    loopdev: Option<PathBuf>,
    /// Mounted partitions in mount order; unmount_all walks this LIFO.
    mounted: Vec<(String, PathBuf)>,
    image_lock: Option<File>,
    device_wait: Duration,
    unmount_wait: Duration,
}

impl VirtualSDCard {
    pub fn new(image: &Path, table: PartitionTable, runner: SharedRunner) -> Self {
        let mount_root =
            std::env::temp_dir().join(format!("dt-disk-builder-{}", std::process::id()));
        Self {
            image: image.to_path_buf(),
            table,
            runner,
            mount_root,
            loopdev: None,
            mounted: Vec::new(),
            image_lock: None,
            device_wait: Duration::from_secs(10),
            unmount_wait: Duration::from_secs(30),
        }
    }

    /// Shorten the polling bounds; used by tests.
    pub fn with_waits(mut self, device_wait: Duration, unmount_wait: Duration) -> Self {
        self.device_wait = device_wait;
        self.unmount_wait = unmount_wait;
        self
    }

    pub fn with_mount_root(mut self, root: &Path) -> Self {
        self.mount_root = root.to_path_buf();
        self
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    pub fn loopdev(&self) -> Option<&Path> {
        self.loopdev.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.loopdev.is_some()
    }

    /// Loop device currently bound to `image` on this host, if any.
    pub fn find_loopdev(image: &Path, runner: &dyn Runner) -> Result<Option<PathBuf>> {
        let out = Cmd::new(runner, "losetup")
            .arg("-j")
            .arg_path(image)
            .error_msg("losetup -j failed")
            .run()?;
        let line = out.stdout_str();
        if line.is_empty() {
            return Ok(None);
        }
        // Output shape: "/dev/loop3: []: (/path/to/image)"
        let device = line.split(':').next().unwrap_or("").trim();
        if device.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(device)))
    }

    /// Bind the image to a free loopback device with partition scanning.
    ///
    /// Pre-flight checks fail loudly before any destructive operation:
    /// an existing binding for this image, no free loop device, or a host
    /// filesystem label colliding with one the image carries.
    pub fn attach(&mut self) -> Result<()> {
        if self.loopdev.is_some() {
            return Err(BuildError::Config(format!(
                "image '{}' is already attached",
                self.image.display()
            ))
            .into());
        }
        if let Some(existing) = Self::find_loopdev(&self.image, self.runner.as_ref())? {
            return Err(BuildError::Config(format!(
                "image '{}' is already bound to {}",
                self.image.display(),
                existing.display()
            ))
            .into());
        }

        let free = Cmd::new(self.runner.as_ref(), "losetup")
            .arg("-f")
            .allow_fail()
            .run()?;
        if !free.success() || free.stdout_str().is_empty() {
            return Err(BuildError::NoFreeLoop.into());
        }

        for label in self.table.labels() {
            let probe = Cmd::new(self.runner.as_ref(), "blkid")
                .args(["-L", label])
                .allow_fail()
                .run()?;
            if probe.success() {
                return Err(BuildError::LabelConflict(label.to_string()).into());
            }
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.image)
            .with_context(|| format!("opening image '{}'", self.image.display()))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(BuildError::Config(format!(
                "image '{}' is locked by another process",
                self.image.display()
            ))
            .into());
        }
        self.image_lock = Some(lock);

        let out = Cmd::new(self.runner.as_ref(), "losetup")
            .args(["--partscan", "--find", "--show"])
            .arg_path(&self.image)
            .error_msg("losetup failed to attach image")
            .run()?;
        let device = out.stdout_str();
        self.loopdev = Some(PathBuf::from(device.clone()));
        println!("  attached {} -> {}", self.image.display(), device);
        Ok(())
    }

    /// Release the loopback binding. Refused while any partition is mounted.
    pub fn detach(&mut self) -> Result<()> {
        if !self.mounted.is_empty() {
            let still: Vec<&str> = self.mounted.iter().map(|(l, _)| l.as_str()).collect();
            return Err(BuildError::Config(format!(
                "cannot detach while partitions are mounted: {}",
                still.join(", ")
            ))
            .into());
        }
        if let Some(device) = self.loopdev.take() {
            Cmd::new(self.runner.as_ref(), "losetup")
                .arg("--detach")
                .arg_path(&device)
                .error_msg("losetup --detach failed")
                .run()?;
        }
        self.image_lock = None;
        let _ = fs::remove_dir(&self.mount_root);
        Ok(())
    }

    /// Device node for the numbered partition behind `label`.
    pub fn partition_device(&self, label: &str) -> Result<PathBuf> {
        let device = self.loopdev.as_ref().ok_or_else(|| {
            BuildError::Config(format!(
                "image '{}' is not attached",
                self.image.display()
            ))
        })?;
        let number = self
            .table
            .number(label)
            .ok_or_else(|| BuildError::Config(format!("unknown partition label '{label}'")))?;
        Ok(PathBuf::from(format!("{}p{}", device.display(), number)))
    }

    /// Mount the labeled partition at a process-unique mountpoint.
    pub fn mount(&mut self, label: &str) -> Result<PathBuf> {
        let device = self.partition_device(label)?;

        let deadline = Instant::now() + self.device_wait;
        while !device.exists() {
            if Instant::now() >= deadline {
                return Err(BuildError::PartitionMissing {
                    label: label.to_string(),
                    device: device.display().to_string(),
                }
                .into());
            }
            std::thread::sleep(DEVICE_POLL_INTERVAL);
        }

        let mountpoint = self.mount_root.join(label);
        if mountpoint.exists() {
            return Err(BuildError::Config(format!(
                "mountpoint '{}' already exists",
                mountpoint.display()
            ))
            .into());
        }
        fs::create_dir_all(&mountpoint)
            .with_context(|| format!("creating mountpoint '{}'", mountpoint.display()))?;

        Cmd::new(self.runner.as_ref(), "mount")
            .arg_path(&device)
            .arg_path(&mountpoint)
            .error_msg(&format!("mounting partition '{label}' failed"))
            .run()?;
        self.mounted.push((label.to_string(), mountpoint.clone()));
        Ok(mountpoint)
    }

    pub fn mountpoint(&self, label: &str) -> Option<&Path> {
        self.mounted
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| p.as_path())
    }

    pub fn mounted_labels(&self) -> Vec<&str> {
        self.mounted.iter().map(|(l, _)| l.as_str()).collect()
    }

    /// Unmount the labeled partition, waiting for other processes to let go.
    pub fn unmount(&mut self, label: &str) -> Result<()> {
        let index = self
            .mounted
            .iter()
            .position(|(l, _)| l == label)
            .ok_or_else(|| {
                BuildError::Config(format!("partition '{label}' is not mounted"))
            })?;
        let device = self.partition_device(label)?;

        let deadline = Instant::now() + self.unmount_wait;
        loop {
            let holders = Cmd::new(self.runner.as_ref(), "lsof")
                .arg_path(&device)
                .allow_fail()
                .run()?;
            // lsof exits non-zero when nothing holds the device open.
            if !holders.success() {
                break;
            }
            if Instant::now() >= deadline {
                println!(
                    "  warning: '{}' still held open, unmounting anyway",
                    device.display()
                );
                break;
            }
            std::thread::sleep(DEVICE_POLL_INTERVAL);
        }

        // The entry stays in `mounted` until umount actually succeeds, so a
        // busy partition is still reported as mounted and detach stays
        // refused.
        let mountpoint = self.mounted[index].1.clone();
        Cmd::new(self.runner.as_ref(), "umount")
            .arg_path(&mountpoint)
            .error_msg(&format!("unmounting partition '{label}' failed"))
            .run()?;
        self.mounted.remove(index);
        fs::remove_dir(&mountpoint)
            .with_context(|| format!("removing mountpoint '{}'", mountpoint.display()))?;
        Ok(())
    }

    /// Unmount every mounted partition, LIFO; best effort continues past
    /// failures and returns the first error.
    pub fn unmount_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((label, _)) = self.mounted.last().cloned() {
            if let Err(err) = self.unmount(&label) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                // A failed unmount leaves its entry in place; drop it here
                // so cleanup makes progress instead of spinning.
                if self
                    .mounted
                    .last()
                    .map(|(l, _)| l == &label)
                    .unwrap_or(false)
                {
                    self.mounted.pop();
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// MBR disk identifier: the 4 bytes at offset 440 of sector 0, as
    /// `0x`-prefixed little-endian hex.
    pub fn disk_identifier(&self) -> Result<String> {
        let mut file = File::open(&self.image)
            .with_context(|| format!("opening image '{}'", self.image.display()))?;
        file.seek(SeekFrom::Start(MBR_DISK_ID_OFFSET))?;
        let mut bytes = [0u8; 4];
        file.read_exact(&mut bytes)
            .context("reading MBR disk identifier")?;
        Ok(format!("0x{:08x}", u32::from_le_bytes(bytes)))
    }

    pub fn set_disk_identifier(&self, value: &str) -> Result<()> {
        let hex = value
            .strip_prefix("0x")
            .ok_or_else(|| BuildError::Config(format!("bad disk identifier '{value}'")))?;
        let id = u32::from_str_radix(hex, 16)
            .map_err(|_| BuildError::Config(format!("bad disk identifier '{value}'")))?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.image)
            .with_context(|| format!("opening image '{}'", self.image.display()))?;
        file.seek(SeekFrom::Start(MBR_DISK_ID_OFFSET))?;
        file.write_all(&id.to_le_bytes())
            .context("writing MBR disk identifier")?;
        Ok(())
    }

    /// Streaming sha256 of the raw image file.
    pub fn sha256(&self) -> Result<String> {
        crate::artifact::sha256_file(&self.image)
    }

    pub(crate) fn runner(&self) -> &dyn Runner {
        self.runner.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn attach_preassigned(&mut self, device: &Path) {
        self.loopdev = Some(device.to_path_buf());
    }
}
