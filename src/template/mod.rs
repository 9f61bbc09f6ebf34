//! Disk template applier.
//!
//! A disk template is a directory tree of the shape
//! `<templates>/<board>/<partition_label>/<path...>`. Applying it copies
//! every file onto the matching mounted partition, runs the validators that
//! claim each path, and pads placeholder files to block-aligned budgets so
//! the surgery pass can later pin them to byte offsets in the raw image.

pub mod validators;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::board::PartitionTable;
use crate::errors::BuildError;
use crate::surgery::{padded_length, SurgeryItem, SIGNATURE};
use validators::{validators_for, ValidatorContext};

pub struct TemplateApplier<'a> {
    /// Board-specific template root, e.g. `<templates>/rpi64`.
    root: PathBuf,
    table: &'a PartitionTable,
    /// Label -> mountpoint of every mounted partition.
    mounts: BTreeMap<String, PathBuf>,
    block_size: u64,
    validator_ctx: ValidatorContext,
}

impl<'a> TemplateApplier<'a> {
    pub fn new(
        root: impl Into<PathBuf>,
        table: &'a PartitionTable,
        mounts: BTreeMap<String, PathBuf>,
        block_size: u64,
        validator_ctx: ValidatorContext,
    ) -> Self {
        TemplateApplier {
            root: root.into(),
            table,
            mounts,
            block_size,
            validator_ctx,
        }
    }

    /// Copies the whole template tree and returns the surgery plan, one
    /// item per placeholder file, offsets still unresolved.
    pub fn apply(&self) -> Result<Vec<SurgeryItem>> {
        let mut items: Vec<SurgeryItem> = Vec::new();

        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("reading template root '{}'", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let label = entry.file_name().to_string_lossy().to_string();
            if !self.table.contains(&label) {
                return Err(BuildError::Config(format!(
                    "template directory '{label}' does not match any partition"
                ))
                .into());
            }
            let mountpoint = self.mounts.get(&label).ok_or_else(|| {
                BuildError::Config(format!("partition '{label}' is not mounted"))
            })?;
            self.apply_partition(&label, &entry.path(), mountpoint, &mut items)?;
        }
        Ok(items)
    }

    fn apply_partition(
        &self,
        label: &str,
        source_root: &Path,
        mountpoint: &Path,
        items: &mut Vec<SurgeryItem>,
    ) -> Result<()> {
        for entry in WalkDir::new(source_root).sort_by_file_name() {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source_root)
                .expect("walkdir yields paths under its root");
            if rel.as_os_str().is_empty() {
                continue;
            }
            let dest = mountpoint.join(rel);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating '{}'", dest.display()))?;
                continue;
            }

            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let content = fs::read(entry.path())
                .with_context(|| format!("reading template '{}'", entry.path().display()))?;

            for validator in validators_for(&rel_str) {
                let text = std::str::from_utf8(&content).map_err(|_| {
                    BuildError::Config(format!("template '{rel_str}' is not valid UTF-8"))
                })?;
                validator(text, &self.validator_ctx)
                    .with_context(|| format!("validating template '{rel_str}'"))?;
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }

            match placeholder_key(&content) {
                Some(key) => {
                    if items.iter().any(|item| item.placeholder == key) {
                        return Err(BuildError::PlaceholderCollision(key).into());
                    }
                    let used = content.len() as u64;
                    let length = padded_length(used, self.block_size);
                    write_padded(&dest, &content, length)?;
                    items.push(SurgeryItem {
                        partition: label.to_string(),
                        partition_id: self
                            .table
                            .number(label)
                            .expect("label checked against the table"),
                        mountpoint: mountpoint.to_string_lossy().to_string(),
                        path: rel_str,
                        placeholder: key,
                        offset_bytes: None,
                        used_bytes: used,
                        length_bytes: length,
                    });
                }
                None => {
                    fs::write(&dest, &content)
                        .with_context(|| format!("writing '{}'", dest.display()))?;
                }
            }
        }
        Ok(())
    }
}

/// Rebuilds the surgery plan from the template tree alone, without touching
/// any mounted partition. Used when a build resumes from a cached image: the
/// apply pass already ran in an earlier invocation, so the padded files are
/// in the image but the in-memory plan is gone. Budgets are recomputed
/// exactly as the applier computed them; offsets stay unresolved and the
/// mountpoint is unknown (the partitions are no longer mounted).
pub fn scan_plan(
    root: &Path,
    table: &PartitionTable,
    block_size: u64,
) -> Result<Vec<SurgeryItem>> {
    let mut items: Vec<SurgeryItem> = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    for entry in fs::read_dir(root)
        .with_context(|| format!("reading template root '{}'", root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let label = entry.file_name().to_string_lossy().to_string();
        if !table.contains(&label) {
            return Err(BuildError::Config(format!(
                "template directory '{label}' does not match any partition"
            ))
            .into());
        }
        labels.push(label);
    }
    labels.sort();

    for label in labels {
        let source_root = root.join(&label);
        for entry in WalkDir::new(&source_root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let content = fs::read(entry.path())
                .with_context(|| format!("reading template '{}'", entry.path().display()))?;
            let Some(key) = placeholder_key(&content) else {
                continue;
            };
            if items.iter().any(|item| item.placeholder == key) {
                return Err(BuildError::PlaceholderCollision(key).into());
            }
            let rel = entry
                .path()
                .strip_prefix(&source_root)
                .expect("walkdir yields paths under its root");
            let used = content.len() as u64;
            items.push(SurgeryItem {
                partition: label.clone(),
                partition_id: table
                    .number(&label)
                    .expect("label checked against the table"),
                mountpoint: String::new(),
                path: rel.to_string_lossy().replace('\\', "/"),
                placeholder: key,
                offset_bytes: None,
                used_bytes: used,
                length_bytes: padded_length(used, block_size),
            });
        }
    }
    Ok(items)
}

/// Returns the placeholder key when the file's first line is a signature
/// line, e.g. `DT_DUCKIETOWN_PLACEHOLDER_HOSTNAME`.
fn placeholder_key(content: &[u8]) -> Option<String> {
    let first_line = content.split(|b| *b == b'\n').next()?;
    let first_line = std::str::from_utf8(first_line).ok()?;
    let key = first_line.strip_prefix(SIGNATURE)?;
    if key.is_empty()
        || !key
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
    {
        return None;
    }
    Some(key.to_string())
}

/// Writes `content` followed by `\n` padding up to exactly `length` bytes,
/// so the file occupies a whole number of filesystem blocks.
fn write_padded(dest: &Path, content: &[u8], length: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .with_context(|| format!("writing '{}'", dest.display()))?;
    file.write_all(content)?;
    let pad = length - content.len() as u64;
    file.write_all(&vec![b'\n'; pad as usize])?;
    Ok(())
}
