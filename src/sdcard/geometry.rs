//! Partition geometry adjustments on an attached card.
//!
//! Resizing moves the root partition's end to 100% of the device, checks the
//! filesystem, and grows it. Tools like parted regenerate the MBR disk
//! identifier as a side effect, so it is read before and restored after.

use anyhow::Result;

use crate::board::{ExtraPartition, ExtraStep};
use crate::errors::BuildError;
use crate::process::Cmd;
use crate::sdcard::VirtualSDCard;

/// Grow the root partition and its filesystem to the full device.
pub fn resize_root(card: &VirtualSDCard, extra_steps: &[ExtraStep]) -> Result<()> {
    let loopdev = card
        .loopdev()
        .ok_or_else(|| BuildError::Config("resize requires an attached image".into()))?
        .to_path_buf();
    let root_number = card.table().root_number();
    let root_device = card.partition_device(card.table().root_label())?;

    if extra_steps.contains(&ExtraStep::GptFix) {
        // Trimmed images leave the secondary GPT header mid-disk; move it
        // back to the end before parted touches the table.
        Cmd::new(card.runner(), "sgdisk")
            .arg("--move-second-header")
            .arg_path(&loopdev)
            .error_msg("sgdisk --move-second-header failed")
            .run()?;
    }

    let disk_id = card.disk_identifier()?;

    Cmd::new(card.runner(), "parted")
        .args(["-s"])
        .arg_path(&loopdev)
        .args(["resizepart", &root_number.to_string(), "100%"])
        .error_msg("parted resizepart failed")
        .run()?;

    card.set_disk_identifier(&disk_id)?;

    Cmd::new(card.runner(), "e2fsck")
        .args(["-fy"])
        .arg_path(&root_device)
        .error_msg("e2fsck failed on root partition")
        .run()?;
    Cmd::new(card.runner(), "resize2fs")
        .arg_path(&root_device)
        .error_msg("resize2fs failed on root partition")
        .run()?;

    println!("  root partition grown to 100% of device");
    Ok(())
}

/// Append a primary partition in the remaining free space, format it with
/// the requested filesystem and label, and force a kernel table re-read.
pub fn create_extra_partition(card: &VirtualSDCard, extra: &ExtraPartition) -> Result<()> {
    let loopdev = card
        .loopdev()
        .ok_or_else(|| BuildError::Config("partitioning requires an attached image".into()))?
        .to_path_buf();
    let number = (card.table().len() as u32) + 1;
    let device = format!("{}p{}", loopdev.display(), number);

    Cmd::new(card.runner(), "parted")
        .args(["-s"])
        .arg_path(&loopdev)
        .args(["mkpart", "primary", &extra.fs_type, "0%", "100%"])
        .error_msg("parted mkpart failed")
        .run()?;

    Cmd::new(card.runner(), "partprobe")
        .arg_path(&loopdev)
        .error_msg("partprobe failed")
        .run()?;

    Cmd::new(card.runner(), &format!("mkfs.{}", extra.fs_type))
        .args(["-L", &extra.label])
        .arg(&device)
        .error_msg(&format!("mkfs.{} failed", extra.fs_type))
        .run()?;

    println!("  created extra partition '{}' ({})", extra.label, extra.fs_type);
    Ok(())
}
