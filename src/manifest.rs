//! Build manifest: sidecar JSON describing a finished disk image.
//!
//! Ships next to the image so flashing tools can verify integrity and
//! re-run personalization surgery on the raw device without mounting it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::surgery::SurgeryItem;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub disk_image_filename: String,
    /// Hex digest of the raw image, computed after the final unmount.
    pub sha256: String,
    pub distro: String,
    pub surgery_plan: Vec<SurgeryItem>,
}

impl Manifest {
    pub fn new(
        disk_image_filename: impl Into<String>,
        sha256: impl Into<String>,
        distro: impl Into<String>,
        surgery_plan: Vec<SurgeryItem>,
    ) -> Self {
        Manifest {
            schema_version: SCHEMA_VERSION,
            disk_image_filename: disk_image_filename.into(),
            sha256: sha256.into(),
            distro: distro.into(),
            surgery_plan,
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing manifest '{}'", path.display()))?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest '{}'", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("parsing manifest '{}'", path.display()))?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        Manifest::new(
            "dt-base-rpi64-v3.0.0-autobot01.img",
            "deadbeef".repeat(8),
            "ente",
            vec![SurgeryItem {
                partition: "rootfs".into(),
                partition_id: 2,
                mountpoint: "/tmp/mnt/rootfs".into(),
                path: "data/config/robot_name".into(),
                placeholder: "HOSTNAME".into(),
                offset_bytes: Some(1_048_576),
                used_bytes: 9,
                length_bytes: 4096,
            }],
        )
    }

    #[test]
    fn json_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");

        let manifest = sample();
        manifest.write_json(&path).unwrap();
        let decoded = Manifest::read_json(&path).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn plan_entries_keep_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        let entry = &json["surgery_plan"][0];
        for field in [
            "partition",
            "partition_id",
            "mountpoint",
            "path",
            "placeholder",
            "offset_bytes",
            "used_bytes",
            "length_bytes",
        ] {
            assert!(entry.get(field).is_some(), "missing field {field}");
        }
    }
}
