//! Placeholder surgery: locate, plan, write.
//!
//! Template files carrying a signature line are padded to block-aligned
//! budgets by the applier while the partition is mounted. After unmount the
//! raw image is scanned for the signatures, each key is pinned to a unique
//! byte offset, and the rendered personalization payload is written in place
//! with positioned writes. A flashed card can later be re-personalized by
//! seeking to the same offsets on the raw device, no filesystem needed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::BuildError;

/// Signature prefix every placeholder first line starts with.
pub const SIGNATURE: &str = "DT_DUCKIETOWN_PLACEHOLDER_";

/// Longest accepted placeholder key.
const MAX_KEY_LEN: usize = 64;

const SCAN_CHUNK: usize = 1024 * 1024;

/// One placeholder region in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgeryItem {
    pub partition: String,
    pub partition_id: u32,
    pub mountpoint: String,
    /// Path of the template file relative to its partition root.
    pub path: String,
    pub placeholder: String,
    /// Absolute byte offset in the raw image; set by the locate phase.
    #[serde(default)]
    pub offset_bytes: Option<u64>,
    pub used_bytes: u64,
    pub length_bytes: u64,
}

/// Smallest whole number of blocks that holds `used` bytes (at least one).
pub fn padded_length(used: u64, block_size: u64) -> u64 {
    let blocks = used.div_ceil(block_size).max(1);
    blocks * block_size
}

/// Minimal `{name}` template substitution over an enumerated field set.
///
/// `{{` and `}}` escape literal braces. A field name not present in the
/// context is a configuration error, caught at render time.
pub fn render_template(template: &str, fields: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if i + 1 < bytes.len() && bytes[i + 1] == b'{' => {
                out.push('{');
                i += 2;
            }
            b'}' if i + 1 < bytes.len() && bytes[i + 1] == b'}' => {
                out.push('}');
                i += 2;
            }
            b'{' => {
                let close = template[i + 1..].find('}').map(|p| i + 1 + p);
                let close = close.ok_or_else(|| {
                    BuildError::Config("unterminated '{' in placeholder template".into())
                })?;
                let name = &template[i + 1..close];
                let value = fields.get(name).ok_or_else(|| {
                    BuildError::Config(format!("unknown template field '{name}'"))
                })?;
                out.push_str(value);
                i = close + 1;
            }
            _ => {
                let ch = template[i..].chars().next().unwrap_or('\u{fffd}');
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Ok(out)
}

fn is_key_byte(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'_'
}

/// Phase 1: scan the raw image for every signature occurrence.
///
/// Reads in chunks, carrying enough tail bytes that a signature+key pair
/// spanning a chunk boundary is still seen whole; each match is recorded at
/// the absolute offset of the signature's first byte. A key found at two
/// offsets is a collision.
pub fn locate_placeholders(image: &Path) -> Result<BTreeMap<String, u64>> {
    let mut file =
        File::open(image).with_context(|| format!("opening image '{}'", image.display()))?;
    let signature = SIGNATURE.as_bytes();
    let overlap = signature.len() + MAX_KEY_LEN;

    // offset -> key; inserting the same offset twice is idempotent, so the
    // overlap region never double-counts a match.
    let mut matches: BTreeMap<u64, String> = BTreeMap::new();

    let mut buf = vec![0u8; SCAN_CHUNK + overlap];
    let mut carry = 0usize;
    let mut base: u64 = 0; // absolute offset of buf[0]
    loop {
        let n = file
            .read(&mut buf[carry..])
            .context("reading image during placeholder scan")?;
        let filled = carry + n;
        if filled < signature.len() {
            break;
        }

        let mut pos = 0usize;
        while pos + signature.len() <= filled {
            if &buf[pos..pos + signature.len()] == signature {
                let key_start = pos + signature.len();
                let mut key_end = key_start;
                while key_end < filled
                    && key_end - key_start < MAX_KEY_LEN
                    && is_key_byte(buf[key_end])
                {
                    key_end += 1;
                }
                // A key truncated by the read window will be re-seen whole
                // through the carry on the next pass.
                let truncated = key_end == filled && n != 0;
                if !truncated && key_end > key_start {
                    let key = String::from_utf8_lossy(&buf[key_start..key_end]).to_string();
                    matches.insert(base + pos as u64, key);
                }
                pos += 1;
            } else {
                pos += 1;
            }
        }

        if n == 0 {
            break;
        }

        // Carry the tail so boundary-spanning matches are seen next pass.
        let keep = overlap.min(filled);
        let tail_start = filled - keep;
        buf.copy_within(tail_start..filled, 0);
        base += tail_start as u64;
        carry = keep;
    }

    let mut by_key: BTreeMap<String, u64> = BTreeMap::new();
    for (offset, key) in matches {
        if by_key.insert(key.clone(), offset).is_some() {
            return Err(BuildError::PlaceholderCollision(key).into());
        }
    }
    Ok(by_key)
}

/// Phase 2: pin every item's key to its unique offset.
pub fn resolve_plan(items: &mut [SurgeryItem], found: &BTreeMap<String, u64>) -> Result<()> {
    for item in items.iter_mut() {
        let offset = found
            .get(&item.placeholder)
            .ok_or_else(|| BuildError::PlaceholderMissing(item.placeholder.clone()))?;
        item.offset_bytes = Some(*offset);
    }
    Ok(())
}

/// Phase 3: render each payload and overwrite its region in place.
///
/// The payload template is the template file's body after the signature
/// line; the rendered bytes plus `\n` padding fill exactly `length_bytes`
/// starting at `offset_bytes`, written positioned with no truncation.
pub fn write_surgery(
    image: &Path,
    items: &mut [SurgeryItem],
    templates_root: &Path,
    fields: &BTreeMap<String, String>,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(image)
        .with_context(|| format!("opening image '{}' for surgery", image.display()))?;

    for item in items.iter_mut() {
        let offset = item.offset_bytes.ok_or_else(|| {
            BuildError::Config(format!(
                "placeholder '{}' has no resolved offset",
                item.placeholder
            ))
        })?;

        let source = templates_root.join(&item.partition).join(&item.path);
        let content = std::fs::read_to_string(&source)
            .with_context(|| format!("reading template source '{}'", source.display()))?;
        let body = match content.split_once('\n') {
            Some((_signature_line, body)) => body,
            None => "",
        };

        let rendered = render_template(body, fields)?;
        let used = rendered.len() as u64;
        if used > item.length_bytes {
            return Err(BuildError::PlaceholderOverflow {
                key: item.placeholder.clone(),
                overflow_bytes: used - item.length_bytes,
            }
            .into());
        }

        let mut region = Vec::with_capacity(item.length_bytes as usize);
        region.extend_from_slice(rendered.as_bytes());
        region.resize(item.length_bytes as usize, b'\n');

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&region).with_context(|| {
            format!(
                "writing placeholder '{}' at offset {offset}",
                item.placeholder
            )
        })?;
        item.used_bytes = used;
        println!(
            "  surgery: {} -> {} bytes at offset {} (budget {})",
            item.placeholder, used, offset, item.length_bytes
        );
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn context() -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("hostname".to_string(), "autobot01".to_string());
        fields.insert("token".to_string(), "dt1-abc".to_string());
        fields
    }

    #[test]
    fn padded_length_rounds_up_to_blocks() {
        assert_eq!(padded_length(0, 4096), 4096);
        assert_eq!(padded_length(1, 4096), 4096);
        assert_eq!(padded_length(4096, 4096), 4096);
        assert_eq!(padded_length(4097, 4096), 8192);
    }

    #[test]
    fn render_substitutes_known_fields() {
        let out = render_template("host={hostname} token={token}", &context()).unwrap();
        assert_eq!(out, "host=autobot01 token=dt1-abc");
    }

    #[test]
    fn render_rejects_unknown_field() {
        let err = render_template("{nope}", &context()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Config(_))
        ));
    }

    #[test]
    fn render_escapes_literal_braces() {
        let out = render_template("{{\"k\": \"{hostname}\"}}", &context()).unwrap();
        assert_eq!(out, "{\"k\": \"autobot01\"}");
    }

    fn image_with(tmp: &TempDir, chunks: &[(&str, u64)], size: u64) -> std::path::PathBuf {
        let path = tmp.path().join("disk.img");
        let mut bytes = vec![0u8; size as usize];
        for (text, offset) in chunks {
            bytes[*offset as usize..*offset as usize + text.len()]
                .copy_from_slice(text.as_bytes());
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn locate_finds_keys_at_absolute_offsets() {
        let tmp = TempDir::new().unwrap();
        let hostname = format!("{SIGNATURE}HOSTNAME\n");
        let token = format!("{SIGNATURE}TOKEN\n");
        let image = image_with(&tmp, &[(&hostname, 8192), (&token, 20480)], 65536);

        let found = locate_placeholders(&image).unwrap();
        assert_eq!(found.get("HOSTNAME"), Some(&8192));
        assert_eq!(found.get("TOKEN"), Some(&20480));
    }

    #[test]
    fn locate_finds_match_spanning_chunk_boundary() {
        let tmp = TempDir::new().unwrap();
        let line = format!("{SIGNATURE}BOUNDARY\n");
        // Start the signature a few bytes before the chunk boundary.
        let offset = (SCAN_CHUNK as u64) - 10;
        let image = image_with(&tmp, &[(&line, offset)], SCAN_CHUNK as u64 + 8192);

        let found = locate_placeholders(&image).unwrap();
        assert_eq!(found.get("BOUNDARY"), Some(&offset));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn locate_rejects_duplicate_key() {
        let tmp = TempDir::new().unwrap();
        let line = format!("{SIGNATURE}TOKEN\n");
        let image = image_with(&tmp, &[(&line, 4096), (&line, 12288)], 32768);

        let err = locate_placeholders(&image).unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::PlaceholderCollision(key)) => assert_eq!(key, "TOKEN"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolve_fails_on_missing_key() {
        let mut items = vec![item("HOSTNAME", 512)];
        let err = resolve_plan(&mut items, &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::PlaceholderMissing(_))
        ));
    }

    fn item(key: &str, length: u64) -> SurgeryItem {
        SurgeryItem {
            partition: "rootfs".into(),
            partition_id: 2,
            mountpoint: "/tmp/mnt/rootfs".into(),
            path: format!("data/{}.txt", key.to_lowercase()),
            placeholder: key.into(),
            offset_bytes: None,
            used_bytes: 0,
            length_bytes: length,
        }
    }

    #[test]
    fn write_round_trip_payload_then_newline_padding() {
        let tmp = TempDir::new().unwrap();
        let line = format!("{SIGNATURE}HOSTNAME\n");
        let image = image_with(&tmp, &[(&line, 4096)], 16384);

        // Template source tree: first line signature, body is the payload
        // template.
        let source_dir = tmp.path().join("templates/rootfs/data");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(
            source_dir.join("hostname.txt"),
            format!("{SIGNATURE}HOSTNAME\n{{hostname}}"),
        )
        .unwrap();

        let mut items = vec![item("HOSTNAME", 512)];
        let found = locate_placeholders(&image).unwrap();
        resolve_plan(&mut items, &found).unwrap();
        write_surgery(&image, &mut items, &tmp.path().join("templates"), &context()).unwrap();

        assert_eq!(items[0].used_bytes, "autobot01".len() as u64);
        assert_eq!(items[0].offset_bytes, Some(4096));

        let bytes = fs::read(&image).unwrap();
        let region = &bytes[4096..4096 + 512];
        assert_eq!(&region[..9], b"autobot01");
        assert!(region[9..].iter().all(|b| *b == b'\n'));
        // Image size untouched: positioned writes, no truncation.
        assert_eq!(bytes.len(), 16384);
    }

    #[test]
    fn write_reports_overflow_in_bytes() {
        let tmp = TempDir::new().unwrap();
        let line = format!("{SIGNATURE}HOST\n");
        let image = image_with(&tmp, &[(&line, 1024)], 8192);

        let source_dir = tmp.path().join("templates/rootfs/data");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(
            source_dir.join("host.txt"),
            format!("{SIGNATURE}HOST\n{{hostname}}"),
        )
        .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(
            "hostname".to_string(),
            "a-very-long-robot-hostname-exceeding!".to_string(), // 37 bytes
        );

        let mut items = vec![SurgeryItem {
            partition: "rootfs".into(),
            partition_id: 2,
            mountpoint: String::new(),
            path: "data/host.txt".into(),
            placeholder: "HOST".into(),
            offset_bytes: Some(1024),
            used_bytes: 0,
            length_bytes: 32,
        }];
        let err =
            write_surgery(&image, &mut items, &tmp.path().join("templates"), &fields).unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::PlaceholderOverflow { key, overflow_bytes }) => {
                assert_eq!(key, "HOST");
                assert_eq!(*overflow_bytes, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn surgery_item_json_round_trip() {
        let mut original = item("TOKEN", 4096);
        original.offset_bytes = Some(12345);
        original.used_bytes = 7;
        let json = serde_json::to_string(&original).unwrap();
        let decoded: SurgeryItem = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }
}
