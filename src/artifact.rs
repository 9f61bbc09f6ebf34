//! Final artifact handling: checksums, deterministic packaging, push.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;

/// Streaming sha256 of a file, returned as a lowercase hex digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Packages the disk image and its manifest into a deterministic
/// `.tar.zst`: entries at the archive root, sorted by name, mtime zeroed,
/// fixed ownership. Same inputs, byte-identical archive.
pub fn package(files: &[PathBuf], out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<&PathBuf> = files.iter().collect();
    entries.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));

    for path in entries {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => bail!("cannot package '{}': no file name", path.display()),
        };
        let md = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if !md.is_file() {
            bail!("cannot package '{}': not a regular file", path.display());
        }

        let mut f = File::open(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(md.len());
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &mut f)?;
    }

    let encoder = builder
        .into_inner()
        .context("Failed to finish tar archive")?;
    encoder.finish().context("Failed to finish zstd stream")?;
    Ok(())
}

/// Uploads a packaged archive with a single HTTP PUT.
pub fn push(archive: &Path, url: &str) -> Result<()> {
    let agent = crate::assets::http_agent()?;
    let size = std::fs::metadata(archive)?.len();
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    println!("Pushing {} ({} bytes) to {url}", archive.display(), size);
    let response = agent
        .put(url)
        .set("Content-Type", "application/zstd")
        .send(BufReader::new(file))
        .with_context(|| format!("pushing '{}' to {url}", archive.display()))?;
    if response.status() >= 300 {
        bail!("push to {url} failed with HTTP {}", response.status());
    }
    Ok(())
}
