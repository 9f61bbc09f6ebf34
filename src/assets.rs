//! Base image acquisition.
//!
//! Downloads the board's base archive into a local cache and extracts the
//! raw disk image into the work directory. Interruptions never leave a
//! partial archive or a partial image behind.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::board::BoardProfile;
use crate::interrupt::check_interrupted;

const COPY_CHUNK: usize = 1024 * 1024;

/// Default archive cache: `<user cache dir>/dt-disk-builder`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dt-disk-builder")
}

/// Build the HTTP agent, honoring a proxy from the environment.
pub(crate) fn http_agent() -> Result<ureq::Agent> {
    let mut builder = ureq::AgentBuilder::new();
    for key in ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"] {
        if let Ok(uri) = std::env::var(key) {
            if !uri.is_empty() {
                let proxy = ureq::Proxy::new(&uri)
                    .with_context(|| format!("invalid proxy URI in ${key}"))?;
                builder = builder.proxy(proxy);
                break;
            }
        }
    }
    Ok(builder.build())
}

/// Fetch the base archive for the board, reusing the cached copy when
/// `allow_cache` is set and the file already exists.
pub fn fetch_base(profile: &BoardProfile, cache_dir: &Path, allow_cache: bool) -> Result<PathBuf> {
    fs::create_dir_all(cache_dir)
        .with_context(|| format!("creating cache directory '{}'", cache_dir.display()))?;
    let archive = cache_dir.join(profile.base_archive_name());

    if archive.exists() {
        if allow_cache {
            println!("  using cached archive {}", archive.display());
            return Ok(archive);
        }
        fs::remove_file(&archive)
            .with_context(|| format!("removing stale archive '{}'", archive.display()))?;
    }

    let url = profile.download_url();
    println!("  downloading {url}");
    let partial = archive.with_extension("zip.part");

    let result = download_to(&url, &partial);
    if result.is_err() {
        let _ = fs::remove_file(&partial);
        return result.map(|_| archive);
    }

    fs::rename(&partial, &archive).with_context(|| {
        format!(
            "moving downloaded archive into place at '{}'",
            archive.display()
        )
    })?;
    Ok(archive)
}

fn download_to(url: &str, dest: &Path) -> Result<()> {
    let agent = http_agent()?;
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("downloading '{url}'"))?;
    let mut reader = response.into_reader();
    let mut out =
        File::create(dest).with_context(|| format!("creating '{}'", dest.display()))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        check_interrupted()?;
        let n = reader.read(&mut buf).context("reading download stream")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("writing download chunk")?;
    }
    Ok(())
}

/// Extract the single raw image out of the base archive into `workdir`.
///
/// Skipped when the image is already there. The archive must contain exactly
/// one `.img` member whose stem matches the profile's base naming scheme.
pub fn extract(profile: &BoardProfile, archive: &Path, workdir: &Path) -> Result<PathBuf> {
    let image_name = format!("{}.img", profile.base_stem());
    let image_path = workdir.join(&image_name);
    if image_path.exists() {
        println!("  image already extracted at {}", image_path.display());
        return Ok(image_path);
    }
    fs::create_dir_all(workdir)
        .with_context(|| format!("creating work directory '{}'", workdir.display()))?;

    let file =
        File::open(archive).with_context(|| format!("opening archive '{}'", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("reading archive '{}'", archive.display()))?;

    let member_index = find_image_member(&mut zip)?;
    let mut member = zip.by_index(member_index)?;
    let member_name = member.name().to_string();
    let stem = Path::new(&member_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if stem != profile.base_stem() {
        bail!(
            "archive member '{}' does not match expected base image '{}'",
            member_name,
            profile.base_stem()
        );
    }

    let partial = image_path.with_extension("img.part");
    let result = (|| -> Result<()> {
        let mut out = File::create(&partial)
            .with_context(|| format!("creating '{}'", partial.display()))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            check_interrupted()?;
            let n = member.read(&mut buf).context("reading archive member")?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).context("writing image chunk")?;
        }
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    fs::rename(&partial, &image_path)
        .with_context(|| format!("moving image into place at '{}'", image_path.display()))?;
    Ok(image_path)
}

fn find_image_member(zip: &mut zip::ZipArchive<File>) -> Result<usize> {
    let mut found = None;
    for index in 0..zip.len() {
        let member = zip.by_index(index)?;
        if member.is_dir() {
            continue;
        }
        if member.name().ends_with(".img") {
            if found.is_some() {
                bail!("archive contains more than one .img member");
            }
            found = Some(index);
        }
    }
    found.context("archive contains no .img member")
}
