//! Individual pipeline steps.
//!
//! Every step takes the immutable build environment and the mutable build
//! state, and returns the context facts it established. Resources with
//! teardown obligations (the virtual card) live in [`BuildState`] so the
//! driver's cleanup stack can reach them when a later step fails.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact;
use crate::assets;
use crate::board::BoardProfile;
use crate::chroot::ChrootExecutor;
use crate::config::RobotConfig;
use crate::errors::BuildError;
use crate::manifest::Manifest;
use crate::pipeline::context::ContextDelta;
use crate::pipeline::{cache_image_path, Cleanup, Step};
use crate::preflight;
use crate::process::SharedRunner;
use crate::sdcard::{geometry, VirtualSDCard};
use crate::seeder::EnginePreseeder;
use crate::surgery::{self, SurgeryItem};
use crate::template::validators::ValidatorContext;
use crate::template::{self, TemplateApplier};

/// Immutable inputs shared by all steps.
pub struct StepEnv {
    pub profile: BoardProfile,
    pub config: RobotConfig,
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub allow_cache: bool,
    pub cache_target: Option<Step>,
    pub push: bool,
    pub runner: SharedRunner,
}

impl StepEnv {
    fn board_templates(&self) -> PathBuf {
        self.templates_dir.join(&self.profile.template_dir)
    }

    /// `<family>-<board>-v<version>-<hostname>`, the stem of every output
    /// artifact.
    fn artifact_stem(&self) -> String {
        format!("{}-{}", self.profile.base_stem(), self.config.hostname)
    }
}

/// Mutable state threaded through the steps.
#[derive(Default)]
pub struct BuildState {
    pub base_archive: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub card: Option<VirtualSDCard>,
    pub surgery_items: Vec<SurgeryItem>,
    pub archive: Option<PathBuf>,
}

impl BuildState {
    fn image(&self) -> Result<&Path> {
        self.image.as_deref().ok_or_else(|| {
            BuildError::Config("no disk image; the create step has not run".into()).into()
        })
    }

    fn card_mut(&mut self) -> Result<&mut VirtualSDCard> {
        self.card.as_mut().ok_or_else(|| {
            BuildError::Config("no attached card; the mount step has not run".into()).into()
        })
    }

    fn card(&self) -> Result<&VirtualSDCard> {
        self.card.as_ref().ok_or_else(|| {
            BuildError::Config("no attached card; the mount step has not run".into()).into()
        })
    }

    fn root_mount(&self, env: &StepEnv) -> Result<PathBuf> {
        let root_label = env.profile.table.root_label();
        self.card()?
            .mountpoint(root_label)
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                BuildError::Config(format!("root partition '{root_label}' is not mounted"))
                    .into()
            })
    }
}

pub fn run_step(
    step: Step,
    env: &StepEnv,
    state: &mut BuildState,
    cleanups: &mut Vec<Cleanup>,
) -> Result<Vec<ContextDelta>> {
    match step {
        Step::License => license(env),
        Step::Download => download(env, state),
        Step::Create => create(env, state),
        Step::Mount => mount(env, state, cleanups),
        Step::Resize => resize(env, state),
        Step::Partition => partition(env, state),
        Step::Upgrade => upgrade(env, state),
        Step::Docker => docker(env, state),
        Step::Setup => setup(env, state),
        Step::Finalize => finalize(env, state),
        Step::Unmount => unmount(state, cleanups),
        Step::Compress => compress(env, state),
        Step::Push => push(env, state),
    }
}

/// The base image ships third-party licensed software. Building requires an
/// explicit, recorded acceptance.
fn license(env: &StepEnv) -> Result<Vec<ContextDelta>> {
    if !env.config.accept_license {
        return Err(BuildError::Config(
            "the base image contains software under third-party licenses; \
             re-run with --accept-license (or set accept_license = true) to accept them"
                .into(),
        )
        .into());
    }
    println!("  license terms accepted");
    Ok(vec![ContextDelta::new("license_accepted", "true")])
}

fn download(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let archive = assets::fetch_base(&env.profile, &env.cache_dir, env.allow_cache)?;
    let delta = ContextDelta::new("base_archive", archive.to_string_lossy());
    state.base_archive = Some(archive);
    Ok(vec![delta])
}

fn create(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let image = match env.cache_target {
        Some(target) => {
            let cache = cache_image_path(&env.workdir, &env.profile, target);
            if !cache.is_file() {
                return Err(BuildError::Config(format!(
                    "no cached image for step '{target}' at {} (record one with --cache-record)",
                    cache.display()
                ))
                .into());
            }
            let image = env.workdir.join(format!("{}.img", env.profile.base_stem()));
            println!("  restoring cached image from {}", cache.display());
            std::fs::copy(&cache, &image)
                .with_context(|| format!("restoring cached image '{}'", cache.display()))?;
            image
        }
        None => {
            let archive = match state.base_archive.clone() {
                Some(archive) => archive,
                None => {
                    // The download step was deselected; fall back to a
                    // previously cached archive.
                    let cached = env.cache_dir.join(env.profile.base_archive_name());
                    if !cached.is_file() {
                        return Err(BuildError::Config(format!(
                            "base archive not found at {}; run the download step first",
                            cached.display()
                        ))
                        .into());
                    }
                    cached
                }
            };
            assets::extract(&env.profile, &archive, &env.workdir)?
        }
    };
    let delta = ContextDelta::new("image", image.to_string_lossy());
    state.image = Some(image);
    Ok(vec![delta])
}

fn mount(
    env: &StepEnv,
    state: &mut BuildState,
    cleanups: &mut Vec<Cleanup>,
) -> Result<Vec<ContextDelta>> {
    preflight::check_host(&env.profile.qemu_binary)?;
    attach_and_mount(env, state, cleanups)
}

fn attach_and_mount(
    env: &StepEnv,
    state: &mut BuildState,
    cleanups: &mut Vec<Cleanup>,
) -> Result<Vec<ContextDelta>> {
    let image = state.image()?.to_path_buf();
    let mut card = VirtualSDCard::new(&image, env.profile.table.clone(), env.runner.clone())
        .with_mount_root(&env.workdir.join("mnt"));
    card.attach()?;
    let loopdev = card
        .loopdev()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();

    // The card goes into the build state before anything is mounted, so a
    // mid-loop failure still leaves the cleanup stack a handle to drain.
    state.card = Some(card);
    cleanups.push(Cleanup::DetachLoop);
    cleanups.push(Cleanup::UnmountAll);

    let labels: Vec<String> = env
        .profile
        .table
        .labels()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let card = state.card_mut()?;
    for label in labels {
        let mountpoint = card.mount(&label)?;
        println!("  mounted '{label}' at {}", mountpoint.display());
    }
    Ok(vec![ContextDelta::new("loopdev", loopdev)])
}

fn resize(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let card = state.card()?;
    geometry::resize_root(card, &env.profile.extra_steps)?;
    Ok(vec![ContextDelta::new("root_resized", "true")])
}

fn partition(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let Some(extra) = env.profile.extra_partition.as_ref() else {
        println!("  no extra partition declared for this board");
        return Ok(vec![]);
    };
    let card = state.card()?;
    geometry::create_extra_partition(card, extra)?;
    Ok(vec![ContextDelta::new("extra_partition", extra.label.clone())])
}

fn upgrade(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let root = state.root_mount(env)?;
    let mut chroot = ChrootExecutor::new(&root, &env.profile.qemu_binary, env.runner.clone());
    chroot.setup()?;
    chroot.upgrade_and_install(&env.profile.packages)?;
    chroot.teardown();
    Ok(vec![ContextDelta::new(
        "packages_installed",
        env.profile.packages.join(","),
    )])
}

fn docker(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let root = state.root_mount(env)?;
    let data_root = root.join("var/lib/docker");
    std::fs::create_dir_all(&data_root)
        .with_context(|| format!("creating '{}'", data_root.display()))?;

    let mut seeder = EnginePreseeder::new(env.runner.clone());
    seeder.seed(&data_root, &env.profile.modules, &env.profile.arch)?;

    let seeded: Vec<String> = env.profile.modules.iter().map(|m| m.reference()).collect();
    Ok(vec![ContextDelta::new("modules_seeded", seeded.join(","))])
}

fn setup(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let card = state.card()?;
    let mut mounts: BTreeMap<String, PathBuf> = BTreeMap::new();
    for label in env.profile.table.labels() {
        if let Some(mountpoint) = card.mountpoint(label) {
            mounts.insert(label.to_string(), mountpoint.to_path_buf());
        }
    }

    let validator_ctx = ValidatorContext {
        modules: env.profile.modules.clone(),
        arch_aliases: env.profile.arch_aliases.clone(),
        registry: env.config.registry.clone(),
    };
    let applier = TemplateApplier::new(
        env.board_templates(),
        &env.profile.table,
        mounts,
        env.profile.root_block_size,
        validator_ctx,
    );
    let items = applier.apply()?;
    println!("  applied disk template ({} placeholders)", items.len());

    let delta = ContextDelta::new("placeholders", items.len().to_string());
    state.surgery_items = items;
    Ok(vec![delta])
}

fn finalize(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    verify_budgets(&state.surgery_items)?;

    let root = state.root_mount(env)?;
    let stats_dir = root.join("data/stats");
    std::fs::create_dir_all(&stats_dir)
        .with_context(|| format!("creating '{}'", stats_dir.display()))?;
    let stats_path = stats_dir.join("build.json");
    std::fs::write(&stats_path, env.config.stats_json(env.profile.board))
        .with_context(|| format!("writing '{}'", stats_path.display()))?;

    // First-boot scripts regenerate these; stale host copies must not ship.
    for rel in &env.config.sanitize_files {
        let path = root.join(rel.trim_start_matches('/'));
        if path.is_file() {
            std::fs::write(&path, b"")
                .with_context(|| format!("sanitizing '{}'", path.display()))?;
            println!("  sanitized {rel}");
        }
    }

    Ok(vec![ContextDelta::new("stats_written", "true")])
}

fn unmount(state: &mut BuildState, cleanups: &mut Vec<Cleanup>) -> Result<Vec<ContextDelta>> {
    let card = state.card_mut()?;
    card.unmount_all()?;
    card.detach()?;
    // The card is released; nothing left for the failure path to undo.
    cleanups.clear();
    Ok(vec![ContextDelta::new("unmounted", "true")])
}

fn compress(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    let image = state.image()?.to_path_buf();

    // A build resumed from a cached image skipped the setup step of this
    // invocation, so the plan recorded by the applier is gone. Rebuild it
    // from the template tree; the scan below pins the offsets either way.
    if state.surgery_items.is_empty() && env.cache_target.is_some() {
        state.surgery_items = template::scan_plan(
            &env.board_templates(),
            &env.profile.table,
            env.profile.root_block_size,
        )?;
        println!(
            "  rebuilt surgery plan from templates ({} placeholders)",
            state.surgery_items.len()
        );
    }

    let found = surgery::locate_placeholders(&image)?;
    surgery::resolve_plan(&mut state.surgery_items, &found)?;
    surgery::write_surgery(
        &image,
        &mut state.surgery_items,
        &env.board_templates(),
        &env.config.render_context(env.profile.board),
    )?;

    let sha256 = artifact::sha256_file(&image)?;

    let stem = env.artifact_stem();
    let final_image = env.output_dir.join(format!("{stem}.img"));
    move_file(&image, &final_image)?;

    let manifest_path = env.output_dir.join(format!("{stem}.manifest.json"));
    let manifest = Manifest::new(
        format!("{stem}.img"),
        sha256.clone(),
        env.config.robot_distro.clone(),
        state.surgery_items.clone(),
    );
    manifest.write_json(&manifest_path)?;

    let archive = env.output_dir.join(format!("{stem}.tar.zst"));
    artifact::package(&[final_image.clone(), manifest_path], &archive)?;
    println!("  packaged {}", archive.display());

    state.image = Some(final_image);
    state.archive = Some(archive.clone());
    Ok(vec![
        ContextDelta::new("sha256", sha256),
        ContextDelta::new("artifact", archive.to_string_lossy()),
    ])
}

fn push(env: &StepEnv, state: &mut BuildState) -> Result<Vec<ContextDelta>> {
    if !env.push {
        println!("  push not requested, skipping");
        return Ok(vec![]);
    }
    let url = env.config.push_url.as_deref().ok_or_else(|| {
        BuildError::Config("--push requires push_url in the robot configuration".into())
    })?;
    let archive = state.archive.as_deref().ok_or_else(|| {
        BuildError::Config("nothing to push; the compress step has not run".into())
    })?;
    artifact::push(archive, url)?;
    Ok(vec![ContextDelta::new("pushed_to", url)])
}

/// Every placeholder payload must fit its block-aligned budget.
fn verify_budgets(items: &[SurgeryItem]) -> Result<()> {
    for item in items {
        if item.used_bytes > item.length_bytes {
            return Err(BuildError::PlaceholderOverflow {
                key: item.placeholder.clone(),
                overflow_bytes: item.used_bytes - item.length_bytes,
            }
            .into());
        }
    }
    Ok(())
}

/// Rename, falling back to copy+remove when crossing filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("copying '{}' to '{}'", from.display(), to.display()))?;
    std::fs::remove_file(from)
        .with_context(|| format!("removing '{}'", from.display()))?;
    Ok(())
}
