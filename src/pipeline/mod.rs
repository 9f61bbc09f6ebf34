//! Build pipeline: canonical step list, step-set algebra, and the driver.
//!
//! A build is a fixed sequence of named steps. The caller chooses which
//! steps run; the order never changes and the mandatory steps can not be
//! deselected. On any failure the driver drains a LIFO stack of cleanup
//! actions (unmounts, loop detach) before surfacing the error, so a failed
//! build never leaves the host holding a loop device.

pub mod context;
pub mod steps;

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::board::{Board, BoardProfile};
use crate::config::RobotConfig;
use crate::errors::BuildError;
use crate::interrupt::check_interrupted;
use crate::process::SharedRunner;
use context::PipelineContext;
use steps::{BuildState, StepEnv};

/// Canonical pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    License,
    Download,
    Create,
    Mount,
    Resize,
    Partition,
    Upgrade,
    Docker,
    Setup,
    Finalize,
    Unmount,
    Compress,
    Push,
}

impl Step {
    pub const ALL: [Step; 13] = [
        Step::License,
        Step::Download,
        Step::Create,
        Step::Mount,
        Step::Resize,
        Step::Partition,
        Step::Upgrade,
        Step::Docker,
        Step::Setup,
        Step::Finalize,
        Step::Unmount,
        Step::Compress,
        Step::Push,
    ];

    /// Steps that always run: without them there is no image to hand back.
    pub const MANDATORY: [Step; 3] = [Step::Create, Step::Mount, Step::Unmount];

    pub fn name(&self) -> &'static str {
        match self {
            Step::License => "license",
            Step::Download => "download",
            Step::Create => "create",
            Step::Mount => "mount",
            Step::Resize => "resize",
            Step::Partition => "partition",
            Step::Upgrade => "upgrade",
            Step::Docker => "docker",
            Step::Setup => "setup",
            Step::Finalize => "finalize",
            Step::Unmount => "unmount",
            Step::Compress => "compress",
            Step::Push => "push",
        }
    }

    /// Position in the canonical order.
    fn index(&self) -> usize {
        Step::ALL
            .iter()
            .position(|s| s == self)
            .expect("every step is in ALL")
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .iter()
            .find(|step| step.name() == s)
            .copied()
            .ok_or_else(|| BuildError::Config(format!("unknown step '{s}'")).into())
    }
}

/// Parses a comma-separated step list, rejecting unknown names before any
/// side effect.
pub fn parse_step_list(raw: &str) -> Result<Vec<Step>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Step::from_str)
        .collect()
}

/// The resolved set of steps a build will run, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    steps: Vec<Step>,
}

impl StepPlan {
    /// `(include \ exclude) ∪ mandatory`, then steps strictly before
    /// `cache_target` are dropped (mandatory ones excepted). `include`
    /// defaults to every step.
    pub fn resolve(
        include: Option<&[Step]>,
        exclude: &[Step],
        cache_target: Option<Step>,
    ) -> StepPlan {
        let include = include.unwrap_or(&Step::ALL);
        let steps = Step::ALL
            .iter()
            .filter(|step| {
                let mandatory = Step::MANDATORY.contains(step);
                let selected = include.contains(step) && !exclude.contains(step);
                if !(selected || mandatory) {
                    return false;
                }
                match cache_target {
                    Some(target) => mandatory || step.index() >= target.index(),
                    None => true,
                }
            })
            .copied()
            .collect();
        StepPlan { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn contains(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }
}

/// Deferred resource cleanup, drained LIFO when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    UnmountAll,
    DetachLoop,
}

fn drain_cleanups(cleanups: &mut Vec<Cleanup>, state: &mut BuildState) {
    while let Some(action) = cleanups.pop() {
        let Some(card) = state.card.as_mut() else {
            continue;
        };
        let result = match action {
            Cleanup::UnmountAll => card.unmount_all(),
            Cleanup::DetachLoop => card.detach(),
        };
        if let Err(err) = result {
            eprintln!("  [WARN] cleanup ({action:?}) failed: {err:#}");
        }
    }
}

/// Everything a build needs, assembled by the CLI.
pub struct BuildRequest {
    pub board: Board,
    pub config: RobotConfig,
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub steps: Option<Vec<Step>>,
    pub no_steps: Vec<Step>,
    pub cache_target: Option<Step>,
    pub cache_record: Option<Step>,
    pub allow_cache: bool,
    pub push: bool,
    pub runner: SharedRunner,
}

/// Cached snapshot of the image taken after the named step.
pub fn cache_image_path(workdir: &Path, profile: &BoardProfile, step: Step) -> PathBuf {
    workdir.join(format!("{}.cache-{}.img", profile.base_stem(), step.name()))
}

/// Runs the whole pipeline for one image.
pub fn run(request: BuildRequest) -> Result<()> {
    let profile = BoardProfile::for_board(request.board)?;
    let plan = StepPlan::resolve(
        request.steps.as_deref(),
        &request.no_steps,
        request.cache_target,
    );

    std::fs::create_dir_all(&request.workdir)
        .with_context(|| format!("creating workdir '{}'", request.workdir.display()))?;
    std::fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("creating output dir '{}'", request.output_dir.display()))?;

    let names: Vec<&str> = plan.steps().iter().map(Step::name).collect();
    println!(
        "Building {} image for '{}' (steps: {})",
        profile.base_stem(),
        request.config.hostname,
        names.join(", ")
    );

    let env = StepEnv {
        profile,
        config: request.config,
        workdir: request.workdir,
        output_dir: request.output_dir,
        templates_dir: request.templates_dir,
        cache_dir: request.cache_dir,
        allow_cache: request.allow_cache,
        cache_target: request.cache_target,
        push: request.push,
        runner: request.runner,
    };
    let mut state = BuildState::default();
    let mut ctx = PipelineContext::new();
    let mut cleanups: Vec<Cleanup> = Vec::new();

    for step in plan.steps() {
        if let Err(err) = check_interrupted() {
            drain_cleanups(&mut cleanups, &mut state);
            return Err(err);
        }
        execute_step(
            *step,
            &env,
            &mut state,
            &mut ctx,
            &mut cleanups,
            request.cache_record,
        )?;
    }

    println!("Build of '{}' finished.", env.config.hostname);
    Ok(())
}

/// Runs one step, including the post-step cache snapshot. Any failure drains
/// the cleanup stack before surfacing, the cache copy included: an error
/// there must not leak the mounts the step left behind.
fn execute_step(
    step: Step,
    env: &StepEnv,
    state: &mut BuildState,
    ctx: &mut PipelineContext,
    cleanups: &mut Vec<Cleanup>,
    cache_record: Option<Step>,
) -> Result<()> {
    println!("{}", step_banner("BEGIN", step));
    let outcome = steps::run_step(step, env, state, cleanups).and_then(|deltas| {
        if cache_record == Some(step) {
            record_cache(env, state, step)?;
        }
        Ok(deltas)
    });
    match outcome {
        Ok(deltas) => {
            ctx.apply(step, deltas);
            println!("{}", step_banner("END", step));
            Ok(())
        }
        Err(err) => {
            drain_cleanups(cleanups, state);
            Err(err.context(format!("step '{step}' failed")))
        }
    }
}

/// The named step boundary scripts grep for.
fn step_banner(phase: &str, step: Step) -> String {
    format!("Step {phase}: {step}")
}

fn record_cache(env: &StepEnv, state: &BuildState, step: Step) -> Result<()> {
    let Some(image) = state.image.as_ref() else {
        return Ok(());
    };
    let cache = cache_image_path(&env.workdir, &env.profile, step);
    std::fs::copy(image, &cache)
        .with_context(|| format!("recording cache image '{}'", cache.display()))?;
    println!("Recorded cache image after '{step}' at {}", cache.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(Step::from_str(step.name()).unwrap(), step);
        }
    }

    #[test]
    fn unknown_step_name_is_rejected() {
        let err = parse_step_list("create,flash").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Config(_))
        ));
    }

    #[test]
    fn default_plan_runs_everything_in_order() {
        let plan = StepPlan::resolve(None, &[], None);
        assert_eq!(plan.steps(), &Step::ALL);
    }

    #[test]
    fn excluded_steps_are_dropped_but_mandatory_survive() {
        let plan = StepPlan::resolve(
            None,
            &[Step::Push, Step::Docker, Step::Mount, Step::Create],
            None,
        );
        assert!(!plan.contains(Step::Push));
        assert!(!plan.contains(Step::Docker));
        // Deselecting a mandatory step has no effect.
        assert!(plan.contains(Step::Create));
        assert!(plan.contains(Step::Mount));
        assert!(plan.contains(Step::Unmount));
    }

    #[test]
    fn explicit_inclusion_is_unioned_with_mandatory() {
        let plan = StepPlan::resolve(Some(&[Step::Setup]), &[], None);
        assert_eq!(
            plan.steps(),
            &[Step::Create, Step::Mount, Step::Setup, Step::Unmount]
        );
    }

    #[test]
    fn cache_target_drops_earlier_optional_steps() {
        let plan = StepPlan::resolve(None, &[], Some(Step::Setup));
        assert!(!plan.contains(Step::License));
        assert!(!plan.contains(Step::Download));
        assert!(!plan.contains(Step::Upgrade));
        // Mandatory steps are preserved even when they sit before the
        // cache target.
        assert!(plan.contains(Step::Create));
        assert!(plan.contains(Step::Mount));
        assert_eq!(
            plan.steps(),
            &[
                Step::Create,
                Step::Mount,
                Step::Setup,
                Step::Finalize,
                Step::Unmount,
                Step::Compress,
                Step::Push,
            ]
        );
    }

    #[test]
    fn step_banners_are_greppable() {
        assert_eq!(step_banner("BEGIN", Step::Mount), "Step BEGIN: mount");
        assert_eq!(step_banner("END", Step::Compress), "Step END: compress");
    }

    #[test]
    fn failed_cache_record_drains_cleanups() {
        use crate::board::Board;
        use crate::process::RecordingRunner;
        use crate::sdcard::VirtualSDCard;
        use std::sync::Arc;
        use tempfile::TempDir;

        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let profile = BoardProfile::for_board(Board::RaspberryPi64).unwrap();
        let env = StepEnv {
            profile,
            config: RobotConfig {
                hostname: "autobot01".into(),
                country: "US".into(),
                token: "dt1-abc".into(),
                robot_type: "duckiebot".into(),
                robot_configuration: "DB21M".into(),
                robot_distro: "ente".into(),
                wifi: vec![],
                sanitize_files: vec![],
                registry: "docker.io".into(),
                accept_license: true,
                push_url: None,
                build_timestamp: None,
            },
            workdir: tmp.path().join("work"),
            output_dir: tmp.path().join("out"),
            templates_dir: tmp.path().join("templates"),
            cache_dir: tmp.path().join("cache"),
            allow_cache: true,
            cache_target: None,
            push: false,
            runner: runner.clone(),
        };
        std::fs::create_dir_all(&env.workdir).unwrap();

        // An attached card and a pending detach, but the image to snapshot
        // is gone: the copy fails after the step itself succeeded.
        let missing = tmp.path().join("gone.img");
        let mut card =
            VirtualSDCard::new(&missing, env.profile.table.clone(), runner.clone());
        card.attach_preassigned(&tmp.path().join("loop9"));
        let mut state = BuildState::default();
        state.image = Some(missing);
        state.card = Some(card);
        let mut cleanups = vec![Cleanup::DetachLoop];
        let mut ctx = PipelineContext::new();

        let err = execute_step(
            Step::License,
            &env,
            &mut state,
            &mut ctx,
            &mut cleanups,
            Some(Step::License),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("recording cache image"));

        // The failure path released the loop device.
        assert!(cleanups.is_empty());
        assert!(!state.card.as_ref().unwrap().is_attached());
        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.starts_with("losetup --detach")));
    }

    #[test]
    fn order_is_canonical_regardless_of_selection_order() {
        let plan = StepPlan::resolve(Some(&[Step::Compress, Step::Resize, Step::Download]), &[], None);
        assert_eq!(
            plan.steps(),
            &[
                Step::Download,
                Step::Create,
                Step::Mount,
                Step::Resize,
                Step::Unmount,
                Step::Compress,
            ]
        );
    }
}
