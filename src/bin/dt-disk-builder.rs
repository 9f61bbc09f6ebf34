use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use dt_disk_builder::board::Board;
use dt_disk_builder::config::RobotConfig;
use dt_disk_builder::errors::BuildError;
use dt_disk_builder::interrupt;
use dt_disk_builder::pipeline::{self, parse_step_list, BuildRequest, Step};
use dt_disk_builder::process::HostRunner;

fn usage() -> &'static str {
    "Usage:
  dt-disk-builder create --board <rpi64|jetson-nano> --config FILE [options]

Options:
  --steps LIST         comma-separated steps to run (default: all)
  --no-steps LIST      comma-separated steps to skip
  --workdir DIR        working directory (default: ./work)
  --output DIR         output directory (default: ./out)
  --templates DIR      disk template root (default: ./templates)
  --no-cache           ignore cached downloads
  --cache-target STEP  resume from the image recorded after STEP
  --cache-record STEP  record the image after STEP for later resumes
  --push               upload the packaged artifact
  --accept-license     accept the base image's third-party licenses

Steps, in order:
  license, download, create, mount, resize, partition, upgrade, docker,
  setup, finalize, unmount, compress, push"
}

struct CliArgs {
    board: Board,
    config_path: PathBuf,
    workdir: PathBuf,
    output_dir: PathBuf,
    templates_dir: PathBuf,
    steps: Option<Vec<Step>>,
    no_steps: Vec<Step>,
    cache_target: Option<Step>,
    cache_record: Option<Step>,
    allow_cache: bool,
    push: bool,
    accept_license: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut board = None;
    let mut config_path = None;
    let mut workdir = PathBuf::from("work");
    let mut output_dir = PathBuf::from("out");
    let mut templates_dir = PathBuf::from("templates");
    let mut steps = None;
    let mut no_steps = Vec::new();
    let mut cache_target = None;
    let mut cache_record = None;
    let mut allow_cache = true;
    let mut push = false;
    let mut accept_license = false;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| -> Result<&String> {
            match it.next() {
                Some(v) => Ok(v),
                None => bail!("{flag} needs a value\n\n{}", usage()),
            }
        };
        match arg.as_str() {
            "--board" => board = Some(Board::parse(value("--board")?)?),
            "--config" => config_path = Some(PathBuf::from(value("--config")?)),
            "--steps" => steps = Some(parse_step_list(value("--steps")?)?),
            "--no-steps" => no_steps = parse_step_list(value("--no-steps")?)?,
            "--workdir" => workdir = PathBuf::from(value("--workdir")?),
            "--output" => output_dir = PathBuf::from(value("--output")?),
            "--templates" => templates_dir = PathBuf::from(value("--templates")?),
            "--no-cache" => allow_cache = false,
            "--cache-target" => cache_target = Some(value("--cache-target")?.parse()?),
            "--cache-record" => cache_record = Some(value("--cache-record")?.parse()?),
            "--push" => push = true,
            "--accept-license" => accept_license = true,
            other => bail!("unknown argument '{other}'\n\n{}", usage()),
        }
    }

    let Some(board) = board else {
        bail!("--board is required\n\n{}", usage());
    };
    let Some(config_path) = config_path else {
        bail!("--config is required\n\n{}", usage());
    };

    Ok(CliArgs {
        board,
        config_path,
        workdir,
        output_dir,
        templates_dir,
        steps,
        no_steps,
        cache_target,
        cache_record,
        allow_cache,
        push,
        accept_license,
    })
}

fn create(args: &[String]) -> Result<()> {
    let cli = parse_args(args)?;

    let mut config = RobotConfig::load(&cli.config_path)?;
    if cli.accept_license {
        config.accept_license = true;
    }

    interrupt::install_handler();

    pipeline::run(BuildRequest {
        board: cli.board,
        config,
        workdir: cli.workdir,
        output_dir: cli.output_dir,
        templates_dir: cli.templates_dir,
        cache_dir: dt_disk_builder::assets::default_cache_dir(),
        steps: cli.steps,
        no_steps: cli.no_steps,
        cache_target: cli.cache_target,
        cache_record: cli.cache_record,
        allow_cache: cli.allow_cache,
        push: cli.push,
        runner: Arc::new(HostRunner),
    })
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match args.split_first() {
        Some((cmd, rest)) if cmd == "create" => create(rest),
        _ => Err(anyhow::anyhow!(usage())),
    };

    if let Err(err) = result {
        match err.downcast_ref::<BuildError>() {
            Some(build_err) => eprintln!("[{}] {err:#}", build_err.kind()),
            None => eprintln!("{err:#}"),
        }
        std::process::exit(1);
    }
}
