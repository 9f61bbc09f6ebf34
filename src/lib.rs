//! Disk-image factory for Duckietown robots.
//!
//! Turns a generic base SD-card image into a robot-specific, flashable
//! artifact: download and extract the base, attach it as a virtual card on
//! a loop device, grow the root filesystem, update the OS through a
//! foreign-arch chroot, pre-seed the container engine with the robot's
//! module images, apply the board's disk template, and finally pin every
//! personalization placeholder to a byte offset so flashing tools can
//! re-personalize the raw image without mounting it.
//!
//! # Architecture
//!
//! ```text
//! pipeline (driver, step algebra, context fold)
//!     │
//!     ├── assets     — base archive download + extraction
//!     ├── sdcard     — loop device, mounts, geometry, MBR identifier
//!     ├── chroot     — qemu-user-static chroot executor
//!     ├── seeder     — nested docker engine, module pre-pull
//!     ├── template   — disk template applier + validators
//!     ├── surgery    — placeholder scan / plan / write
//!     └── artifact   — sha256, manifest, deterministic tar.zst, push
//! ```
//!
//! Every external command goes through [`process::Runner`], so the whole
//! pipeline is testable against a recording fake without root or hardware.

pub mod artifact;
pub mod assets;
pub mod board;
pub mod chroot;
pub mod config;
pub mod errors;
pub mod interrupt;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod sdcard;
pub mod seeder;
pub mod surgery;
pub mod template;

pub use board::{Board, BoardProfile};
pub use config::RobotConfig;
pub use errors::BuildError;
pub use process::{HostRunner, Runner, SharedRunner};
