//! Failure kinds the pipeline distinguishes.
//!
//! Everything still travels as `anyhow::Error`; these variants exist so the
//! driver and tests can tell a placeholder collision from a missing loop
//! device by `downcast_ref::<BuildError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Unknown step name, conflicting flags, bad template field.
    #[error("configuration error: {0}")]
    Config(String),

    /// Expected partition device never appeared.
    #[error("partition device for '{label}' did not appear at {device}")]
    PartitionMissing { label: String, device: String },

    /// Host has no free loopback device.
    #[error("no free loopback device available on this host")]
    NoFreeLoop,

    /// A partition label expected on the image already resolves on the host.
    #[error("filesystem label '{0}' already exists on this host")]
    LabelConflict(String),

    /// Foreign-architecture probe failed inside the chroot.
    #[error("foreign-architecture emulation is not working: {0}")]
    EmulationMisconfigured(String),

    /// The same placeholder key was found more than once.
    #[error("placeholder '{0}' occurs more than once")]
    PlaceholderCollision(String),

    /// A planned placeholder key was not found in the raw image.
    #[error("placeholder '{0}' was not found in the image")]
    PlaceholderMissing(String),

    /// Rendered payload exceeds the padded budget.
    #[error("payload for placeholder '{key}' overflows its budget by {overflow_bytes} bytes")]
    PlaceholderOverflow { key: String, overflow_bytes: u64 },

    /// A shelled-out command exited non-zero and was not suppressible.
    #[error("command '{command}' exited with status {status}: {detail}")]
    ExternalTool {
        command: String,
        status: i32,
        detail: String,
    },

    /// User cancellation (SIGINT) observed at a checkpoint.
    #[error("interrupted")]
    Interrupted,
}

impl BuildError {
    /// Short kind name printed next to the failing step.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Config(_) => "ConfigError",
            BuildError::PartitionMissing { .. } => "PartitionMissing",
            BuildError::NoFreeLoop => "NoFreeLoop",
            BuildError::LabelConflict(_) => "LabelConflict",
            BuildError::EmulationMisconfigured(_) => "EmulationMisconfigured",
            BuildError::PlaceholderCollision(_) => "PlaceholderCollision",
            BuildError::PlaceholderMissing(_) => "PlaceholderMissing",
            BuildError::PlaceholderOverflow { .. } => "PlaceholderOverflow",
            BuildError::ExternalTool { .. } => "ExternalToolError",
            BuildError::Interrupted => "Interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_names() {
        assert_eq!(BuildError::NoFreeLoop.kind(), "NoFreeLoop");
        assert_eq!(
            BuildError::PlaceholderOverflow {
                key: "HOSTNAME".into(),
                overflow_bytes: 5
            }
            .kind(),
            "PlaceholderOverflow"
        );
    }

    #[test]
    fn overflow_message_reports_bytes() {
        let err = BuildError::PlaceholderOverflow {
            key: "HOSTNAME".into(),
            overflow_bytes: 5,
        };
        assert!(err.to_string().contains("5 bytes"));
    }
}
