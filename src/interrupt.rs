//! Cooperative SIGINT handling.
//!
//! Long-running loops (download, extract, scan) call [`check_interrupted`]
//! between chunks and clean up their partial outputs before returning.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::BuildError;

pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Install the SIGINT handler. Call once, from main.
pub fn install_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigint as usize;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

/// Returns `Err(BuildError::Interrupted)` once the flag is set.
pub fn check_interrupted() -> Result<()> {
    if INTERRUPTED.load(Ordering::Relaxed) {
        return Err(BuildError::Interrupted.into());
    }
    Ok(())
}
