// src/os/signals.rs

//! Cooperative cancellation driven by SIGINT/SIGTERM.

use log::debug;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag. Render loops poll it once per frame boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

static INTERRUPT_TOKEN: OnceCell<CancelToken> = OnceCell::new();

extern "C" fn on_interrupt(_signal: libc::c_int) {
    // Only an atomic load and store happen here.
    if let Some(token) = INTERRUPT_TOKEN.get() {
        token.cancel();
    }
}

/// Routes SIGINT and SIGTERM to `token`. Only the first token installed wins.
pub fn install_interrupt_handler(token: &CancelToken) -> nix::Result<()> {
    if INTERRUPT_TOKEN.set(token.clone()).is_err() {
        debug!("Interrupt handler already installed; keeping the first token.");
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action)? };
    }
    debug!("Installed SIGINT/SIGTERM handlers.");
    Ok(())
}
