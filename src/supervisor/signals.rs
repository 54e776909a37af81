use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::sys::signal::{self, Signal};

/// The single `shutdown_requested` flag. Cloned into the control socket and
/// into embedding code; the loop reads it on every tick.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// Polling-based Unix signal handling, lock-free.
static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handler(sig: i32) {
    RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM into [`check_signals`]. The handler only stores
/// the signal number; everything else happens on the next tick.
pub fn install_signal_handlers() -> anyhow::Result<()> {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(handler),
        signal::SaFlags::SA_RESTART,
        signal::SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
            anyhow::anyhow!(
                "Failed to register {sig} handler: {e}. Signal handling is required for supervision."
            )
        })?;
    }
    Ok(())
}

/// Non-blocking check; returns Some(signal) once per delivery.
pub fn check_signals() -> Option<Signal> {
    let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
    if val == 0 {
        return None;
    }
    match Signal::try_from(val as i32) {
        Ok(sig) => Some(sig),
        Err(e) => {
            log::error!("BUG: Invalid signal number {val} from signal handler: {e}");
            None
        }
    }
}
