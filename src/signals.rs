use crate::error::ShellError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use signal_hook::{consts::signal::SIGINT, iterator::Signals};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

const NO_CHILD: i32 = 0;

static BRIDGE: OnceCell<ForegroundChild> = OnceCell::new();

/// The child the shell is currently waiting on, if any.
///
/// Written only by the launcher that spawned the child, read only by the
/// interrupt bridge. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct ForegroundChild {
    pid: Arc<AtomicI32>,
}

impl ForegroundChild {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Pid> {
        match self.pid.load(Ordering::SeqCst) {
            NO_CHILD => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Marks `pid` as the foreground child until the returned guard drops.
    /// Drop the guard before reaping `pid`; once reaped the pid may be reused.
    pub fn track(&self, pid: Pid) -> ForegroundGuard<'_> {
        self.pid.store(pid.as_raw(), Ordering::SeqCst);
        ForegroundGuard { slot: self }
    }

    fn clear(&self) {
        self.pid.store(NO_CHILD, Ordering::SeqCst);
    }

    /// Handles one interrupt: SIGKILL the foreground child if there is one.
    /// Returns the child that was signalled.
    pub fn interrupt(&self) -> Result<Option<Pid>, Errno> {
        let Some(pid) = self.get() else {
            return Ok(None);
        };
        signal::kill(pid, Signal::SIGKILL)?;
        Ok(Some(pid))
    }
}

/// Clears the foreground slot when the reaping path is done with the child,
/// including on error.
#[must_use]
pub struct ForegroundGuard<'a> {
    slot: &'a ForegroundChild,
}

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// Installs the shell's SIGINT handler. Interrupts are forwarded as SIGKILL
/// to whichever child `foreground` holds and are otherwise ignored; the shell
/// itself never dies from them. Installing twice is a no-op.
pub fn install_interrupt_bridge(foreground: &ForegroundChild) -> Result<(), ShellError> {
    BRIDGE.get_or_try_init(|| {
        let mut signals = Signals::new([SIGINT]).map_err(ShellError::Signal)?;
        let slot = foreground.clone();
        thread::Builder::new()
            .name("sigint-bridge".into())
            .spawn(move || {
                for _ in signals.forever() {
                    match slot.interrupt() {
                        Ok(Some(pid)) => debug!(%pid, "forwarded interrupt as SIGKILL"),
                        Ok(None) => debug!("interrupt with no foreground child"),
                        Err(err) => warn!(%err, "failed to kill foreground child"),
                    }
                }
            })?;
        Ok::<_, ShellError>(foreground.clone())
    })?;
    Ok(())
}
