use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::posix;
use crate::process::ignore_gone;

// The terminal has a single foreground slot and SIGTTOU disposition is process-wide,
// so guards taken on different threads must not interleave.
static TERMINAL: Mutex<()> = Mutex::new(());

/// Scoped ownership of the controlling terminal's foreground process group.
///
/// On acquisition the guard records which process group owns the terminal and
/// ignores `SIGTTOU`, which would otherwise stop the caller once it hands the terminal
/// to a pipeline and later takes it back from the background. Dropping the guard gives
/// the terminal back to the recorded group and restores the `SIGTTOU` disposition.
///
/// Acquiring is serialized across threads: a second guard blocks until the first is
/// dropped.
pub struct TerminalGuard {
    tty: File,
    saved_pgrp: u32,
    saved_sigttou: posix::SigAction,
    _lock: MutexGuard<'static, ()>,
}

impl TerminalGuard {
    /// Take control of the terminal attached to standard input.
    ///
    /// Returns `Ok(None)` if standard input is not a terminal, or not the controlling
    /// terminal of this process. There is nothing to hand off in that case.
    pub fn acquire() -> io::Result<Option<TerminalGuard>> {
        let path = match posix::ttyname(0) {
            Ok(path) => path,
            Err(e) if not_a_terminal(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let lock = TERMINAL.lock().unwrap_or_else(|e| e.into_inner());
        let tty = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&path)?;
        let saved_pgrp = match posix::tcgetpgrp(tty.as_raw_fd()) {
            Ok(pgrp) => pgrp,
            Err(e) if not_a_terminal(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let saved_sigttou = posix::ignore_signal(posix::SIGTTOU)?;
        debug!(tty = ?path, saved_pgrp, "acquired terminal");
        Ok(Some(TerminalGuard {
            tty,
            saved_pgrp,
            saved_sigttou,
            _lock: lock,
        }))
    }

    /// Make `pgid` the foreground process group of the terminal.
    ///
    /// The group is also sent `SIGCONT`, in case one of its members touched the
    /// terminal before the handoff and was stopped for it.
    pub fn hand_to(&self, pgid: u32) -> io::Result<()> {
        posix::tcsetpgrp(self.tty.as_raw_fd(), pgid)?;
        ignore_gone(posix::killpg(pgid, libc::SIGCONT))?;
        debug!(pgid, "handed terminal to pipeline");
        Ok(())
    }

    /// The process group that owned the terminal when the guard was acquired.
    pub fn saved_pgrp(&self) -> u32 {
        self.saved_pgrp
    }
}

impl AsRawFd for TerminalGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.tty.as_raw_fd()
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        // SIGTTOU is still ignored here, which is what lets a background caller do this.
        if let Err(e) = posix::tcsetpgrp(self.tty.as_raw_fd(), self.saved_pgrp) {
            warn!(pgrp = self.saved_pgrp, "cannot restore terminal owner: {e}");
        }
        if let Err(e) = posix::restore_signal(posix::SIGTTOU, &self.saved_sigttou) {
            warn!("cannot restore SIGTTOU disposition: {e}");
        }
        debug!(pgrp = self.saved_pgrp, "released terminal");
    }
}

impl std::fmt::Debug for TerminalGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalGuard")
            .field("fd", &self.tty.as_raw_fd())
            .field("saved_pgrp", &self.saved_pgrp)
            .finish_non_exhaustive()
    }
}

fn not_a_terminal(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(posix::ENOTTY) | Some(libc::ENXIO) | Some(libc::EBADF)
    )
}
