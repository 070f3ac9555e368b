use std::cmp::min;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::posix;

/// Exit status of a process.
///
/// Wraps the raw status reported by `waitpid()`. A status of `None` inside means the
/// child was reaped by someone else and its real status is unknown.
#[derive(Eq, PartialEq, Hash, Copy, Clone)]
pub struct ExitStatus(pub(crate) Option<i32>);

impl ExitStatus {
    pub(crate) fn from_raw(raw: i32) -> ExitStatus {
        ExitStatus(Some(raw))
    }

    /// True if the exit status of the process is 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Returns the exit code if the process exited voluntarily.
    pub fn code(&self) -> Option<u32> {
        let raw = self.0?;
        libc::WIFEXITED(raw).then(|| libc::WEXITSTATUS(raw) as u32)
    }

    /// Returns the signal number if the process was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        let raw = self.0?;
        libc::WIFSIGNALED(raw).then(|| libc::WTERMSIG(raw))
    }

    /// True if the process was killed by the signal with the specified number.
    pub fn is_killed_by(&self, signum: i32) -> bool {
        self.signal() == Some(signum)
    }

    /// The status as a single integer: the exit code, or the negated signal number if
    /// the process was killed by a signal.
    ///
    /// Returns `None` if the status could not be determined.
    pub fn returncode(&self) -> Option<i32> {
        match (self.code(), self.signal()) {
            (Some(code), _) => Some(code as i32),
            (None, Some(sig)) => Some(-sig),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(raw) if libc::WIFEXITED(raw) => {
                write!(f, "exit code {}", libc::WEXITSTATUS(raw))
            }
            Some(raw) if libc::WIFSIGNALED(raw) => {
                write!(f, "signal {}", libc::WTERMSIG(raw))
            }
            Some(raw) => {
                write!(f, "unrecognized wait status: {} {:#x}", raw, raw)
            }
            None => write!(f, "undetermined exit status"),
        }
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(raw) if libc::WIFEXITED(raw) => {
                write!(f, "ExitStatus(Exited({}))", libc::WEXITSTATUS(raw))
            }
            Some(raw) if libc::WIFSIGNALED(raw) => {
                write!(f, "ExitStatus(Signal({}))", libc::WTERMSIG(raw))
            }
            Some(raw) => {
                write!(f, "ExitStatus(Unknown({} {:#x}))", raw, raw)
            }
            None => write!(f, "ExitStatus(Undetermined)"),
        }
    }
}

/// A handle to a running or finished child process.
///
/// All methods take `&self`, so a `Process` can be polled from the task poller thread
/// and from the thread that owns the [`Task`](crate::Task) at the same time. Clones
/// share the same underlying state: once any clone observes the exit, all of them
/// report it.
///
/// When the last clone is dropped, it waits for the child to finish unless
/// [`detach`](Self::detach) has been called.
#[derive(Clone)]
pub struct Process(Arc<InnerProcess>);

struct InnerProcess {
    pid: u32,
    state: Mutex<ProcessState>,
    detached: AtomicBool,
}

#[derive(Debug)]
enum ProcessState {
    Running,
    Finished(ExitStatus),
}

impl Process {
    pub(crate) fn new(pid: u32, detached: bool) -> Process {
        Process(Arc::new(InnerProcess {
            pid,
            state: Mutex::new(ProcessState::Running),
            detached: AtomicBool::new(detached),
        }))
    }

    /// Returns the PID of the child.
    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// Returns the exit status, if the process is known to have finished.
    ///
    /// This does not perform any system calls.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.0.lock() {
            ProcessState::Finished(status) => Some(status),
            ProcessState::Running => None,
        }
    }

    /// Check whether the process has finished, without blocking.
    pub fn poll(&self) -> Option<ExitStatus> {
        self.wait_timeout(Duration::ZERO).unwrap_or(None)
    }

    /// Wait for the process to finish and return its exit status.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        let mut state = self.0.lock();
        loop {
            match *state {
                ProcessState::Finished(status) => return Ok(status),
                ProcessState::Running => InnerProcess::waitpid_into(&mut state, self.0.pid, true)?,
            }
        }
    }

    /// Wait for the process to finish, timing out after the specified duration.
    ///
    /// Returns `Ok(None)` if the timeout elapsed before the process finished.
    pub fn wait_timeout(&self, dur: Duration) -> io::Result<Option<ExitStatus>> {
        let mut state = self.0.lock();
        if let ProcessState::Finished(status) = *state {
            return Ok(Some(status));
        }

        let deadline = Instant::now() + dur;
        let mut delay = Duration::from_millis(1);

        loop {
            InnerProcess::waitpid_into(&mut state, self.0.pid, false)?;
            if let ProcessState::Finished(status) = *state {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline.duration_since(now);
            // Release the lock while sleeping so other threads can access the state.
            drop(state);
            std::thread::sleep(min(delay, remaining));
            delay = min(delay * 2, Duration::from_millis(100));
            state = self.0.lock();
        }
    }

    /// Mark the process as detached, so it is not waited on when dropped.
    pub fn detach(&self) {
        self.0.detached.store(true, Ordering::Relaxed);
    }
}

/// Swallow ESRCH: the target is already gone.
pub(crate) fn ignore_gone(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(posix::ESRCH) => Ok(()),
        other => other,
    }
}

impl InnerProcess {
    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        // state transitions can't be left half-done, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn waitpid_into(state: &mut ProcessState, pid: u32, block: bool) -> io::Result<()> {
        if matches!(*state, ProcessState::Finished(_)) {
            return Ok(());
        }
        match posix::waitpid(pid, if block { 0 } else { posix::WNOHANG }) {
            Ok((pid_out, raw)) if pid_out == pid => {
                *state = ProcessState::Finished(ExitStatus::from_raw(raw));
            }
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                // Someone else waited for the child. The PID no longer exists and we
                // cannot find its exit status.
                *state = ProcessState::Finished(ExitStatus(None));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl Drop for InnerProcess {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Relaxed) {
            let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, ProcessState::Running) {
                let _ = Self::waitpid_into(state, self.pid, true);
            }
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.0.pid)
            .field("state", &*self.0.lock())
            .field("detached", &self.0.detached.load(Ordering::Relaxed))
            .finish()
    }
}
