use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::posix;
use crate::process::Process;
use crate::streams::Redirection;

pub(crate) struct SpawnResult {
    pub process: Process,
    /// Parent end of the child's stdin, if stdin was `Pipe`.
    pub stdin: Option<File>,
    /// Parent end of the child's stdout, if stdout was `Pipe`.
    pub stdout: Option<File>,
}

/// Per-child settings that don't depend on stream wiring.
pub(crate) struct SpawnConfig<'a> {
    /// Complete environment of the child, as `KEY=VALUE` entries.
    pub env: &'a [OsString],
    /// `PATH` used to locate commands without a slash.
    pub search_path: Option<&'a OsStr>,
    pub cwd: Option<&'a CString>,
    /// Process group to join; `Some(0)` starts a new group led by the child.
    pub pgid: Option<u32>,
    pub detached: bool,
}

/// What the child does with one of its standard streams.
#[derive(Debug)]
enum ChildEnd {
    Inherit,
    File(Arc<File>),
    /// Only valid for stderr: share whatever fd 1 ended up being.
    ToStdout,
}

/// Spawn a single child process.
///
/// Sets up stream redirections, forks, and blocks until the child has either exec'd or
/// failed to. By the time this returns `Ok`, the child has joined its process group.
pub(crate) fn spawn(
    argv: &[OsString],
    stdin: Redirection,
    stdout: Redirection,
    stderr: Redirection,
    config: &SpawnConfig<'_>,
) -> io::Result<SpawnResult> {
    if argv.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "argv must not be empty",
        ));
    }

    let (parent_ends, child_ends) = setup_streams(stdin, stdout, stderr)?;
    let process = os_start(argv, child_ends, config)?;

    Ok(SpawnResult {
        process,
        stdin: parent_ends.0,
        stdout: parent_ends.1,
    })
}

// Returns (parent_ends, child_ends). Only Pipe produces a parent end.
#[allow(clippy::type_complexity)]
fn setup_streams(
    stdin: Redirection,
    stdout: Redirection,
    stderr: Redirection,
) -> io::Result<((Option<File>, Option<File>), [ChildEnd; 3])> {
    let (parent_stdin, child_stdin) = match stdin {
        Redirection::None => (None, ChildEnd::Inherit),
        Redirection::Pipe => {
            let (read, write) = posix::pipe()?;
            (Some(write), ChildEnd::File(Arc::new(read)))
        }
        Redirection::File(f) => (None, ChildEnd::File(f)),
        Redirection::Merge => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "Redirection::Merge not valid for stdin",
            ));
        }
    };
    let (parent_stdout, child_stdout) = match stdout {
        Redirection::None => (None, ChildEnd::Inherit),
        Redirection::Pipe => {
            let (read, write) = posix::pipe()?;
            (Some(read), ChildEnd::File(Arc::new(write)))
        }
        Redirection::File(f) => (None, ChildEnd::File(f)),
        Redirection::Merge => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "Redirection::Merge not valid for stdout",
            ));
        }
    };
    let child_stderr = match stderr {
        Redirection::None => ChildEnd::Inherit,
        Redirection::File(f) => ChildEnd::File(f),
        Redirection::Merge => ChildEnd::ToStdout,
        Redirection::Pipe => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "Redirection::Pipe not valid for stderr",
            ));
        }
    };

    Ok((
        (parent_stdin, parent_stdout),
        [child_stdin, child_stdout, child_stderr],
    ))
}

/// Read exactly N bytes, or return None on immediate EOF. Similar to
/// read_exact(), but distinguishes between no read and partial read
/// (which is treated as error).
fn read_exact_or_eof<const N: usize>(source: &mut File) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let mut total_read = 0;
    while total_read < N {
        let n = match source.read(&mut buf[total_read..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        total_read += n;
    }
    match total_read {
        0 => Ok(None),
        n if n == N => Ok(Some(buf)),
        _ => Err(ErrorKind::UnexpectedEof.into()),
    }
}

fn os_start(
    argv: &[OsString],
    child_ends: [ChildEnd; 3],
    config: &SpawnConfig<'_>,
) -> io::Result<Process> {
    let (mut exec_fail_read, mut exec_fail_write) = posix::pipe()?;
    let just_exec = posix::prep_exec(&argv[0], argv, config.env, config.search_path)?;

    let pid = match unsafe { posix::fork()? } {
        Some(child_pid) => child_pid,
        None => {
            drop(exec_fail_read);
            let error_code = match do_exec(just_exec, &child_ends, config) {
                Ok(()) => libc::EINVAL,
                Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
            } as u32;
            exec_fail_write.write_all(&error_code.to_le_bytes()).ok();
            posix::_exit(127);
        }
    };

    // Close the parent's copies of child-end fds promptly after fork,
    // before blocking on exec_fail_pipe.
    drop(child_ends);

    drop(exec_fail_write);
    match read_exact_or_eof::<4>(&mut exec_fail_read)? {
        None => Ok(Process::new(pid, config.detached)),
        Some(error_buf) => {
            // the child has _exit()ed or is about to; don't leave a zombie behind
            posix::waitpid(pid, 0).ok();
            let error_code = u32::from_le_bytes(error_buf);
            Err(io::Error::from_raw_os_error(error_code as i32))
        }
    }
}

fn dup2_if_needed(end: &ChildEnd, target_fd: i32) -> io::Result<()> {
    match end {
        ChildEnd::Inherit => Ok(()),
        ChildEnd::File(f) if f.as_raw_fd() == target_fd => {
            // already in place; dup2 would have cleared close-on-exec for us
            posix::set_cloexec(target_fd, false)
        }
        ChildEnd::File(f) => posix::dup2(f.as_raw_fd(), target_fd),
        ChildEnd::ToStdout => posix::dup2(1, target_fd),
    }
}

// Runs in the forked child: no allocation from here on.
fn do_exec(
    just_exec: impl FnOnce() -> io::Result<()>,
    child_ends: &[ChildEnd; 3],
    config: &SpawnConfig<'_>,
) -> io::Result<()> {
    if let Some(pgid) = config.pgid {
        posix::setpgid(0, pgid)?;
    }
    if let Some(cwd) = config.cwd {
        posix::chdir(cwd)?;
    }

    let [stdin, stdout, stderr] = child_ends;
    dup2_if_needed(stdin, 0)?;
    dup2_if_needed(stdout, 1)?;
    dup2_if_needed(stderr, 2)?;
    posix::reset_signals()?;

    just_exec()
}
