use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::iter;
use std::marker::PhantomData;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

pub use libc::{ECHILD, ENOTTY, ESRCH, SIGKILL, SIGTERM, SIGTTOU};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

fn retry_eintr<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Create a pipe with both ends marked close-on-exec.
///
/// Returns `(read_end, write_end)`. Ends handed to a child become inheritable through
/// `dup2()` onto a standard stream.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd(), true)?;
    set_cloexec(write.as_raw_fd(), true)?;
    Ok((read, write))
}

/// Fork the current process.
///
/// Returns `Some(child_pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// After fork the child must restrict itself to async-signal-safe operations until it
/// calls exec or `_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

pub fn os_to_cstring(s: &OsStr) -> Result<CString> {
    // an interior NUL cannot be passed to the OS
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

fn cstring_ptr(s: &CString) -> *const libc::c_char {
    s.as_bytes_with_nul().as_ptr() as _
}

#[derive(Debug)]
struct CVec {
    // Individual C strings; they are not unused as rustc thinks, they
    // are pointed to by elements of self.ptrs.
    #[allow(dead_code)]
    strings: Vec<CString>,

    // nullptr-terminated vector of pointers to data inside
    // self.strings.
    ptrs: Vec<*const libc::c_char>,
}

impl CVec {
    fn new<S: AsRef<OsStr>>(slice: &[S]) -> Result<CVec> {
        let strings = slice
            .iter()
            .map(|x| os_to_cstring(x.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let ptrs = strings
            .iter()
            .map(cstring_ptr)
            .chain(iter::once(ptr::null()))
            .collect();
        Ok(CVec { strings, ptrs })
    }

    fn as_c_vec(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Prepare everything `execve` needs before forking.
///
/// The returned closure performs no allocation, so it is safe to call in a forked child
/// of a multi-threaded parent. It tries each `PATH` candidate in turn, the way `execvp`
/// does, and only returns if none of them could be executed.
pub fn prep_exec(
    cmd: &OsStr,
    args: &[OsString],
    env: &[OsString],
    search_path: Option<&OsStr>,
) -> Result<impl FnOnce() -> Result<()> + use<>> {
    let argvec = CVec::new(args)?;
    let envvec = CVec::new(env)?;
    let candidates = if cmd.as_bytes().contains(&b'/') {
        vec![os_to_cstring(cmd)?]
    } else {
        let mut found = vec![];
        if let Some(path) = search_path {
            for dir in env::split_paths(path) {
                let dir = if dir.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    dir
                };
                found.push(os_to_cstring(dir.join(cmd).as_os_str())?);
            }
        }
        found
    };

    Ok(move || {
        let mut err = Error::from_raw_os_error(libc::ENOENT);
        for exe in &candidates {
            unsafe {
                libc::execve(cstring_ptr(exe), argvec.as_c_vec(), envvec.as_c_vec());
            }
            let e = Error::last_os_error();
            // Keep looking past missing entries, but remember e.g. EACCES.
            if !matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) {
                err = e;
            }
        }
        Err(err)
    })
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

/// Returns the pid that changed state (0 for WNOHANG with nothing ready) and the raw
/// wait status.
pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0 as libc::c_int;
    let pid_out = retry_eintr(|| {
        check_err(unsafe {
            libc::waitpid(
                pid as libc::pid_t,
                &mut status as *mut libc::c_int,
                flags as libc::c_int,
            )
        })
    })?;
    Ok((pid_out as u32, status))
}

pub fn killpg(pgid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::killpg(pgid as libc::pid_t, signal) })?;
    Ok(())
}

pub fn setpgid(pid: u32, pgid: u32) -> Result<()> {
    check_err(unsafe { libc::setpgid(pid as libc::pid_t, pgid as libc::pid_t) })?;
    Ok(())
}

pub fn chdir(dir: &CString) -> Result<()> {
    check_err(unsafe { libc::chdir(cstring_ptr(dir)) })?;
    Ok(())
}

pub fn dup2(oldfd: RawFd, newfd: RawFd) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn set_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if cloexec {
        old | libc::FD_CLOEXEC
    } else {
        old & !libc::FD_CLOEXEC
    };
    if new != old {
        check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

pub fn set_nonblocking(f: &File) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFL, old | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Called in the child after fork to hand the program a clean signal state.
///
/// libstd ignores SIGPIPE, and the terminal guard ignores SIGTTOU while a foreground
/// pipeline runs. Ignored dispositions and the signal mask survive exec, and most Unix
/// programs do not reset them on their own.
pub fn reset_signals() -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        check_err(libc::sigemptyset(&mut set))?;
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_raw_os_error(rc));
        }
        for signum in [libc::SIGPIPE, libc::SIGTTOU] {
            if libc::signal(signum, libc::SIG_DFL) == libc::SIG_ERR {
                return Err(Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// A saved signal disposition, restored with [`restore_signal`].
pub struct SigAction(libc::sigaction);

/// Ignore `signum`, returning the disposition that was in effect.
pub fn ignore_signal(signum: i32) -> Result<SigAction> {
    unsafe {
        let mut new: libc::sigaction = mem::zeroed();
        new.sa_sigaction = libc::SIG_IGN;
        check_err(libc::sigemptyset(&mut new.sa_mask))?;
        let mut old: libc::sigaction = mem::zeroed();
        check_err(libc::sigaction(signum, &new, &mut old))?;
        Ok(SigAction(old))
    }
}

pub fn restore_signal(signum: i32, saved: &SigAction) -> Result<()> {
    check_err(unsafe { libc::sigaction(signum, &saved.0, ptr::null_mut()) })?;
    Ok(())
}

/// Path of the terminal device open on `fd`.
pub fn ttyname(fd: RawFd) -> Result<OsString> {
    let mut buf = [0u8; 1024];
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(Error::from_raw_os_error(rc));
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(OsStr::from_bytes(&buf[..len]).to_owned())
}

pub fn tcgetpgrp(fd: RawFd) -> Result<u32> {
    check_err(unsafe { libc::tcgetpgrp(fd) }).map(|pgid| pgid as u32)
}

pub fn tcsetpgrp(fd: RawFd, pgid: u32) -> Result<()> {
    check_err(unsafe { libc::tcsetpgrp(fd, pgid as libc::pid_t) })?;
    Ok(())
}

#[repr(transparent)]
pub struct PollFd<'a>(libc::pollfd, PhantomData<&'a File>);

impl PollFd<'_> {
    pub fn new(f: Option<&File>, events: i16) -> PollFd<'_> {
        PollFd(
            libc::pollfd {
                fd: f.map(File::as_raw_fd).unwrap_or(-1),
                events,
                revents: 0,
            },
            PhantomData,
        )
    }

    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }
}

pub use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT};

pub fn poll(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> Result<usize> {
    // round up, so that a sub-millisecond remainder doesn't turn into a busy loop
    let timeout = timeout
        .map(|t| t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32)
        .unwrap_or(-1);
    let cnt = retry_eintr(|| {
        check_err(unsafe {
            libc::poll(
                fds.as_mut_ptr() as *mut libc::pollfd,
                fds.len() as libc::nfds_t,
                timeout,
            )
        })
    })?;
    Ok(cnt as usize)
}
