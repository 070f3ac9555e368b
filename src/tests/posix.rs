use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use crate::posix::{self, PollFd};

fn is_cloexec(fd: i32) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    flags & libc::FD_CLOEXEC != 0
}

#[test]
fn pipe_ends_are_cloexec() {
    let (read, write) = posix::pipe().unwrap();
    assert!(is_cloexec(read.as_raw_fd()));
    assert!(is_cloexec(write.as_raw_fd()));
    posix::set_cloexec(read.as_raw_fd(), false).unwrap();
    assert!(!is_cloexec(read.as_raw_fd()));
}

#[test]
fn pipe_transfers_data() {
    let (mut read, mut write) = posix::pipe().unwrap();
    write.write_all(b"foo").unwrap();
    drop(write);
    let mut buf = String::new();
    read.read_to_string(&mut buf).unwrap();
    assert_eq!(buf, "foo");
}

#[test]
fn poll_times_out() {
    let (read, _write) = posix::pipe().unwrap();
    let mut fds = [PollFd::new(Some(&read), posix::POLLIN)];
    let start = Instant::now();
    assert_eq!(posix::poll(&mut fds, Some(Duration::from_millis(50))).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn poll_reports_hangup() {
    let (read, write) = posix::pipe().unwrap();
    drop(write);
    let mut fds = [PollFd::new(Some(&read), posix::POLLIN)];
    assert_eq!(posix::poll(&mut fds, None).unwrap(), 1);
    assert!(fds[0].test(posix::POLLHUP | posix::POLLIN));
}

#[test]
fn ttyname_of_pipe() {
    let (read, _write) = posix::pipe().unwrap();
    let err = posix::ttyname(read.as_raw_fd()).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(posix::ENOTTY));
}

#[test]
fn signal_disposition_round_trip() {
    let saved = posix::ignore_signal(libc::SIGUSR2).unwrap();
    let ignored = posix::ignore_signal(libc::SIGUSR2).unwrap();
    posix::restore_signal(libc::SIGUSR2, &saved).unwrap();
    drop(ignored);
}

#[test]
fn killpg_missing_group() {
    // pid_max never reaches this on Linux
    let err = posix::killpg(0x3fff_fffe, 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(posix::ESRCH));
}
