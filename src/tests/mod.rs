mod communicate;
mod posix;
mod session;

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    ExitStatus, Pipeline, PipelineError, PreparedStreams, Process, Redirection, RunOptions,
    Session, Stage, Task, TaskPoller,
};

// Poll `cond` until it holds or `timeout` passes.
fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// True once `pid` no longer exists or is only a zombie waiting for its new parent.
fn is_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => (unsafe { libc::kill(pid as libc::pid_t, 0) }) != 0,
    }
}

fn read_pid(path: &Path) -> u32 {
    fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn public_types_are_send_and_sync() {
    assert_send_sync::<ExitStatus>();
    assert_send_sync::<Pipeline>();
    assert_send_sync::<PipelineError>();
    assert_send_sync::<PreparedStreams>();
    assert_send_sync::<Process>();
    assert_send_sync::<Redirection>();
    assert_send_sync::<RunOptions>();
    assert_send_sync::<Session>();
    assert_send_sync::<Stage>();
    assert_send_sync::<Task>();
    assert_send_sync::<TaskPoller>();
}
