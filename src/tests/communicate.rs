use std::env;
use std::ffi::OsString;
use std::io;
use std::time::{Duration, Instant};

use crate::communicate::{Communicator, from_utf8_lossy};
use crate::{Pipeline, Redirection};

fn start(commands: &[&str], stdin: Redirection, stdout: Redirection) -> Pipeline {
    let env: Vec<(OsString, OsString)> = env::vars_os().collect();
    Pipeline::construct(commands, None, &env, stdin, stdout, Redirection::None).unwrap()
}

#[test]
fn feed_and_collect() {
    let mut p = start(&["cat", "tr a-z A-Z"], Redirection::Pipe, Redirection::Pipe);
    let mut comm =
        Communicator::new(p.take_stdin(), p.take_stdout(), b"hello world".to_vec()).unwrap();
    assert_eq!(comm.read(None).unwrap(), b"HELLO WORLD");
    p.kill_and_reap();
}

#[test]
fn large_exchange_does_not_deadlock() {
    // far more than a pipe buffer in both directions
    let input = "x".repeat(1_000_000);
    let mut p = start(&["cat"], Redirection::Pipe, Redirection::Pipe);
    let mut comm =
        Communicator::new(p.take_stdin(), p.take_stdout(), input.clone().into_bytes()).unwrap();
    let out = comm.read(Some(Instant::now() + Duration::from_secs(30))).unwrap();
    assert_eq!(out.len(), input.len());
    p.kill_and_reap();
}

#[test]
fn head_stops_reading() {
    let input = "y\n".repeat(500_000);
    let mut p = start(&["head -n 1"], Redirection::Pipe, Redirection::Pipe);
    let mut comm =
        Communicator::new(p.take_stdin(), p.take_stdout(), input.into_bytes()).unwrap();
    assert_eq!(comm.read(None).unwrap(), b"y\n");
    p.kill_and_reap();
}

#[test]
fn exchange_times_out() {
    let mut p = start(&["sleep 5"], Redirection::None, Redirection::Pipe);
    let mut comm = Communicator::new(None, p.take_stdout(), vec![]).unwrap();
    let err = comm
        .read(Some(Instant::now() + Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    p.kill_and_reap();
}

#[test]
fn exchange_resumes_after_timeout() {
    let mut p = start(
        &["sh -c 'echo first; sleep 0.3; echo second'"],
        Redirection::None,
        Redirection::Pipe,
    );
    let mut comm = Communicator::new(None, p.take_stdout(), vec![]).unwrap();
    let err = comm
        .read(Some(Instant::now() + Duration::from_millis(100)))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    // output read before the timeout is not lost
    assert_eq!(comm.read(None).unwrap(), b"first\nsecond\n");
    p.kill_and_reap();
}

#[test]
fn lossy_utf8() {
    assert_eq!(from_utf8_lossy(b"foo".to_vec()), "foo");
    assert_eq!(from_utf8_lossy(b"a\xffb".to_vec()), "a\u{fffd}b");
}
