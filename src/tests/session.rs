use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::{eventually, is_gone, read_pid};
use crate::{PipelineError, RunOptions, Session, TaskPoller};

fn session() -> Session {
    Session::new(TaskPoller::new())
}

#[test]
fn capture_pipeline() {
    let out = session()
        .capture(&["printf 'a\\nb\\n'", "grep b"], RunOptions::new())
        .unwrap();
    assert_eq!(out, "b\n");
}

#[test]
fn run_pipeline() {
    session()
        .run(&["printf 'a\\nb\\n'", "grep b"], RunOptions::new())
        .unwrap();
}

#[test]
fn run_failure_exit_code() {
    let err = session().run(&["false"], RunOptions::new()).unwrap_err();
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(err.command(), Some("false"));
    assert!(matches!(err, PipelineError::Execution { .. }));
}

#[test]
fn first_failing_stage_is_reported() {
    let err = session()
        .run(&["sh -c 'exit 3'", "sh -c 'exit 4'"], RunOptions::new())
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(err.command(), Some("sh -c 'exit 3'"));
}

#[test]
fn middle_stage_failure() {
    let err = session()
        .capture(&["echo foo", "sh -c 'cat; exit 2'", "cat"], RunOptions::new())
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(2));
}

#[test]
fn signal_death_exit_code() {
    let err = session()
        .run(&["sh -c 'kill -TERM $$'"], RunOptions::new())
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(-libc::SIGTERM));
}

#[test]
fn capture_only_last_stage() {
    let out = session()
        .capture(
            &["echo first", "sh -c 'cat >/dev/null; echo second'"],
            RunOptions::new(),
        )
        .unwrap();
    assert_eq!(out, "second\n");
}

#[test]
fn capture_empty_output() {
    assert_eq!(session().capture(&["true"], RunOptions::new()).unwrap(), "");
}

#[test]
fn capture_invalid_utf8() {
    let out = session()
        .capture(&["printf 'a\\377b'"], RunOptions::new())
        .unwrap();
    assert_eq!(out, "a\u{fffd}b");
}

#[test]
fn input_text() {
    let out = session()
        .capture(&["tr a-z A-Z"], RunOptions::new().input_text("hello"))
        .unwrap();
    assert_eq!(out, "HELLO");
}

#[test]
fn input_text_multi_stage() {
    let out = session()
        .capture(
            &["cat", "grep -c x"],
            RunOptions::new().input_text("x\ny\nx\n"),
        )
        .unwrap();
    assert_eq!(out, "2\n");
}

#[test]
fn input_and_output_files() {
    let tmpdir = TempDir::new().unwrap();
    let input = tmpdir.path().join("input");
    let output = tmpdir.path().join("output");
    fs::write(&input, "foo\nbar\n").unwrap();
    session()
        .run(
            &["cat", "sort -r"],
            RunOptions::new().input_file(&input).output_file(&output),
        )
        .unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), "foo\nbar\n");
}

#[test]
fn output_file_append_mode() {
    let tmpdir = TempDir::new().unwrap();
    let output = tmpdir.path().join("output");
    let s = session();
    s.run(&["echo one"], RunOptions::new().output_file(&output))
        .unwrap();
    s.run(&["echo two"], RunOptions::new().output_file(&output))
        .unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), "two\n");
    let append = format!("+ {}", output.display());
    s.run(&["echo three"], RunOptions::new().output_file(&append))
        .unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), "two\nthree\n");
}

#[test]
fn error_file_collects_every_stage() {
    let tmpdir = TempDir::new().unwrap();
    let errors = tmpdir.path().join("errors");
    session()
        .run(
            &["sh -c 'echo one >&2'", "sh -c 'cat; sleep 0.1; echo two >&2'"],
            RunOptions::new().error_file(&errors),
        )
        .unwrap();
    assert_eq!(fs::read_to_string(&errors).unwrap(), "one\ntwo\n");
}

#[test]
fn merge_stderr_into_capture() {
    let out = session()
        .capture(
            &["sh -c 'echo out; echo err >&2'"],
            RunOptions::new().merge_stderr(true),
        )
        .unwrap();
    assert_eq!(out, "out\nerr\n");
}

#[test]
fn conflicting_options_spawn_nothing() {
    let tmpdir = TempDir::new().unwrap();
    let marker = tmpdir.path().join("marker");
    let err = session()
        .run(
            &[format!("touch {}", marker.display())],
            RunOptions::new()
                .error_file(tmpdir.path().join("errors"))
                .merge_stderr(true),
        )
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(!marker.exists());
}

#[test]
fn capture_rejects_output_file() {
    let err = session()
        .capture(&["true"], RunOptions::new().output_file("/dev/null"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn empty_command_list() {
    let err = session().run::<&str>(&[], RunOptions::new()).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn missing_command() {
    let err = session()
        .run(&["true", "nosuchcommand-pipegroup"], RunOptions::new())
        .unwrap_err();
    assert!(matches!(err, PipelineError::Spawn { .. }));
    assert_eq!(err.command(), Some("nosuchcommand-pipegroup"));
}

#[test]
fn timeout_kills_pipeline() {
    let tmpdir = TempDir::new().unwrap();
    let first = tmpdir.path().join("first");
    let second = tmpdir.path().join("second");
    let grandchild = tmpdir.path().join("grandchild");
    let commands = [
        format!(
            "sh -c 'echo $$ > {}; sleep 30 >/dev/null 2>&1 & echo $! > {}; wait'",
            first.display(),
            grandchild.display()
        ),
        format!("sh -c 'echo $$ > {}; sleep 30'", second.display()),
    ];
    let start = Instant::now();
    let err = session()
        .run(
            &commands,
            RunOptions::new().timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(10));
    match err {
        PipelineError::Timeout { command, timeout } => {
            assert_eq!(command, commands[0]);
            assert_eq!(timeout, Duration::from_millis(500));
        }
        other => panic!("unexpected error: {other}"),
    }
    // the stages and what they started in the group are all gone
    let pids = [read_pid(&first), read_pid(&second), read_pid(&grandchild)];
    assert!(eventually(Duration::from_secs(5), || pids
        .iter()
        .all(|&pid| is_gone(pid))));
}

#[test]
fn success_kills_leftover_group_members() {
    let tmpdir = TempDir::new().unwrap();
    let pidfile = tmpdir.path().join("pid");
    session()
        .run(
            &[format!(
                "sh -c 'sleep 30 >/dev/null 2>&1 & echo $! > {}'",
                pidfile.display()
            )],
            RunOptions::new(),
        )
        .unwrap();
    let leftover = read_pid(&pidfile);
    assert!(eventually(Duration::from_secs(5), || is_gone(leftover)));
}

#[test]
fn early_failure_beats_timeout() {
    let err = session()
        .capture(
            &["false", "sleep 3"],
            RunOptions::new().timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    assert!(matches!(err, PipelineError::Execution { .. }));
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(err.command(), Some("false"));
}

#[test]
fn early_failure_stops_capture() {
    let start = Instant::now();
    let err = session()
        .capture(&["false", "sleep 3"], RunOptions::new())
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(err.command(), Some("false"));
}

#[test]
fn running_stage_is_consulted_before_later_failure() {
    // `false` has exited, but the stage before it is still running
    let err = session()
        .capture(
            &["sleep 3", "false"],
            RunOptions::new().timeout(Duration::from_millis(300)),
        )
        .unwrap_err();
    assert!(matches!(err, PipelineError::Timeout { .. }));
    assert_eq!(err.command(), Some("sleep 3"));
}

#[test]
fn timeout_during_capture() {
    let start = Instant::now();
    let err = session()
        .capture(
            &["sleep 5", "cat"],
            RunOptions::new().timeout(Duration::from_millis(200)),
        )
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(matches!(err, PipelineError::Timeout { .. }));
    assert_eq!(err.command(), Some("sleep 5"));
}

#[test]
fn timeout_not_reached() {
    let out = session()
        .capture(
            &["echo done"],
            RunOptions::new().timeout(Duration::from_secs(10)),
        )
        .unwrap();
    assert_eq!(out, "done\n");
}

#[test]
fn configure_working_directory() {
    let tmpdir = TempDir::new().unwrap();
    let s = session().configure(Some(tmpdir.path()), [("A", "1")]).unwrap();
    let expected = fs::canonicalize(tmpdir.path()).unwrap();
    let out = s.capture(&["pwd -P"], RunOptions::new()).unwrap();
    assert_eq!(out.trim_end(), expected.to_str().unwrap());

    // a later configure without a directory keeps this one
    let s2 = s.configure(None, [("B", "2")]).unwrap();
    assert_eq!(s2.cwd(), Some(tmpdir.path()));
}

#[test]
fn configure_environment() {
    let base = session();
    let s = base
        .configure(None, [("PIPEGROUP_A", "1"), ("PIPEGROUP_B", "2")])
        .unwrap();
    let s = s.configure(None, [("PIPEGROUP_B", "3")]).unwrap();
    let out = s
        .capture(&["sh -c 'echo $PIPEGROUP_A $PIPEGROUP_B'"], RunOptions::new())
        .unwrap();
    assert_eq!(out, "1 3\n");
    // the receiver is left alone
    assert!(base.env().is_empty());
    assert_eq!(base.cwd(), None);
}

#[test]
fn overlay_keeps_parent_environment() {
    let s = session().configure(None, [("PIPEGROUP_C", "x")]).unwrap();
    // PATH comes from the parent, or `sh` would not be found
    let out = s
        .capture(&["sh -c 'echo $PIPEGROUP_C'"], RunOptions::new())
        .unwrap();
    assert_eq!(out, "x\n");
}

#[test]
fn configure_rejects_bad_entries() {
    let s = session();
    for (k, v) in [("", "x"), ("A=B", "x"), ("A\0", "x"), ("A", ""), ("A", "x\0y")] {
        let err = s.configure(None, [(k, v)]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)), "{k:?}={v:?}");
    }
}

#[test]
fn configure_error_leaves_nothing_behind() {
    let s = session().configure(Some(Path::new("/")), [("A", "1")]).unwrap();
    assert!(s.configure(None, [("B", "")]).is_err());
    assert_eq!(s.env().len(), 1);
}

#[test]
fn background_rejects_input_text() {
    let err = session()
        .run_background(&["cat"], RunOptions::new().input_text("foo"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[test]
fn background_rejects_timeout() {
    let err = session()
        .run_background(&["true"], RunOptions::new().timeout(Duration::from_secs(1)))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}
