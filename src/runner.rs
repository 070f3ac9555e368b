//! Synchronous draining of a foreground pipeline.

use std::io;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::communicate::Communicator;
use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, Stage};
use crate::process::ExitStatus;

// How long the input/output exchange runs before the stages are checked for failure.
const STATUS_CHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Drive `pipeline` to completion on the calling thread.
///
/// Feeds `input` to the first stage if its stdin is a pipe, collects the last stage's
/// output if its stdout is a pipe, then waits for the stages left to right. Each wait is
/// bounded by `timeout` on its own. The first unsuccessful stage aborts the drain, also
/// while the exchange is still running.
///
/// Whatever the outcome, the process group is killed and every stage reaped before
/// this returns.
pub(crate) fn drive(
    pipeline: &mut Pipeline,
    input: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let result = drain(pipeline, input, timeout);
    pipeline.kill_and_reap();
    if let Err(e) = &result {
        debug!(pgid = pipeline.pgid(), "pipeline aborted: {e}");
    }
    result
}

fn drain(
    pipeline: &mut Pipeline,
    input: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let stdin = pipeline.take_stdin();
    let stdout = pipeline.take_stdout();

    let mut output = vec![];
    if stdin.is_some() || stdout.is_some() {
        let comm = Communicator::new(stdin, stdout, input.unwrap_or_default())?;
        output = exchange(pipeline, comm, timeout)?;
    }

    for stage in pipeline.stages() {
        let status = match timeout {
            Some(t) => stage.process().wait_timeout(t)?.ok_or_else(|| {
                PipelineError::Timeout {
                    command: stage.command().to_owned(),
                    timeout: t,
                }
            })?,
            None => stage.process().wait()?,
        };
        if !status.success() {
            return Err(failed(stage, status));
        }
    }

    Ok(output)
}

// Run the exchange in short slices, so that a stage failing while the tail keeps its
// stdout open is noticed without waiting for EOF.
fn exchange(
    pipeline: &Pipeline,
    mut comm: Communicator,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice_end = Instant::now() + STATUS_CHECK_INTERVAL;
        let slice_end = deadline.map_or(slice_end, |d| d.min(slice_end));
        match comm.read(Some(slice_end)) {
            Ok(output) => return Ok(output),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        check_exited(pipeline)?;
        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                return Err(PipelineError::Timeout {
                    command: first_running(pipeline).command().to_owned(),
                    timeout,
                });
            }
        }
    }
}

// Look at the stages left to right, up to the first one still running, and report the
// first that has failed. Stages behind a running one are not consulted.
fn check_exited(pipeline: &Pipeline) -> Result<()> {
    for stage in pipeline.stages() {
        match stage.process().poll() {
            None => break,
            Some(status) if !status.success() => return Err(failed(stage, status)),
            Some(_) => {}
        }
    }
    Ok(())
}

fn first_running(pipeline: &Pipeline) -> &Stage {
    pipeline
        .stages()
        .iter()
        .find(|s| s.process().poll().is_none())
        .unwrap_or(pipeline.tail())
}

fn failed(stage: &Stage, status: ExitStatus) -> PipelineError {
    PipelineError::Execution {
        command: stage.command().to_owned(),
        status,
    }
}
