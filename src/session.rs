use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::communicate::from_utf8_lossy;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::runner;
use crate::streams::{PreparedStreams, Redirection};
use crate::task::{Task, TaskPoller};
use crate::terminal::TerminalGuard;

/// Per-call stream and timeout directives for [`Session`] entry points.
///
/// Paths given to [`output_file`](Self::output_file) and
/// [`error_file`](Self::error_file) truncate the target unless they start with `+`,
/// which selects append mode. Surrounding whitespace is ignored. Relative paths are
/// opened from the caller's working directory, not the session's.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct RunOptions {
    pub(crate) input_text: Option<String>,
    pub(crate) input_file: Option<PathBuf>,
    pub(crate) output_file: Option<PathBuf>,
    pub(crate) error_file: Option<PathBuf>,
    pub(crate) merge_stderr: bool,
    pub(crate) timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> RunOptions {
        RunOptions::default()
    }

    /// Feed `text` to the first stage's standard input.
    pub fn input_text(mut self, text: impl Into<String>) -> RunOptions {
        self.input_text = Some(text.into());
        self
    }

    /// Read the first stage's standard input from a file.
    pub fn input_file(mut self, path: impl AsRef<Path>) -> RunOptions {
        self.input_file = Some(path.as_ref().to_owned());
        self
    }

    /// Write the last stage's standard output to a file.
    pub fn output_file(mut self, path: impl AsRef<Path>) -> RunOptions {
        self.output_file = Some(path.as_ref().to_owned());
        self
    }

    /// Write the standard error of every stage to a file.
    pub fn error_file(mut self, path: impl AsRef<Path>) -> RunOptions {
        self.error_file = Some(path.as_ref().to_owned());
        self
    }

    /// Send each stage's standard error where its standard output goes.
    pub fn merge_stderr(mut self, merge: bool) -> RunOptions {
        self.merge_stderr = merge;
        self
    }

    /// Bound the input/output exchange and each stage's wait by `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> RunOptions {
        self.timeout = Some(timeout);
        self
    }
}

/// Working directory and environment overlay shared by a series of pipeline runs.
///
/// A `Session` is never modified after creation: [`configure`](Self::configure) returns
/// a new session and leaves the receiver alone. Each run spawns its children with the
/// parent's environment extended by the overlay, in the session's working directory
/// if one is set.
///
/// # Example
///
/// ```no_run
/// # use pipegroup::*;
/// # fn dummy() -> pipegroup::Result<()> {
/// let session = Session::new(TaskPoller::new())
///     .configure(Some(std::path::Path::new("/tmp")), [("LC_ALL", "C")])?;
/// let names = session.capture(&["ls", "sort -r"], RunOptions::new())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    poller: TaskPoller,
}

impl Session {
    /// Create a session with no working directory and an empty overlay.
    ///
    /// Background tasks started from this session, and every session configured from
    /// it, are registered with `poller`.
    pub fn new(poller: TaskPoller) -> Session {
        Session {
            cwd: None,
            env: BTreeMap::new(),
            poller,
        }
    }

    /// Return a session derived from this one.
    ///
    /// The new overlay is this session's overlay extended by `env`, later entries
    /// overriding earlier ones. The working directory is `cwd` if given, otherwise the
    /// current one.
    ///
    /// Fails with [`PipelineError::Configuration`] if a key is empty or contains `=` or
    /// NUL, or if a value is empty or contains NUL.
    pub fn configure<K, V>(
        &self,
        cwd: Option<&Path>,
        env: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Session>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut overlay = self.env.clone();
        for (key, value) in env {
            let (key, value) = (key.into(), value.into());
            check_env_entry(&key, &value)?;
            overlay.insert(key, value);
        }
        Ok(Session {
            cwd: cwd.map(Path::to_owned).or_else(|| self.cwd.clone()),
            env: overlay,
            poller: self.poller.clone(),
        })
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    /// Run a pipeline in the foreground and wait for it.
    ///
    /// If standard input is a terminal, the pipeline's process group is made the
    /// terminal's foreground group for the duration of the run.
    ///
    /// Fails with [`PipelineError::Execution`] naming the first stage, left to right,
    /// that exited unsuccessfully.
    pub fn run<S: AsRef<str>>(&self, commands: &[S], options: RunOptions) -> Result<()> {
        self.foreground(commands, options, false)?;
        Ok(())
    }

    /// Run a pipeline in the foreground and return the last stage's standard output.
    ///
    /// Output of earlier stages only flows down the pipeline. Invalid UTF-8 is replaced
    /// with `U+FFFD`. Setting [`RunOptions::output_file`] is a configuration error.
    pub fn capture<S: AsRef<str>>(&self, commands: &[S], options: RunOptions) -> Result<String> {
        if options.output_file.is_some() {
            return Err(PipelineError::Configuration(
                "capture does not accept output_file".into(),
            ));
        }
        let output = self.foreground(commands, options, true)?;
        Ok(from_utf8_lossy(output))
    }

    /// Start a pipeline in the background and return without waiting.
    ///
    /// The pipeline never takes the terminal. Its [`Task`] is registered with the
    /// session's [`TaskPoller`], which reaps its stages and then drops it.
    /// Standard input can only come from a file: `input_text` is rejected, and so is
    /// `timeout`, since nothing waits here.
    pub fn run_background<S: AsRef<str>>(
        &self,
        commands: &[S],
        options: RunOptions,
    ) -> Result<Task> {
        if options.input_text.is_some() {
            return Err(PipelineError::Configuration(
                "run_background does not accept input_text".into(),
            ));
        }
        if options.timeout.is_some() {
            return Err(PipelineError::Configuration(
                "run_background does not accept timeout; use Task::wait".into(),
            ));
        }
        let streams = PreparedStreams::prepare(&options)?;
        let pipeline = self.construct(commands, &streams)?;
        let task = Task::new(pipeline);
        debug!(pgid = task.pid(), "started background task");
        Ok(self.poller.add(task))
    }

    fn foreground<S: AsRef<str>>(
        &self,
        commands: &[S],
        options: RunOptions,
        capture: bool,
    ) -> Result<Vec<u8>> {
        let mut streams = PreparedStreams::prepare(&options)?;
        if capture {
            streams.stdout = Redirection::Pipe;
        }
        let terminal = TerminalGuard::acquire()?;

        let result = self.drive(commands, &streams, terminal.as_ref(), options);

        // the pipeline is gone by now; its files go next, the terminal last
        drop(streams);
        drop(terminal);
        result
    }

    fn drive<S: AsRef<str>>(
        &self,
        commands: &[S],
        streams: &PreparedStreams,
        terminal: Option<&TerminalGuard>,
        options: RunOptions,
    ) -> Result<Vec<u8>> {
        let mut pipeline = self.construct(commands, streams)?;
        if let Some(terminal) = terminal {
            if let Err(e) = terminal.hand_to(pipeline.pgid()) {
                pipeline.kill_and_reap();
                return Err(e.into());
            }
        }
        let input = options.input_text.map(String::into_bytes);
        runner::drive(&mut pipeline, input, options.timeout)
    }

    fn construct<S: AsRef<str>>(
        &self,
        commands: &[S],
        streams: &PreparedStreams,
    ) -> Result<Pipeline> {
        let env = self.child_env();
        Pipeline::construct(
            commands,
            self.cwd.as_deref(),
            &env,
            streams.stdin.clone(),
            streams.stdout.clone(),
            streams.stderr.clone(),
        )
    }

    fn child_env(&self) -> Vec<(OsString, OsString)> {
        env::vars_os()
            .chain(
                self.env
                    .iter()
                    .map(|(k, v)| (OsString::from(k), OsString::from(v))),
            )
            .collect()
    }
}

fn check_env_entry(key: &str, value: &str) -> Result<()> {
    let problem = if key.is_empty() {
        "empty environment variable name"
    } else if key.contains(['=', '\0']) {
        "environment variable name contains `=` or NUL"
    } else if value.is_empty() {
        "empty environment variable value"
    } else if value.contains('\0') {
        "environment variable value contains NUL"
    } else {
        return Ok(());
    };
    Err(PipelineError::Configuration(format!("{problem}: {key:?}")))
}
