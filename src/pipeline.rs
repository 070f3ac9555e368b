use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::posix;
use crate::process::{Process, ignore_gone};
use crate::spawn::{SpawnConfig, spawn};
use crate::streams::Redirection;

/// How a running pipeline should be brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    /// Ask the processes to exit (`SIGTERM`).
    #[default]
    Graceful,
    /// Kill the processes outright (`SIGKILL`).
    Forceful,
    /// Deliver an arbitrary signal.
    Signal(i32),
}

impl Termination {
    /// The signal that carries this request.
    pub fn signal(self) -> i32 {
        match self {
            Termination::Graceful => posix::SIGTERM,
            Termination::Forceful => posix::SIGKILL,
            Termination::Signal(signum) => signum,
        }
    }
}

/// Something that can be asked to stop running.
///
/// Cancellation in this crate is always a termination request. The POSIX
/// implementation delivers it to the whole process group, so no stage is left behind.
pub trait Terminate {
    /// Deliver the termination request. A target that has already exited is not an
    /// error.
    fn terminate(&self, how: Termination) -> io::Result<()>;
}

/// One child process of a [`Pipeline`].
#[derive(Debug)]
pub struct Stage {
    command: String,
    argv: Vec<String>,
    process: Process,
}

impl Stage {
    /// The command string this stage was created from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The tokenized command line.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

/// Split a command string into words following shell quoting rules.
///
/// Quotes and backslash escapes are honored; globs and variables are left alone.
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(command).map_err(|e| {
        PipelineError::Configuration(format!("cannot parse command `{command}`: {e}"))
    })?;
    if argv.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "command `{command}` is empty"
        )));
    }
    Ok(argv)
}

/// Started processes connected stdout-to-stdin, sharing one process group.
///
/// Created by [`Pipeline::construct`]. Stage 0 leads the process group, so the group
/// id equals its pid.
pub struct Pipeline {
    // Pipe fields are declared before `stages` so that they are dropped
    // first, allowing children to receive EOF and exit before
    // `Process::drop` waits on them.
    stdin: Option<File>,
    stdout: Option<File>,
    stages: Vec<Stage>,
    pgid: u32,
}

impl Pipeline {
    /// Spawn one process per command and connect them into a pipeline.
    ///
    /// `stdin` applies to the first stage and `stdout` to the last; every other link is
    /// an anonymous pipe. `stderr` applies to every stage. `env` is the complete
    /// environment of the children, later entries overriding earlier ones.
    ///
    /// Stages are spawned left to right, each one joining the group of the first. If a
    /// stage fails to launch, the stages started before it are killed and reaped, and
    /// [`PipelineError::Spawn`] is returned.
    pub fn construct<S: AsRef<str>>(
        commands: &[S],
        cwd: Option<&Path>,
        env: &[(OsString, OsString)],
        stdin: Redirection,
        stdout: Redirection,
        stderr: Redirection,
    ) -> Result<Pipeline> {
        if commands.is_empty() {
            return Err(PipelineError::Configuration(
                "a pipeline needs at least one command".into(),
            ));
        }
        // tokenize everything up front, so a bad command spawns nothing
        let argvs = commands
            .iter()
            .map(|cmd| tokenize(cmd.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let env_entries = format_env(env);
        let search_path = env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_os_str());
        let cwd = cwd
            .map(|dir| posix::os_to_cstring(dir.as_os_str()))
            .transpose()?;

        let cnt = commands.len();
        let mut pipeline = Pipeline {
            stdin: None,
            stdout: None,
            stages: Vec::with_capacity(cnt),
            pgid: 0,
        };
        let mut first_stdin = Some(stdin);
        let mut last_stdout = Some(stdout);
        let mut prev_stdout: Option<File> = None;

        for (idx, (command, argv)) in commands.iter().zip(argvs).enumerate() {
            let command = command.as_ref();
            let stage_stdin = match prev_stdout.take() {
                Some(prev_out) => Redirection::File(Arc::new(prev_out)),
                None => first_stdin.take().unwrap_or(Redirection::None),
            };
            let stage_stdout = if idx == cnt - 1 {
                last_stdout.take().unwrap_or(Redirection::None)
            } else {
                Redirection::Pipe
            };
            let config = SpawnConfig {
                env: &env_entries,
                search_path,
                cwd: cwd.as_ref(),
                // spawn() blocks until the child has called setpgid and exec'd, so by
                // the time we fork the second child, the first child's group exists.
                pgid: Some(if idx == 0 { 0 } else { pipeline.pgid }),
                detached: false,
            };
            let os_argv: Vec<OsString> = argv.iter().map(OsString::from).collect();
            let result = match spawn(
                &os_argv,
                stage_stdin,
                stage_stdout,
                stderr.clone(),
                &config,
            ) {
                Ok(result) => result,
                Err(source) => {
                    pipeline.kill_and_reap();
                    return Err(PipelineError::Spawn {
                        command: command.to_owned(),
                        source,
                    });
                }
            };
            if idx == 0 {
                pipeline.pgid = result.process.pid();
                pipeline.stdin = result.stdin;
            }
            if idx == cnt - 1 {
                pipeline.stdout = result.stdout;
            } else {
                prev_stdout = result.stdout;
            }
            debug!(
                pid = result.process.pid(),
                pgid = pipeline.pgid,
                ?argv,
                "spawned stage {idx}"
            );
            pipeline.stages.push(Stage {
                command: command.to_owned(),
                argv,
                process: result.process,
            });
        }

        Ok(pipeline)
    }

    /// Process group id of the pipeline, equal to the first stage's pid.
    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    /// Stages in pipeline order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The last stage, whose exit defines the pipeline's completion.
    pub fn tail(&self) -> &Stage {
        // construct() never produces an empty pipeline
        &self.stages[self.stages.len() - 1]
    }

    /// The commands joined the way a shell would write them.
    pub fn command_line(&self) -> String {
        self.stages
            .iter()
            .map(Stage::command)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Write end of the first stage's stdin, if stdin was `Pipe`.
    pub(crate) fn take_stdin(&mut self) -> Option<File> {
        self.stdin.take()
    }

    /// Read end of the last stage's stdout, if stdout was `Pipe`.
    pub(crate) fn take_stdout(&mut self) -> Option<File> {
        self.stdout.take()
    }

    /// Send `signal` to the pipeline's process group.
    ///
    /// Skipped once every stage has been reaped: the group id may then belong to
    /// someone else.
    pub fn signal_group(&self, signal: i32) -> io::Result<()> {
        if self.stages.iter().all(|s| s.process.exit_status().is_some()) {
            return Ok(());
        }
        debug!(pgid = self.pgid, signal, "signaling process group");
        ignore_gone(posix::killpg(self.pgid, signal))
    }

    /// Kill the whole process group and reap every stage.
    ///
    /// The group is signaled even if every stage has already been reaped, so that
    /// processes the stages left behind in the group go down with them.
    pub fn kill_and_reap(&self) {
        if self.stages.is_empty() {
            // nothing was spawned; pgid 0 would mean our own group
            return;
        }
        debug!(pgid = self.pgid, "killing process group");
        if let Err(e) = ignore_gone(posix::killpg(self.pgid, posix::SIGKILL)) {
            warn!(pgid = self.pgid, "cannot kill pipeline: {e}");
        }
        for stage in &self.stages {
            // ECHILD is absorbed by Process; anything else leaves nothing to do
            let _ = stage.process.wait();
        }
    }

    /// Stop waiting for the stages when the pipeline is dropped.
    pub fn detach(&self) {
        for stage in &self.stages {
            stage.process.detach();
        }
    }
}

impl Terminate for Pipeline {
    fn terminate(&self, how: Termination) -> io::Result<()> {
        self.signal_group(how.signal())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("pgid", &self.pgid)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

fn format_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    let mut seen = HashSet::<&OsStr>::new();
    let mut formatted: Vec<_> = env
        .iter()
        .rev()
        .filter(|&(k, _)| seen.insert(k))
        .map(|(k, v)| {
            let mut fmt = k.clone();
            fmt.push("=");
            fmt.push(v);
            fmt
        })
        .collect();
    formatted.reverse();
    formatted
}

