//! Run shell-style pipelines of child processes as one process group.
//!
//! Each pipeline is a list of command strings, split into words with shell quoting
//! rules and connected stdout-to-stdin like `a | b | c`. All stages share a process
//! group led by the first stage, so the pipeline can be handed the controlling terminal
//! and killed as one unit.
//!
//! The entry point is [`Session`], which carries a working directory and an
//! environment overlay and offers three ways of running a pipeline:
//!
//! * [`Session::run`] waits for the pipeline in the foreground,
//! * [`Session::capture`] does the same and returns the last stage's output,
//! * [`Session::run_background`] returns a [`Task`] immediately.
//!
//! Background tasks are reclaimed by a [`TaskPoller`] once their last stage exits.
//!
//! # Examples
//!
//! ```no_run
//! # use pipegroup::*;
//! # fn dummy() -> pipegroup::Result<()> {
//! let session = Session::new(TaskPoller::new());
//! let out = session.capture(&["printf 'a\\nb\\n'", "grep b"], RunOptions::new())?;
//! assert_eq!(out, "b\n");
//!
//! session.run(&["make -j4"], RunOptions::new().error_file("+build.log"))?;
//!
//! let task = session.run_background(&["sleep 10"], RunOptions::new())?;
//! task.kill(Termination::Forceful)?;
//! # Ok(())
//! # }
//! ```
//!
//! A failing stage is reported with its return code:
//!
//! ```no_run
//! # use pipegroup::*;
//! let session = Session::new(TaskPoller::new());
//! let err = session.run(&["false"], RunOptions::new()).unwrap_err();
//! assert_eq!(err.exit_code(), Some(1));
//! ```

#[cfg(not(unix))]
compile_error!("pipegroup relies on POSIX process groups and terminals");

mod communicate;
mod error;
mod pipeline;
mod posix;
mod process;
mod runner;
mod session;
mod spawn;
mod streams;
mod task;
mod terminal;

#[cfg(test)]
mod tests;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, Stage, Terminate, Termination, tokenize};
pub use process::{ExitStatus, Process};
pub use session::{RunOptions, Session};
pub use streams::{PreparedStreams, Redirection, parse_target};
pub use task::{POLL_INTERVAL, Task, TaskPoller};
pub use terminal::TerminalGuard;
