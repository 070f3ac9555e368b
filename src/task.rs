use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, Stage, Terminate, Termination};
use crate::process::{ExitStatus, Process};

/// Interval between two liveness sweeps of a [`TaskPoller`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

// Upper bound on a single sleep while waiting without a deadline, so the
// process state lock is regularly released to other observers.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// A pipeline running in the background.
///
/// Returned by [`Session::run_background`](crate::Session::run_background). A `Task`
/// is cheaply cloneable; the clone kept by the [`TaskPoller`] and the one held by the
/// caller observe the same processes.
///
/// Completion is defined by the last stage: once it has exited the task is no longer
/// alive, even if an earlier stage lingers.
#[derive(Clone)]
pub struct Task(Arc<Pipeline>);

impl Task {
    pub(crate) fn new(pipeline: Pipeline) -> Task {
        // nobody is obliged to wait for a background task, so dropping the last handle
        // must not block
        pipeline.detach();
        Task(Arc::new(pipeline))
    }

    /// Process group id of the pipeline, equal to the first stage's pid.
    pub fn pid(&self) -> u32 {
        self.0.pgid()
    }

    /// The commands of the pipeline, in order.
    pub fn commands(&self) -> Vec<&str> {
        self.0.stages().iter().map(Stage::command).collect()
    }

    pub fn stages(&self) -> &[Stage] {
        self.0.stages()
    }

    /// Exit status of the last stage, or `None` while it runs. Does not block.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.0.tail().process().poll()
    }

    /// Return code of the last stage, or `None` while it runs. Does not block.
    ///
    /// A stage killed by a signal reports the negated signal number.
    pub fn returncode(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.returncode())
    }

    /// True while the last stage has not exited. Does not block.
    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Deliver a termination request to the whole process group.
    ///
    /// `Termination::default()` asks politely with `SIGTERM`.
    pub fn kill(&self, how: Termination) -> io::Result<()> {
        self.0.terminate(how)
    }

    /// Block until every stage has exited and return the last stage's status.
    ///
    /// With a timeout, the whole wait is bounded by one deadline. If it passes, the
    /// process group is killed and [`PipelineError::Timeout`] is returned.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<ExitStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = None;
        for stage in self.0.stages() {
            match wait_until(stage.process(), deadline)? {
                Some(s) => status = Some(s),
                None => {
                    self.0.kill_and_reap();
                    return Err(PipelineError::Timeout {
                        command: stage.command().to_owned(),
                        timeout: timeout.unwrap_or_default(),
                    });
                }
            }
        }
        // stages are never empty, so the loop ran at least once
        Ok(status.unwrap_or(ExitStatus(None)))
    }

    /// Reap the stages that have exited, without blocking. Returns true once every
    /// stage has been reaped.
    fn reap(&self) -> bool {
        // no short-circuit: each exited stage is reaped on this pass
        self.0
            .stages()
            .iter()
            .fold(true, |all, stage| stage.process().poll().is_some() && all)
    }
}

// Process::wait() holds the state lock while blocked in waitpid(), which would stall a
// poller sweep over the same process. wait_timeout() sleeps without the lock.
fn wait_until(process: &Process, deadline: Option<Instant>) -> io::Result<Option<ExitStatus>> {
    loop {
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => WAIT_SLICE,
        };
        if let Some(status) = process.wait_timeout(slice)? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
    }
}

impl Terminate for Task {
    fn terminate(&self, how: Termination) -> io::Result<()> {
        self.0.terminate(how)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task(cmd=\"{}\", alive={}, pid={})",
            self.0.command_line(),
            self.is_alive(),
            self.pid()
        )
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&*self.0).finish()
    }
}

/// Background scheduler that reclaims finished [`Task`]s.
///
/// A single thread sweeps the outstanding tasks every [`POLL_INTERVAL`], reaps the
/// stages that have exited, and drops the tasks whose stages have all been reaped.
/// A task whose last stage is done no longer counts as alive, but stays tracked until
/// the stages upstream of it are reaped as well. The thread is started by the first
/// [`add`](Self::add) and exits once nothing is outstanding; a later `add` starts a
/// fresh one.
///
/// `TaskPoller` is a handle: clones share the same set of tasks. The application
/// creates one and passes it to every [`Session`](crate::Session). When the last
/// handle is dropped, tasks still outstanding are killed.
#[derive(Clone)]
pub struct TaskPoller(Arc<PollerInner>);

struct PollerInner {
    state: Mutex<PollerState>,
    interval: Duration,
}

#[derive(Default)]
struct PollerState {
    tasks: Vec<Task>,
    polling: bool,
}

impl TaskPoller {
    pub fn new() -> TaskPoller {
        TaskPoller::with_interval(POLL_INTERVAL)
    }

    /// Create a poller sweeping at a custom interval.
    pub fn with_interval(interval: Duration) -> TaskPoller {
        TaskPoller(Arc::new(PollerInner {
            state: Mutex::new(PollerState::default()),
            interval,
        }))
    }

    /// Start tracking `task`, starting the sweep thread if it isn't running.
    pub fn add(&self, task: Task) -> Task {
        let mut state = self.0.lock();
        state.tasks.push(task.clone());
        if !state.polling {
            let poller = Arc::downgrade(&self.0);
            let interval = self.0.interval;
            match thread::Builder::new()
                .name("task-poller".into())
                .spawn(move || sweep_loop(poller, interval))
            {
                Ok(_) => {
                    state.polling = true;
                    debug!("task poller started");
                }
                // the task stays tracked; the next add() tries again
                Err(e) => warn!("cannot start task poller: {e}"),
            }
        }
        task
    }

    /// Number of tasks with stages not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.0.lock().tasks.len()
    }

    /// Snapshot of the tasks with stages not yet reaped.
    pub fn tasks(&self) -> Vec<Task> {
        self.0.lock().tasks.clone()
    }

    /// True while the sweep thread is running.
    pub fn is_polling(&self) -> bool {
        self.0.lock().polling
    }
}

impl Default for TaskPoller {
    fn default() -> TaskPoller {
        TaskPoller::new()
    }
}

impl fmt::Debug for TaskPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("TaskPoller")
            .field("outstanding", &state.tasks.len())
            .field("polling", &state.polling)
            .field("interval", &self.0.interval)
            .finish()
    }
}

impl PollerInner {
    fn lock(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sweep_loop(poller: Weak<PollerInner>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(inner) = poller.upgrade() else {
            return;
        };
        let mut state = inner.lock();
        state.tasks.retain(|task| {
            if !task.reap() {
                return true;
            }
            debug!(pid = task.pid(), returncode = ?task.returncode(), "task finished");
            false
        });
        trace!(outstanding = state.tasks.len(), "task poller sweep");
        if state.tasks.is_empty() {
            state.polling = false;
            debug!("task poller stopped");
            return;
        }
    }
}

impl Drop for PollerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in state.tasks.drain(..) {
            debug!(pid = task.pid(), "killing outstanding task");
            task.0.kill_and_reap();
        }
    }
}
