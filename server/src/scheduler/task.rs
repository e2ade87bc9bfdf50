//! Task definitions and cancellation handles.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;

/// Error type returned by task bodies. Errors are logged by the scheduler and
/// never stop the timer.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;
pub type TaskResult = Result<(), TaskError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("task delay must be at least 1, got {0}")]
    InvalidDelay(u64),

    #[error("task delay {0} exceeds the maximum of {max}", max = MAX_DELAY)]
    DelayTooLong(u64),

    #[error("task {0} is already cancelled")]
    AlreadyCancelled(u64),

    #[error("chain executor '{0}' is running")]
    ChainRunning(String),

    #[error("chain executor '{0}' has nothing to run")]
    ChainEmpty(String),

    #[error("scheduler has been shut down")]
    ShutDown,
}

/// Largest delay, in units, a schedule accepts.
pub const MAX_DELAY: u64 = u32::MAX as u64;

/// A unit of deferred or recurring work.
pub trait Task: Send + 'static {
    fn execute(&mut self, handle: &TaskHandle) -> TaskResult;
}

impl<F> Task for F
where
    F: FnMut(&TaskHandle) -> TaskResult + Send + 'static,
{
    fn execute(&mut self, handle: &TaskHandle) -> TaskResult {
        self(handle)
    }
}

/// Type-erased task, for executors that hold tasks of different origins.
pub struct BoxedTask(Box<dyn Task>);

impl BoxedTask {
    pub fn new<T: Task>(task: T) -> Self {
        Self(Box::new(task))
    }
}

impl Task for BoxedTask {
    fn execute(&mut self, handle: &TaskHandle) -> TaskResult {
        self.0.execute(handle)
    }
}

impl fmt::Debug for BoxedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedTask")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Tick,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(self, tick: Duration) -> Duration {
        match self {
            TimeUnit::Tick => tick,
            TimeUnit::Second => Duration::from_millis(1_000),
            TimeUnit::Minute => Duration::from_millis(60_000),
            TimeUnit::Hour => Duration::from_millis(3_600_000),
            TimeUnit::Day => Duration::from_millis(86_400_000),
        }
    }
}

/// When and how often a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub delay: u64,
    pub unit: TimeUnit,
    /// Run the body once on the submitting thread before arming the timer.
    pub execute_first: bool,
    /// Cancel after the first timer firing.
    pub once: bool,
}

impl Schedule {
    pub fn every(delay: u64, unit: TimeUnit) -> Self {
        Self {
            delay,
            unit,
            execute_first: false,
            once: false,
        }
    }

    pub fn ticks(delay: u64) -> Self {
        Self::every(delay, TimeUnit::Tick)
    }

    pub fn once(delay: u64, unit: TimeUnit) -> Self {
        Self {
            once: true,
            ..Self::every(delay, unit)
        }
    }

    pub fn execute_first(mut self) -> Self {
        self.execute_first = true;
        self
    }

    /// Time between firings. Delays past [`MAX_DELAY`] saturate; `submit`
    /// rejects them before a timer is built.
    pub fn period(&self, tick: Duration) -> Duration {
        let delay = u32::try_from(self.delay).unwrap_or(u32::MAX);
        self.unit.duration(tick).saturating_mul(delay)
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.delay < 1 {
            return Err(SchedulerError::InvalidDelay(self.delay));
        }
        if self.delay > MAX_DELAY {
            return Err(SchedulerError::DelayTooLong(self.delay));
        }
        Ok(())
    }
}

type CancelHook = Box<dyn FnOnce(u64) + Send>;

struct TaskState {
    id: u64,
    cancelled: AtomicBool,
    armed: AtomicBool,
    timer: Mutex<Option<AbortHandle>>,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Shared cancellation token for one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            state: Arc::new(TaskState {
                id,
                cancelled: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                timer: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn is_running(&self) -> bool {
        !self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether a timer was ever armed for this task.
    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::Acquire)
    }

    /// Stops future firings. A body that is executing right now finishes
    /// normally. Cancelling before the timer is armed keeps it from ever
    /// being armed.
    pub fn cancel(&self) -> Result<(), SchedulerError> {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyCancelled(self.id()));
        }
        if let Some(timer) = self.state.timer.lock().take() {
            timer.abort();
        }
        let hooks = std::mem::take(&mut *self.state.hooks.lock());
        for hook in hooks {
            hook(self.id());
        }
        Ok(())
    }

    /// Cancels unless already cancelled.
    pub fn cancel_if_running(&self) {
        let _ = self.cancel();
    }

    /// Registers a callback run once when the task is cancelled. Runs
    /// immediately if it already is.
    pub(crate) fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        {
            let mut hooks = self.state.hooks.lock();
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self.id());
    }

    pub(crate) fn arm(&self, timer: AbortHandle) {
        self.state.armed.store(true, Ordering::Release);
        let mut slot = self.state.timer.lock();
        if self.is_cancelled() {
            timer.abort();
        } else {
            *slot = Some(timer);
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("cancelled", &self.is_cancelled())
            .field("armed", &self.is_armed())
            .finish()
    }
}
