//! Timer-driven task execution on a shared worker pool
//!
//! This module provides the server's only source of deferred work:
//! - One-shot and recurring tasks in tick or wall-clock units
//! - Optional inline first execution on the submitting thread
//! - Cooperative cancellation through [`TaskHandle`]
//! - Executors that group tasks ([`ControlledTaskExecutor`]) or run them as a
//!   sequence ([`ChainTaskExecutor`])
//! - Predicate-driven [`EventListener`] tasks
//!
//! Task bodies run on the tokio runtime's worker threads. A body never runs
//! concurrently with itself, and a failing or panicking body is logged and
//! leaves the timer armed.

mod chain;
mod controlled;
mod listener;
mod task;

pub use chain::{ChainStep, ChainTaskExecutor};
pub use controlled::ControlledTaskExecutor;
pub use listener::{submit_listener, EventListener, ListenerTask};
pub use task::{
    BoxedTask, Schedule, SchedulerError, Task, TaskError, TaskHandle, TaskResult, TimeUnit,
    MAX_DELAY,
};

use dashmap::DashMap;
use log::{debug, error};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

struct SchedulerInner {
    runtime: Handle,
    tick: Duration,
    next_id: AtomicU64,
    live: DashMap<u64, TaskHandle>,
    shut_down: AtomicBool,
}

/// Submits tasks to timers on a tokio runtime.
///
/// Cloning is cheap; every clone shares the same set of live tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler whose timers run on `runtime`, with `tick` as the
    /// length of [`TimeUnit::Tick`].
    pub fn new(runtime: Handle, tick: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                runtime,
                tick,
                next_id: AtomicU64::new(1),
                live: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.inner.tick
    }

    /// Number of submitted tasks that have not been cancelled.
    pub fn live_tasks(&self) -> usize {
        self.inner.live.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Submits `task` under `schedule`.
    ///
    /// With `execute_first` the body runs once right here before the timer is
    /// armed; if that run cancels the task the timer is never armed.
    pub fn submit<T: Task>(&self, schedule: Schedule, task: T) -> Result<TaskHandle, SchedulerError> {
        schedule.validate()?;
        let handle = TaskHandle::new(self.next_id());
        self.submit_with_handle(schedule, task, handle)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submits with a handle the caller created, so executors can attach
    /// cancel hooks before the first inline run.
    pub(crate) fn submit_with_handle<T: Task>(
        &self,
        schedule: Schedule,
        task: T,
        handle: TaskHandle,
    ) -> Result<TaskHandle, SchedulerError> {
        schedule.validate()?;
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }

        self.inner.live.insert(handle.id(), handle.clone());
        let registry: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        handle.on_cancel(move |id| {
            if let Some(inner) = registry.upgrade() {
                inner.live.remove(&id);
            }
        });

        let body = Arc::new(Mutex::new(task));
        if schedule.execute_first {
            run_guarded(&body, &handle);
        }
        if handle.is_cancelled() {
            debug!("Task {} cancelled before its timer was armed", handle.id());
            return Ok(handle);
        }

        let period = schedule.period(self.inner.tick);
        let timer = self.inner.runtime.spawn(run_timer(
            body,
            handle.clone(),
            period,
            schedule.once,
        ));
        handle.arm(timer.abort_handle());
        Ok(handle)
    }

    /// Cancels every live task and refuses further submissions.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let handles: Vec<TaskHandle> = self
            .inner
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            handle.cancel_if_running();
        }
        debug!("Scheduler shut down, {} tasks cancelled", handles.len());
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick", &self.inner.tick)
            .field("live", &self.inner.live.len())
            .finish()
    }
}

/// Fixed-rate timer loop. Missed firings are caught up in a burst.
async fn run_timer<T: Task>(
    body: Arc<Mutex<T>>,
    handle: TaskHandle,
    period: Duration,
    once: bool,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    // Skip the first tick since it fires immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        if handle.is_cancelled() {
            break;
        }
        run_guarded(&body, &handle);
        if once {
            handle.cancel_if_running();
        }
        if handle.is_cancelled() {
            break;
        }
    }
}

/// Runs one firing, logging errors and panics instead of propagating them.
pub(crate) fn run_guarded<T: Task>(body: &Mutex<T>, handle: &TaskHandle) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body.lock().execute(handle)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Task {} failed: {}", handle.id(), e),
        Err(payload) => error!("Task {} panicked: {}", handle.id(), panic_message(&payload)),
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
