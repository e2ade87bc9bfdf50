use super::task::{Schedule, SchedulerError, Task, TaskHandle, TaskResult};
use super::Scheduler;

/// Waits for a condition, then acts once.
pub trait EventListener: Send + 'static {
    /// True while the listener should keep waiting.
    fn listen_for(&mut self) -> bool;

    fn run(&mut self) -> TaskResult;
}

/// Task polling an [`EventListener`] once per firing.
pub struct ListenerTask<L>(L);

impl<L: EventListener> ListenerTask<L> {
    pub fn new(listener: L) -> Self {
        Self(listener)
    }
}

impl<L: EventListener> Task for ListenerTask<L> {
    fn execute(&mut self, handle: &TaskHandle) -> TaskResult {
        if self.0.listen_for() {
            return Ok(());
        }
        handle.cancel_if_running();
        self.0.run()
    }
}

/// Polls `listener` every tick until it stops waiting.
pub fn submit_listener<L: EventListener>(
    scheduler: &Scheduler,
    listener: L,
) -> Result<TaskHandle, SchedulerError> {
    scheduler.submit(Schedule::ticks(1), ListenerTask::new(listener))
}
