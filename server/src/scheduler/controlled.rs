use super::task::{Schedule, SchedulerError, Task, TaskHandle};
use super::Scheduler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Registry {
    tasks: Mutex<HashMap<u64, TaskHandle>>,
    resetting: AtomicBool,
}

/// Tracks every task of one kind it submitted so they can be cancelled
/// together.
///
/// A task leaves the registry when it is cancelled by any means. During
/// [`reset`](Self::reset) the sweep itself empties the registry, so cancel
/// hooks firing mid-sweep leave it alone.
pub struct ControlledTaskExecutor<T: Task> {
    registry: Arc<Registry>,
    _kind: PhantomData<fn(T)>,
}

impl<T: Task> ControlledTaskExecutor<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            _kind: PhantomData,
        }
    }

    pub fn submit(
        &self,
        scheduler: &Scheduler,
        schedule: Schedule,
        task: T,
    ) -> Result<TaskHandle, SchedulerError> {
        schedule.validate()?;
        let handle = TaskHandle::new(scheduler.next_id());
        let id = handle.id();

        self.registry.tasks.lock().insert(id, handle.clone());
        let registry = Arc::downgrade(&self.registry);
        handle.on_cancel(move |id| {
            if let Some(registry) = registry.upgrade() {
                if !registry.resetting.load(Ordering::Acquire) {
                    registry.tasks.lock().remove(&id);
                }
            }
        });

        scheduler
            .submit_with_handle(schedule, task, handle)
            .map_err(|e| {
                self.registry.tasks.lock().remove(&id);
                e
            })
    }

    /// Cancels and forgets every tracked task.
    pub fn reset(&self) {
        self.registry.resetting.store(true, Ordering::Release);
        let handles: Vec<TaskHandle> = self
            .registry
            .tasks
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.cancel_if_running();
        }
        self.registry.resetting.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.registry.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.registry.tasks.lock().contains_key(&id)
    }

    /// Snapshot of the tracked handles.
    pub fn handles(&self) -> Vec<TaskHandle> {
        self.registry.tasks.lock().values().cloned().collect()
    }
}

impl<T: Task> Default for ControlledTaskExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task> std::fmt::Debug for ControlledTaskExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledTaskExecutor")
            .field("tasks", &self.len())
            .finish()
    }
}
