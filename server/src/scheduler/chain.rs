use super::task::{Schedule, SchedulerError, TaskHandle, TaskResult, TimeUnit};
use super::Scheduler;
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One link of a chain. Runs once, `delay` units after the previous link.
pub type ChainStep = Box<dyn FnOnce() -> TaskResult + Send>;

struct Link {
    delay: u64,
    step: ChainStep,
}

#[derive(Default)]
struct ChainState {
    queue: VecDeque<Link>,
    elapsed: u64,
    running: bool,
    cancel_requested: bool,
}

enum Advance {
    Wait,
    Run(ChainStep),
    Finished,
}

impl ChainState {
    /// Advances the driver by one unit.
    fn advance(&mut self) -> Advance {
        if self.cancel_requested {
            return Advance::Finished;
        }
        let due = match self.queue.front() {
            Some(link) => link.delay,
            None => return Advance::Finished,
        };
        self.elapsed += 1;
        if self.elapsed < due {
            return Advance::Wait;
        }
        self.elapsed = 0;
        match self.queue.pop_front() {
            Some(link) => Advance::Run(link.step),
            None => Advance::Finished,
        }
    }

    fn stop(&mut self, clear: bool) {
        self.running = false;
        self.cancel_requested = false;
        self.elapsed = 0;
        if clear {
            self.queue.clear();
        }
    }
}

/// Runs queued steps one after another, each after its own delay.
///
/// The executor is driven by a single task firing once per unit. Steps
/// cannot be added while the chain runs.
pub struct ChainTaskExecutor {
    name: String,
    unit: TimeUnit,
    clear_on_shutdown: bool,
    state: Arc<Mutex<ChainState>>,
    driver: Mutex<Option<TaskHandle>>,
}

impl ChainTaskExecutor {
    pub fn new(name: impl Into<String>, unit: TimeUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            clear_on_shutdown: true,
            state: Arc::new(Mutex::new(ChainState::default())),
            driver: Mutex::new(None),
        }
    }

    /// Keeps queued steps when the chain is cancelled instead of dropping
    /// them.
    pub fn retain_on_shutdown(mut self) -> Self {
        self.clear_on_shutdown = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append<F>(&self, delay: u64, step: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        self.append_all(vec![(delay, Box::new(step) as ChainStep)])
    }

    /// Appends every step or none of them.
    pub fn append_all<I>(&self, steps: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = (u64, ChainStep)>,
    {
        let links: Vec<Link> = steps
            .into_iter()
            .map(|(delay, step)| Link { delay, step })
            .collect();
        let mut state = self.state.lock();
        if state.running {
            return Err(SchedulerError::ChainRunning(self.name.clone()));
        }
        if let Some(link) = links.iter().find(|link| link.delay < 1) {
            return Err(SchedulerError::InvalidDelay(link.delay));
        }
        state.queue.extend(links);
        Ok(())
    }

    /// Starts the driver task.
    pub fn run(&self, scheduler: &Scheduler) -> Result<TaskHandle, SchedulerError> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(SchedulerError::ChainRunning(self.name.clone()));
            }
            if state.queue.is_empty() {
                return Err(SchedulerError::ChainEmpty(self.name.clone()));
            }
            state.running = true;
            state.elapsed = 0;
            state.cancel_requested = false;
        }

        let state = Arc::clone(&self.state);
        let clear = self.clear_on_shutdown;
        let name = self.name.clone();
        let driver = move |handle: &TaskHandle| -> TaskResult { drive(&state, clear, &name, handle) };

        match scheduler.submit(Schedule::every(1, self.unit), driver) {
            Ok(handle) => {
                *self.driver.lock() = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                self.state.lock().running = false;
                Err(e)
            }
        }
    }

    /// Asks the driver to stop at its next firing.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.cancel_requested = true;
        }
    }
}

impl std::fmt::Debug for ChainTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTaskExecutor")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("queued", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// One firing of the driver.
fn drive(state: &Mutex<ChainState>, clear: bool, name: &str, handle: &TaskHandle) -> TaskResult {
    let advance = state.lock().advance();
    match advance {
        Advance::Wait => Ok(()),
        Advance::Run(step) => {
            let result = step();
            let mut state = state.lock();
            if state.queue.is_empty() {
                state.stop(clear);
                drop(state);
                handle.cancel_if_running();
                debug!("Chain '{}' finished", name);
            }
            result
        }
        Advance::Finished => {
            state.lock().stop(clear);
            handle.cancel_if_running();
            debug!("Chain '{}' stopped", name);
            Ok(())
        }
    }
}
