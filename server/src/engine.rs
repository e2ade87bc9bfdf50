//! The tick loop.
//!
//! One recurring task, submitted to run immediately and then once per tick,
//! drives everything that must happen in lockstep:
//! - Network cycle: accept, read, dispatch packets to handlers, write, reap
//! - World tick: process, update and reset every entity
//!
//! Both run while holding the world lock, in that order. A tick that takes
//! longer than the tick period is reported but never skipped; the scheduler
//! catches up with back-to-back firings.

use crate::config::ServerConfig;
use crate::gateway::HostGateway;
use crate::network::Dispatcher;
use crate::scheduler::{panic_message, Schedule, Scheduler, SchedulerError, TaskHandle, TaskResult};
use crate::world::World;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Ticks between statistics log lines.
const STATS_INTERVAL: u64 = 100;
/// Weight of the newest sample in the moving average.
const AVERAGE_WEIGHT: f64 = 0.1;

/// Handles that handlers and scheduled tasks reach the rest of the server
/// through.
#[derive(Clone)]
pub struct Services {
    pub scheduler: Scheduler,
    /// Tasks lock the world through this; it never keeps the world alive.
    pub world: Weak<Mutex<World>>,
    pub gateway: Arc<HostGateway>,
    pub config: Arc<ServerConfig>,
}

impl Services {
    pub fn new(
        scheduler: Scheduler,
        world: &Arc<Mutex<World>>,
        gateway: Arc<HostGateway>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            scheduler,
            world: Arc::downgrade(world),
            gateway,
            config,
        }
    }
}

/// Cost of recent ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickStats {
    pub last: Duration,
    /// Exponential moving average in milliseconds.
    pub average_ms: f64,
    pub ticks: u64,
    /// Ticks that took longer than the tick period.
    pub overruns: u64,
}

impl TickStats {
    /// Adds one sample; returns whether it overran `period`.
    pub fn record(&mut self, elapsed: Duration, period: Duration) -> bool {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.average_ms = if self.ticks == 0 {
            sample
        } else {
            self.average_ms + AVERAGE_WEIGHT * (sample - self.average_ms)
        };
        self.last = elapsed;
        self.ticks += 1;

        let overran = elapsed > period;
        if overran {
            self.overruns += 1;
        }
        overran
    }
}

pub struct Engine {
    world: Arc<Mutex<World>>,
    dispatcher: Dispatcher,
    services: Services,
    stats: Arc<Mutex<TickStats>>,
}

impl Engine {
    pub fn new(world: Arc<Mutex<World>>, dispatcher: Dispatcher, services: Services) -> Self {
        Self {
            world,
            dispatcher,
            services,
            stats: Arc::new(Mutex::new(TickStats::default())),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    /// Shared view of the statistics, still readable after [`start`](Self::start).
    pub fn stats(&self) -> Arc<Mutex<TickStats>> {
        Arc::clone(&self.stats)
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Runs one tick: the network cycle, then the world.
    pub fn cycle(&mut self) {
        let started = Instant::now();
        {
            let mut world = self.world.lock();
            self.dispatcher.service(&mut world, &self.services);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| world.process_tick())) {
                error!("World tick panicked: {}", panic_message(&payload));
            }
        }
        let elapsed = started.elapsed();
        let period = self.services.scheduler.tick_duration();

        let mut stats = self.stats.lock();
        if stats.record(elapsed, period) {
            warn!(
                "Tick {} took {:?}, longer than the {:?} period; the server is overloaded",
                stats.ticks, elapsed, period
            );
        }
        if stats.ticks % STATS_INTERVAL == 0 {
            debug!(
                "Tick {}: last {:?}, average {:.2}ms, {} overrun(s), {} connection(s)",
                stats.ticks,
                stats.last,
                stats.average_ms,
                stats.overruns,
                self.dispatcher.connection_count()
            );
        }
    }

    /// Closes every connection. Used on shutdown before the engine is dropped.
    pub fn close_connections(&mut self) {
        let mut world = self.world.lock();
        self.dispatcher.close_all(&mut world, &self.services);
    }

    /// Hands the engine to the scheduler. The first tick runs before this
    /// returns, so the caller must not hold the world lock.
    pub fn start(self, scheduler: &Scheduler) -> Result<TaskHandle, SchedulerError> {
        let mut engine = self;
        scheduler.submit(
            Schedule::ticks(1).execute_first(),
            move |_: &TaskHandle| -> TaskResult {
                engine.cycle();
                Ok(())
            },
        )
    }
}
