//! # Tick Server Library
//!
//! This library provides the authoritative server for a tile-based multiplayer
//! game speaking a fixed-layout binary protocol over TCP. All game state lives
//! here; clients only ever see what the server describes to them each tick.
//!
//! ## Core Responsibilities
//!
//! ### Fixed-Rate Simulation
//! Everything that changes the world happens on a 600 ms tick. Incoming packets
//! are decoded and handled at the start of a tick, the world is advanced, and
//! every player is told what changed around them before the tick ends.
//!
//! ### Connection Management
//! Handles the full lifecycle of a client socket:
//! - Admission through the per-host gateway (rate limit, bans, connection cap)
//! - The login exchange and keystream setup
//! - Idle timeouts, peer closes and server-initiated logouts
//!
//! ### Deferred Work
//! A tick-aware scheduler runs recurring, one-shot and chained tasks on the
//! tokio runtime. Player-owned tasks are cancelled when the player leaves.
//!
//! ## Architecture Design
//!
//! ### Tick-Synchronous Core
//! Network I/O, packet handlers and the world update all run inside one
//! scheduled task while holding the world lock. Sockets are non-blocking and
//! touched at most once per direction per tick, so a slow client can never
//! stall the loop.
//!
//! ### Slots Instead of Pointers
//! Players and mobs live in fixed-capacity registries and are referred to by
//! slot. Anything that outlives a tick (listeners, scheduled tasks) holds a
//! slot plus the occupant's key and a weak world handle, and checks both
//! before acting.
//!
//! ## Module Organization
//!
//! ### Scheduler Module (`scheduler`)
//! Task submission, cancellation handles, controlled and chained executors
//! and event listeners.
//!
//! ### Gateway Module (`gateway`)
//! Per-host admission control shared by the accept path and admin commands.
//!
//! ### Network Module (`network`)
//! Sessions, connection framing, the login exchange and the per-tick
//! dispatcher.
//!
//! ### Handlers Module (`handlers`)
//! The opcode registry and the default packet handlers.
//!
//! ### World Module (`world`)
//! Entities, movement, registries and the player/mob update protocol.
//!
//! ### Engine Module (`engine`)
//! The tick loop and its statistics.

pub mod config;
pub mod engine;
pub mod gateway;
pub mod handlers;
pub mod network;
pub mod packets;
pub mod persistence;
pub mod scheduler;
pub mod world;

use config::{ConfigError, ServerConfig};
use engine::{Engine, Services, TickStats};
use gateway::HostGateway;
use handlers::HandlerRegistry;
use log::info;
use network::Dispatcher;
use parking_lot::Mutex;
use persistence::{PersistenceError, ShutdownHook};
use scheduler::{Scheduler, SchedulerError, TaskHandle};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use world::World;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to read ban list {path}: {source}")]
    BanList { path: PathBuf, source: io::Error },

    #[error("the engine is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// A bound server: world, gateway and engine wired together.
///
/// Call [`start`](Server::start) to hand the engine to the scheduler, or
/// drive it by hand with [`cycle`](Server::cycle).
pub struct Server {
    config: Arc<ServerConfig>,
    world: Arc<Mutex<World>>,
    scheduler: Scheduler,
    gateway: Arc<HostGateway>,
    engine: Option<Engine>,
    engine_task: Option<TaskHandle>,
    local_addr: SocketAddr,
    stats: Arc<Mutex<TickStats>>,
}

impl Server {
    pub fn bind(config: ServerConfig, scheduler: Scheduler) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.address()?;

        let gateway = Arc::new(HostGateway::new(config.gateway));
        gateway.set_restricted(config.restricted);
        if let Some(path) = &config.ban_list {
            let loaded = gateway
                .load_bans(path)
                .map_err(|source| ServerError::BanList {
                    path: path.clone(),
                    source,
                })?;
            info!("Loaded {} ban(s) from {}", loaded, path.display());
        }

        let world = Arc::new(Mutex::new(World::new()));
        let config = Arc::new(config);
        let services = Services::new(
            scheduler.clone(),
            &world,
            Arc::clone(&gateway),
            Arc::clone(&config),
        );
        let dispatcher = Dispatcher::bind(addr, HandlerRegistry::with_defaults())
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = dispatcher.local_addr();
        let engine = Engine::new(Arc::clone(&world), dispatcher, services);
        let stats = engine.stats();

        Ok(Self {
            config,
            world,
            scheduler,
            gateway,
            engine: Some(engine),
            engine_task: None,
            local_addr,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn world(&self) -> Arc<Mutex<World>> {
        Arc::clone(&self.world)
    }

    pub fn gateway(&self) -> &Arc<HostGateway> {
        &self.gateway
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> TickStats {
        *self.stats.lock()
    }

    /// The handler table, available until the engine starts.
    pub fn handlers_mut(&mut self) -> Option<&mut HandlerRegistry> {
        self.engine
            .as_mut()
            .map(|engine| engine.dispatcher_mut().handlers_mut())
    }

    /// Runs one tick on the calling thread. Does nothing once started.
    pub fn cycle(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.cycle();
        }
    }

    /// Submits the engine as a recurring task; the first tick runs before
    /// this returns.
    pub fn start(&mut self) -> Result<TaskHandle, ServerError> {
        let engine = self.engine.take().ok_or(ServerError::AlreadyStarted)?;
        let task = engine.start(&self.scheduler)?;
        info!(
            "Engine started on {} with a {:?} tick",
            self.local_addr,
            self.scheduler.tick_duration()
        );
        self.engine_task = Some(task.clone());
        Ok(task)
    }

    /// Stops the engine, runs `hook` against the final world state, then
    /// shuts the scheduler down.
    pub fn shutdown(mut self, hook: &dyn ShutdownHook) -> Result<(), ServerError> {
        if let Some(task) = self.engine_task.take() {
            task.cancel_if_running();
        }
        let saved = {
            let world = self.world.lock();
            info!(
                "Shutting down at tick {} with {} player(s) online",
                world.tick(),
                world.players.len()
            );
            hook.on_shutdown(&world)
        };
        if let Some(mut engine) = self.engine.take() {
            engine.close_connections();
        }
        self.scheduler.shutdown();
        saved?;
        Ok(())
    }
}
