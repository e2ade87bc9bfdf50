use super::World;
use crate::scheduler::{submit_listener, EventListener, Scheduler, SchedulerError, TaskHandle, TaskResult};
use parking_lot::Mutex;
use std::sync::Weak;

/// Runs an action once a player's movement queue has drained.
///
/// The listener only holds a weak world reference and the player's login
/// key, so it gives up quietly when the player logs out or the world is
/// dropped. It never executes inline: the world lock is usually held by the
/// code that submits it.
pub struct MovementQueueListener<F> {
    world: Weak<Mutex<World>>,
    slot: usize,
    key: u64,
    action: Option<F>,
}

impl<F> MovementQueueListener<F>
where
    F: FnOnce(&mut World, usize) -> TaskResult + Send + 'static,
{
    pub fn new(world: Weak<Mutex<World>>, slot: usize, key: u64, action: F) -> Self {
        Self {
            world,
            slot,
            key,
            action: Some(action),
        }
    }

    fn owns_slot(&self, world: &World) -> bool {
        world
            .player(self.slot)
            .map_or(false, |player| player.key == self.key)
    }
}

impl<F> EventListener for MovementQueueListener<F>
where
    F: FnOnce(&mut World, usize) -> TaskResult + Send + 'static,
{
    fn listen_for(&mut self) -> bool {
        let Some(world) = self.world.upgrade() else {
            return false;
        };
        let world = world.lock();
        self.owns_slot(&world)
            && world
                .player(self.slot)
                .map_or(false, |player| !player.core.movement.is_empty())
    }

    fn run(&mut self) -> TaskResult {
        let (Some(action), Some(world)) = (self.action.take(), self.world.upgrade()) else {
            return Ok(());
        };
        let mut world = world.lock();
        if !self.owns_slot(&world) {
            return Ok(());
        }
        action(&mut world, self.slot)
    }
}

/// Replaces the player's pending arrival action with `action`.
pub fn on_arrival<F>(
    world: &mut World,
    handle: Weak<Mutex<World>>,
    scheduler: &Scheduler,
    slot: usize,
    action: F,
) -> Result<Option<TaskHandle>, SchedulerError>
where
    F: FnOnce(&mut World, usize) -> TaskResult + Send + 'static,
{
    let Some(player) = world.player_mut(slot) else {
        return Ok(None);
    };
    if let Some(previous) = player.movement_listener.take() {
        previous.cancel_if_running();
    }
    let listener = MovementQueueListener::new(handle, slot, player.key, action);
    let task = submit_listener(scheduler, listener)?;
    player.movement_listener = Some(task.clone());
    Ok(Some(task))
}
