use super::entity::{Entity, EntityCore, EntityError, EntityId, UpdateFlag};
use rand::Rng;
use shared::Position;

/// One in this many idle ticks a wandering mob picks a new tile.
const WANDER_CHANCE: u32 = 8;

/// A non-player character.
#[derive(Debug, Clone)]
pub struct Mob {
    pub core: EntityCore,
    pub key: u64,
    /// Definition id the client renders.
    pub kind: u16,
    pub spawn: Position,
    /// Tiles from spawn the mob may wander; 0 keeps it still.
    pub wander_radius: i32,
    pub transform: Option<u16>,
}

impl Mob {
    pub fn new(key: u64, kind: u16, spawn: Position, hitpoints: u8) -> Self {
        Self {
            core: EntityCore::new(spawn, hitpoints),
            key,
            kind,
            spawn,
            wander_radius: 0,
            transform: None,
        }
    }

    pub fn with_wander_radius(mut self, radius: i32) -> Self {
        self.wander_radius = radius.max(0);
        self
    }

    /// Renders the mob as another definition from now on.
    pub fn transform(&mut self, kind: u16) {
        self.kind = kind;
        self.transform = Some(kind);
        self.core.flags.set(UpdateFlag::Transform);
    }

    fn wander<R: Rng>(&mut self, rng: &mut R) {
        if self.wander_radius == 0 || !self.core.movement.is_empty() {
            return;
        }
        if !rng.gen_ratio(1, WANDER_CHANCE) {
            return;
        }
        let radius = self.wander_radius;
        let target = self
            .spawn
            .translate(rng.gen_range(-radius..=radius), rng.gen_range(-radius..=radius));
        self.core.movement.add_step(self.core.position, target);
    }
}

impl Entity for Mob {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn id(&self) -> EntityId {
        EntityId::Mob(self.core.slot)
    }

    fn process(&mut self) -> Result<(), EntityError> {
        self.wander(&mut rand::thread_rng());
        self.core.step(false);
        Ok(())
    }

    fn reset(&mut self) {
        self.core.reset();
        self.transform = None;
    }
}
