//! State shared by every actor in the world and the per-tick flags that
//! drive update blocks.

use super::movement::MovementQueue;
use crate::network::SessionError;
use shared::{CodecError, Direction, Position};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity panicked: {0}")]
    Panicked(String),

    #[error("{0:?} is not registered")]
    Missing(EntityId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Slot reference into one of the world registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Player(usize),
    Mob(usize),
}

impl EntityId {
    /// Index the client uses for "face entity": mobs by slot, players offset
    /// by 32768.
    pub fn face_index(self) -> u16 {
        match self {
            EntityId::Mob(slot) => slot as u16,
            EntityId::Player(slot) => (slot as u16).wrapping_add(32768),
        }
    }
}

/// Index that clears a face-entity target.
pub const FACE_RESET: u16 = 65535;

/// Something that changed this tick and must be described to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    Appearance,
    Chat,
    Graphic,
    Animation,
    ForcedChat,
    FaceEntity,
    FaceCoordinate,
    Hit,
    Hit2,
    Transform,
}

impl UpdateFlag {
    fn bit(self) -> u16 {
        1 << self as u16
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags(u16);

impl UpdateFlags {
    pub fn set(&mut self, flag: UpdateFlag) {
        self.0 |= flag.bit();
    }

    pub fn contains(&self, flag: UpdateFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Animation {
    pub id: u16,
    pub delay: u8,
}

impl Animation {
    pub fn new(id: u16) -> Self {
        Self { id, delay: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graphic {
    pub id: u16,
    pub height: u16,
    pub delay: u16,
}

impl Graphic {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            height: 0,
            delay: 0,
        }
    }

    pub fn high(id: u16) -> Self {
        Self {
            id,
            height: 100,
            delay: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitType {
    Blocked = 0,
    Normal = 1,
    Poison = 2,
    Disease = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub damage: u8,
    pub kind: HitType,
}

impl Hit {
    pub fn new(damage: u8) -> Self {
        let kind = if damage == 0 {
            HitType::Blocked
        } else {
            HitType::Normal
        };
        Self { damage, kind }
    }
}

/// Position, movement and per-tick visual state.
#[derive(Debug, Clone)]
pub struct EntityCore {
    pub slot: usize,
    pub position: Position,
    pub movement: MovementQueue,
    pub flags: UpdateFlags,
    pub walk_direction: Option<Direction>,
    pub run_direction: Option<Direction>,
    /// Set by a teleport; observers place the entity instead of walking it.
    pub teleported: bool,
    pub hitpoints: u8,
    pub max_hitpoints: u8,
    pub animation: Option<Animation>,
    pub graphic: Option<Graphic>,
    pub forced_chat: Option<String>,
    pub face_entity: Option<u16>,
    pub face_position: Option<Position>,
    pub primary_hit: Option<Hit>,
    pub secondary_hit: Option<Hit>,
}

impl EntityCore {
    pub fn new(position: Position, hitpoints: u8) -> Self {
        Self {
            slot: 0,
            position,
            movement: MovementQueue::new(),
            flags: UpdateFlags::default(),
            walk_direction: None,
            run_direction: None,
            teleported: false,
            hitpoints,
            max_hitpoints: hitpoints,
            animation: None,
            graphic: None,
            forced_chat: None,
            face_entity: None,
            face_position: None,
            primary_hit: None,
            secondary_hit: None,
        }
    }

    pub fn play_animation(&mut self, animation: Animation) {
        self.animation = Some(animation);
        self.flags.set(UpdateFlag::Animation);
    }

    pub fn play_graphic(&mut self, graphic: Graphic) {
        self.graphic = Some(graphic);
        self.flags.set(UpdateFlag::Graphic);
    }

    pub fn force_chat(&mut self, text: impl Into<String>) {
        self.forced_chat = Some(text.into());
        self.flags.set(UpdateFlag::ForcedChat);
    }

    pub fn face_entity(&mut self, target: Option<EntityId>) {
        self.face_entity = Some(target.map_or(FACE_RESET, EntityId::face_index));
        self.flags.set(UpdateFlag::FaceEntity);
    }

    pub fn face_position(&mut self, position: Position) {
        self.face_position = Some(position);
        self.flags.set(UpdateFlag::FaceCoordinate);
    }

    /// Applies damage as the first hitsplat of the tick.
    pub fn primary_hit(&mut self, hit: Hit) {
        self.hitpoints = self.hitpoints.saturating_sub(hit.damage);
        self.primary_hit = Some(hit);
        self.flags.set(UpdateFlag::Hit);
    }

    pub fn secondary_hit(&mut self, hit: Hit) {
        self.hitpoints = self.hitpoints.saturating_sub(hit.damage);
        self.secondary_hit = Some(hit);
        self.flags.set(UpdateFlag::Hit2);
    }

    /// Uses the primary splat unless it is already taken this tick.
    pub fn damage(&mut self, hit: Hit) {
        if self.flags.contains(UpdateFlag::Hit) {
            self.secondary_hit(hit);
        } else {
            self.primary_hit(hit);
        }
    }

    pub fn teleport(&mut self, position: Position) {
        self.position = position;
        self.movement.clear();
        self.teleported = true;
    }

    /// Pops this tick's walk step and, when running, a second run step.
    /// Returns whether a run step was taken.
    pub fn step(&mut self, can_run: bool) -> bool {
        let Some(walk) = self.movement.next_step() else {
            return false;
        };
        self.position = walk.position;
        self.walk_direction = Some(walk.direction);

        if can_run && self.movement.is_running() {
            if let Some(run) = self.movement.next_step() {
                self.position = run.position;
                self.run_direction = Some(run.direction);
                return true;
            }
        }
        false
    }

    pub fn needs_update(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Clears everything that only lives for one tick.
    pub fn reset(&mut self) {
        self.flags.clear();
        self.walk_direction = None;
        self.run_direction = None;
        self.teleported = false;
        self.animation = None;
        self.graphic = None;
        self.forced_chat = None;
        self.face_entity = None;
        self.face_position = None;
        self.primary_hit = None;
        self.secondary_hit = None;
    }
}

/// Behaviour every registered actor provides to the tick loop.
pub trait Entity {
    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    fn id(&self) -> EntityId;

    fn position(&self) -> Position {
        self.core().position
    }

    /// Per-tick work before updates are built.
    fn process(&mut self) -> Result<(), EntityError>;

    /// Post-update cleanup.
    fn reset(&mut self) {
        self.core_mut().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = UpdateFlags::default();
        assert!(flags.is_empty());
        flags.set(UpdateFlag::Animation);
        flags.set(UpdateFlag::Hit2);
        assert!(flags.contains(UpdateFlag::Animation));
        assert!(flags.contains(UpdateFlag::Hit2));
        assert!(!flags.contains(UpdateFlag::Chat));
        flags.clear();
        assert!(flags.is_empty());
    }

    #[test]
    fn test_damage_uses_secondary_when_primary_taken() {
        let mut core = EntityCore::new(Position::default(), 10);
        core.damage(Hit::new(3));
        core.damage(Hit::new(4));
        assert_eq!(core.primary_hit.unwrap().damage, 3);
        assert_eq!(core.secondary_hit.unwrap().damage, 4);
        assert_eq!(core.hitpoints, 3);
        core.damage(Hit::new(200));
        assert_eq!(core.hitpoints, 0);
    }

    #[test]
    fn test_reset_clears_tick_state() {
        let mut core = EntityCore::new(Position::new(3200, 3200, 0), 10);
        core.play_animation(Animation::new(866));
        core.face_entity(Some(EntityId::Player(3)));
        core.teleport(Position::new(3210, 3210, 0));
        core.reset();
        assert!(!core.needs_update());
        assert!(core.animation.is_none());
        assert!(core.face_entity.is_none());
        assert!(!core.teleported);
        assert_eq!(core.position, Position::new(3210, 3210, 0));
    }

    #[test]
    fn test_face_indices() {
        assert_eq!(EntityId::Mob(12).face_index(), 12);
        assert_eq!(EntityId::Player(12).face_index(), 32780);
        let mut core = EntityCore::new(Position::default(), 1);
        core.face_entity(None);
        assert_eq!(core.face_entity, Some(FACE_RESET));
    }

    #[test]
    fn test_step_walks_then_runs() {
        let mut core = EntityCore::new(Position::new(0, 0, 0), 10);
        core.movement.add_step(core.position, Position::new(4, 0, 0));
        assert!(!core.step(true));
        assert_eq!(core.position, Position::new(1, 0, 0));
        assert_eq!(core.walk_direction, Some(Direction::East));
        core.reset();

        core.movement.set_running(true);
        assert!(core.step(true));
        assert_eq!(core.position, Position::new(3, 0, 0));
        assert_eq!(core.run_direction, Some(Direction::East));
    }
}
