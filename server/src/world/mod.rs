//! The authoritative world state and the per-tick entity pipeline
//!
//! A tick runs three phases in a fixed order:
//! - Work: every player, then every mob, advances its movement and timers
//! - Update: every player receives a region reload if needed, then its player
//!   and mob synchronization packets
//! - Reset: every entity clears its per-tick flags
//!
//! A failure or panic while processing one entity is logged and that entity
//! is unregistered once the reset phase has finished; the rest of the tick
//! continues normally.

pub mod entity;
pub mod listener;
pub mod mob;
pub mod movement;
pub mod player;
pub mod registry;
pub mod update;

pub use entity::{
    Animation, Entity, EntityCore, EntityError, EntityId, Graphic, Hit, HitType, UpdateFlag,
    UpdateFlags,
};
pub use listener::MovementQueueListener;
pub use mob::Mob;
pub use movement::{MovementQueue, Step, MAX_QUEUED_STEPS};
pub use player::{Appearance, ChatMessage, Gender, LocalEntity, Player, Rights};
pub use registry::Registry;

use crate::packets;
use crate::scheduler::panic_message;
use log::{debug, warn};
use shared::{Position, MAX_MOBS, MAX_PLAYERS};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("registry full ({0} slots)")]
    RegistryFull(usize),
}

pub struct World {
    pub players: Registry<Player>,
    pub mobs: Registry<Mob>,
    tick: u64,
    next_mob_key: u64,
}

impl World {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PLAYERS, MAX_MOBS)
    }

    /// Player capacity is clamped so the addition-list terminator slot is
    /// never handed out.
    pub fn with_capacity(players: usize, mobs: usize) -> Self {
        Self {
            players: Registry::new(players.min(update::PLAYER_TERMINATOR as usize)),
            mobs: Registry::new(mobs),
            tick: 0,
            next_mob_key: 1,
        }
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn register_player(&mut self, player: Player) -> Result<usize, WorldError> {
        let username = player.username.clone();
        let slot = self.players.register(player)?;
        debug!("Registered player '{}' in slot {}", username, slot);
        Ok(slot)
    }

    /// Removes the player in `slot` and cancels everything it scheduled.
    pub fn unregister_player(&mut self, slot: usize) -> Option<Player> {
        let mut player = self.players.unregister(slot)?;
        player.release_tasks();
        debug!("Unregistered player '{}' from slot {}", player.username, slot);
        Some(player)
    }

    /// Unregisters only if `slot` still belongs to the login identified by
    /// `key`.
    pub fn unregister_player_if(&mut self, slot: usize, key: u64) -> Option<Player> {
        match self.players.get(slot) {
            Some(player) if player.key == key => self.unregister_player(slot),
            _ => None,
        }
    }

    pub fn register_mob(&mut self, mob: Mob) -> Result<usize, WorldError> {
        self.mobs.register(mob)
    }

    /// Creates and registers a mob with a fresh identity key.
    pub fn spawn_mob(&mut self, kind: u16, position: Position, hitpoints: u8) -> Result<usize, WorldError> {
        let key = self.next_mob_key;
        self.next_mob_key += 1;
        self.register_mob(Mob::new(key, kind, position, hitpoints))
    }

    pub fn unregister_mob(&mut self, slot: usize) -> Option<Mob> {
        self.mobs.unregister(slot)
    }

    pub fn player(&self, slot: usize) -> Option<&Player> {
        self.players.get(slot)
    }

    pub fn player_mut(&mut self, slot: usize) -> Option<&mut Player> {
        self.players.get_mut(slot)
    }

    /// Looks a player up by name, ignoring case and space/underscore
    /// differences.
    pub fn find_player(&self, username: &str) -> Option<usize> {
        let wanted = normalize_name(username);
        self.players
            .iter()
            .find(|(_, player)| normalize_name(&player.username) == wanted)
            .map(|(slot, _)| slot)
    }

    /// Runs one full tick over every registered entity.
    pub fn process_tick(&mut self) {
        let mut failed = Vec::new();

        for (slot, player) in self.players.iter_mut() {
            if let Err(e) = guarded(|| player.process()) {
                warn!("Player {} failed processing: {}", slot, e);
                failed.push(EntityId::Player(slot));
            }
        }
        for (slot, mob) in self.mobs.iter_mut() {
            if let Err(e) = guarded(|| mob.process()) {
                warn!("Mob {} failed processing: {}", slot, e);
                failed.push(EntityId::Mob(slot));
            }
        }

        for slot in self.players.slots() {
            if failed.contains(&EntityId::Player(slot)) {
                continue;
            }
            if let Err(e) = self.update_player(slot) {
                warn!("Player {} failed updating: {}", slot, e);
                failed.push(EntityId::Player(slot));
            }
        }

        for (_, player) in self.players.iter_mut() {
            player.reset();
        }
        for (_, mob) in self.mobs.iter_mut() {
            mob.reset();
        }

        for id in failed {
            match id {
                EntityId::Player(slot) => {
                    if let Some(player) = self.unregister_player(slot) {
                        player.session.request_disconnect();
                    }
                }
                EntityId::Mob(slot) => {
                    self.unregister_mob(slot);
                }
            }
        }
        self.tick += 1;
    }

    fn update_player(&mut self, slot: usize) -> Result<(), EntityError> {
        let (mut local_players, mut local_mobs) = {
            let player = self
                .players
                .get_mut(slot)
                .ok_or(EntityError::Missing(EntityId::Player(slot)))?;
            if player.session.is_disconnect_requested() {
                return Ok(());
            }
            if player.region_changed {
                let position = player.core.position;
                player.region_base = Some(position);
                player.send(&packets::load_region(&position))?;
            }
            player.sync_run_energy()?;
            (
                std::mem::take(&mut player.local_players),
                std::mem::take(&mut player.local_mobs),
            )
        };

        let world: &World = self;
        let built = guarded(|| {
            let players = update::player_update(world, slot, &mut local_players);
            let mobs = update::mob_update(world, slot, &mut local_mobs);
            Ok((players, mobs))
        });

        let player = self
            .players
            .get_mut(slot)
            .ok_or(EntityError::Missing(EntityId::Player(slot)))?;
        player.local_players = local_players;
        player.local_mobs = local_mobs;

        let (players, mobs) = built?;
        for packet in players.iter().chain(mobs.iter()) {
            player.send(packet)?;
        }
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.tick)
            .field("players", &self.players.len())
            .field("mobs", &self.mobs.len())
            .finish()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Runs entity work, turning a panic into an error.
fn guarded<R>(work: impl FnOnce() -> Result<R, EntityError>) -> Result<R, EntityError> {
    panic::catch_unwind(AssertUnwindSafe(work))
        .unwrap_or_else(|payload| Err(EntityError::Panicked(panic_message(&payload))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Session;
    use shared::packet::server;
    use shared::{IsaacCipher, Keystream};

    const SPAWN: Position = Position::new(3222, 3218, 0);

    fn login(world: &mut World, key: u64, name: &str) -> usize {
        let session = Session::new(key, "127.0.0.1:1".parse().unwrap());
        session.set_cipher(IsaacCipher::new(&[key as u32; 4]));
        world
            .register_player(Player::new(key, name, SPAWN, session))
            .unwrap()
    }

    /// Decodes opcodes of everything queued on a player's session.
    fn sent_opcodes(world: &World, slot: usize, cipher: &mut IsaacCipher) -> Vec<u8> {
        let bytes = world.player(slot).unwrap().session.drain();
        let mut opcodes = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let opcode = cipher.decode_opcode(bytes[pos]);
            pos += 1;
            let len = match shared::outbound_length(opcode).unwrap() {
                shared::PacketLength::Fixed(n) => n,
                shared::PacketLength::VarByte => {
                    pos += 1;
                    bytes[pos - 1] as usize
                }
                shared::PacketLength::VarShort => {
                    pos += 2;
                    (bytes[pos - 2] as usize) << 8 | bytes[pos - 1] as usize
                }
            };
            pos += len;
            opcodes.push(opcode);
        }
        opcodes
    }

    #[test]
    fn test_first_tick_sends_region_then_updates() {
        let mut world = World::new();
        let slot = login(&mut world, 3, "first");
        let mut cipher = IsaacCipher::new(&[3; 4]);

        world.process_tick();
        assert_eq!(
            sent_opcodes(&world, slot, &mut cipher),
            vec![
                server::LOAD_REGION,
                server::RUN_ENERGY,
                server::PLAYER_UPDATE,
                server::MOB_UPDATE
            ]
        );
        assert_eq!(world.tick(), 1);

        world.process_tick();
        assert_eq!(
            sent_opcodes(&world, slot, &mut cipher),
            vec![server::PLAYER_UPDATE, server::MOB_UPDATE]
        );
        assert!(world.player(slot).unwrap().region_base.is_some());
    }

    #[test]
    fn test_reset_runs_after_updates() {
        let mut world = World::new();
        let slot = login(&mut world, 4, "anim");
        world.player_mut(slot).unwrap().core.play_animation(Animation::new(866));
        world.process_tick();
        let player = world.player(slot).unwrap();
        assert!(!player.core.needs_update());
        assert!(!player.needs_placement());
    }

    #[test]
    fn test_failing_player_unregistered_after_tick() {
        let mut world = World::new();
        let healthy = login(&mut world, 5, "healthy");
        let broken = login(&mut world, 6, "broken");
        // A session without a cipher cannot receive updates.
        world.player_mut(broken).unwrap().session = Session::new(6, "127.0.0.1:2".parse().unwrap());
        world.player_mut(healthy).unwrap().core.play_animation(Animation::new(1));

        world.process_tick();
        assert!(world.player(broken).is_none());
        let player = world.player(healthy).unwrap();
        assert!(!player.core.needs_update());
        assert_eq!(world.tick(), 1);
    }

    #[test]
    fn test_find_player_normalizes_names() {
        let mut world = World::new();
        let slot = login(&mut world, 7, "Mod Ash");
        assert_eq!(world.find_player("mod_ash"), Some(slot));
        assert_eq!(world.find_player("MOD ASH"), Some(slot));
        assert_eq!(world.find_player("other"), None);
    }

    #[test]
    fn test_unregister_if_checks_key() {
        let mut world = World::new();
        let slot = login(&mut world, 8, "keyed");
        assert!(world.unregister_player_if(slot, 9).is_none());
        assert!(world.unregister_player_if(slot, 8).is_some());
        assert!(world.player(slot).is_none());
    }

    #[test]
    fn test_spawned_mobs_get_distinct_keys() {
        let mut world = World::new();
        let a = world.spawn_mob(1, SPAWN, 5).unwrap();
        let b = world.spawn_mob(1, SPAWN, 5).unwrap();
        assert_ne!(world.mobs.get(a).unwrap().key, world.mobs.get(b).unwrap().key);
        world.process_tick();
        assert_eq!(world.mobs.len(), 2);
    }

    #[test]
    fn test_player_slots_stop_below_terminator() {
        let mut world = World::new();
        assert_eq!(world.players.capacity(), update::PLAYER_TERMINATOR as usize - 1);

        let mut last = 0;
        for key in 1..=world.players.capacity() as u64 {
            last = login(&mut world, key, &format!("p{}", key));
        }
        assert_eq!(last, update::PLAYER_TERMINATOR as usize - 1);
        assert!(world.players.is_full());
        assert!(world.player(update::PLAYER_TERMINATOR as usize).is_none());

        let session = Session::new(9_999, "127.0.0.1:1".parse().unwrap());
        let overflow = world.register_player(Player::new(9_999, "overflow", SPAWN, session));
        assert!(matches!(overflow, Err(WorldError::RegistryFull(_))));
    }
}
