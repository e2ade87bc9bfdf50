use super::entity::{Entity, EntityCore, EntityError, EntityId, UpdateFlag};
use crate::network::{SessionError, SessionHandle};
use crate::packets;
use crate::scheduler::{BoxedTask, ControlledTaskExecutor, TaskHandle};
use serde::{Deserialize, Serialize};
use shared::{OutgoingPacket, Position};

pub const MAX_RUN_ENERGY: u8 = 100;
/// Ticks without running per point of energy regained.
const ENERGY_REGEN_TICKS: u8 = 6;
/// Local coordinates outside `[REGION_MARGIN, REGION_SPAN - REGION_MARGIN)`
/// need a new region.
const REGION_MARGIN: i32 = 16;
const REGION_SPAN: i32 = 104;
const PLAYER_HITPOINTS: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rights {
    Player = 0,
    Moderator = 1,
    Administrator = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male = 0,
    Female = 1,
}

/// Body and colour choices. Body parts are head, beard, torso, arms, hands,
/// legs and feet in that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    pub gender: Gender,
    pub body: [u16; 7],
    pub colors: [u8; 5],
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            gender: Gender::Male,
            body: [0, 10, 18, 26, 33, 36, 42],
            colors: [0; 5],
        }
    }
}

/// A public chat line, text still in the client's packed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub color: u8,
    pub effects: u8,
    pub text: Vec<u8>,
}

/// Slot plus login key of a player or mob an observer already knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEntity {
    pub slot: usize,
    pub key: u64,
}

pub struct Player {
    pub core: EntityCore,
    /// Unique per login; tells a reused slot apart from its previous owner.
    pub key: u64,
    pub username: String,
    pub rights: Rights,
    pub appearance: Appearance,
    pub combat_level: u8,
    pub chat: Option<ChatMessage>,
    pub session: SessionHandle,
    pub run_energy: u8,
    energy_sent: Option<u8>,
    regen_ticks: u8,
    /// Position the client's current region was loaded around.
    pub region_base: Option<Position>,
    pub region_changed: bool,
    pub local_players: Vec<LocalEntity>,
    pub local_mobs: Vec<LocalEntity>,
    pub movement_listener: Option<TaskHandle>,
    pub tasks: ControlledTaskExecutor<BoxedTask>,
}

impl Player {
    pub fn new(key: u64, username: impl Into<String>, position: Position, session: SessionHandle) -> Self {
        let mut core = EntityCore::new(position, PLAYER_HITPOINTS);
        core.teleported = true;
        core.flags.set(UpdateFlag::Appearance);
        Self {
            core,
            key,
            username: username.into(),
            rights: Rights::Player,
            appearance: Appearance::default(),
            combat_level: 3,
            chat: None,
            session,
            run_energy: MAX_RUN_ENERGY,
            energy_sent: None,
            regen_ticks: 0,
            region_base: None,
            region_changed: true,
            local_players: Vec::new(),
            local_mobs: Vec::new(),
            movement_listener: None,
            tasks: ControlledTaskExecutor::new(),
        }
    }

    pub fn send(&self, packet: &OutgoingPacket) -> Result<(), SessionError> {
        self.session.send(packet)
    }

    pub fn send_message(&self, text: &str) -> Result<(), SessionError> {
        self.send(&packets::game_message(text))
    }

    pub fn set_chat(&mut self, message: ChatMessage) {
        self.chat = Some(message);
        self.core.flags.set(UpdateFlag::Chat);
    }

    pub fn set_appearance(&mut self, appearance: Appearance) {
        self.appearance = appearance;
        self.core.flags.set(UpdateFlag::Appearance);
    }

    /// Whether observers must place this player instead of walking it.
    pub fn needs_placement(&self) -> bool {
        self.core.teleported || self.region_changed
    }

    /// Queues logout and closes the session once it is flushed.
    pub fn logout(&self) -> Result<(), SessionError> {
        let sent = self.send(&packets::logout());
        self.session.request_disconnect();
        sent
    }

    /// Cancels everything the player scheduled. Called on unregistration.
    pub fn release_tasks(&mut self) {
        if let Some(listener) = self.movement_listener.take() {
            listener.cancel_if_running();
        }
        self.tasks.reset();
    }

    /// Sends run energy if it changed since it was last sent.
    pub(crate) fn sync_run_energy(&mut self) -> Result<(), SessionError> {
        if self.energy_sent != Some(self.run_energy) {
            self.send(&packets::run_energy(self.run_energy))?;
            self.energy_sent = Some(self.run_energy);
        }
        Ok(())
    }

    fn update_energy(&mut self, ran: bool) {
        if ran {
            self.run_energy = self.run_energy.saturating_sub(1);
            self.regen_ticks = 0;
            if self.run_energy == 0 {
                self.core.movement.set_running(false);
            }
        } else if self.run_energy < MAX_RUN_ENERGY {
            self.regen_ticks += 1;
            if self.regen_ticks >= ENERGY_REGEN_TICKS {
                self.regen_ticks = 0;
                self.run_energy += 1;
            }
        }
    }

    fn check_region(&mut self) {
        let Some(base) = self.region_base else {
            self.region_changed = true;
            return;
        };
        let position = self.core.position;
        let local_x = position.local_x(&base);
        let local_y = position.local_y(&base);
        let inside = |coord: i32| (REGION_MARGIN..REGION_SPAN - REGION_MARGIN).contains(&coord);
        if !inside(local_x) || !inside(local_y) {
            self.region_changed = true;
        }
    }
}

impl Entity for Player {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn id(&self) -> EntityId {
        EntityId::Player(self.core.slot)
    }

    fn process(&mut self) -> Result<(), EntityError> {
        let ran = self.core.step(self.run_energy > 0);
        self.update_energy(ran);
        if self.core.movement.is_empty() {
            self.core.movement.set_run_path(false);
        }
        self.check_region();
        Ok(())
    }

    fn reset(&mut self) {
        self.core.reset();
        self.chat = None;
        self.region_changed = false;
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("slot", &self.core.slot)
            .field("username", &self.username)
            .field("position", &self.core.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Session;

    fn player_at(position: Position) -> Player {
        let session = Session::new(1, "127.0.0.1:40000".parse().unwrap());
        Player::new(1, "tester", position, session)
    }

    #[test]
    fn test_new_player_needs_placement_and_appearance() {
        let player = player_at(Position::new(3222, 3218, 0));
        assert!(player.needs_placement());
        assert!(player.core.flags.contains(UpdateFlag::Appearance));
        assert_eq!(player.run_energy, MAX_RUN_ENERGY);
    }

    #[test]
    fn test_region_reload_near_edge() {
        let start = Position::new(3222, 3218, 0);
        let mut player = player_at(start);
        player.region_base = Some(start);
        player.reset();

        // Local x starts at 54, the 34th step east reaches 88.
        player.core.movement.add_step(start, start.translate(40, 0));
        for _ in 0..33 {
            player.process().unwrap();
            assert!(!player.region_changed);
            player.reset();
        }
        player.process().unwrap();
        assert!(player.region_changed);
    }

    #[test]
    fn test_running_drains_energy() {
        let start = Position::new(3200, 3200, 0);
        let mut player = player_at(start);
        player.region_base = Some(start);
        player.core.movement.set_running(true);
        player.core.movement.add_step(start, start.translate(4, 0));

        player.process().unwrap();
        assert_eq!(player.core.position, start.translate(2, 0));
        assert_eq!(player.run_energy, MAX_RUN_ENERGY - 1);
    }

    #[test]
    fn test_exhausted_player_walks() {
        let start = Position::new(3200, 3200, 0);
        let mut player = player_at(start);
        player.region_base = Some(start);
        player.run_energy = 1;
        player.core.movement.set_running(true);
        player.core.movement.add_step(start, start.translate(6, 0));

        player.process().unwrap();
        assert_eq!(player.run_energy, 0);
        assert!(!player.core.movement.is_run_toggled());
        player.reset();
        player.process().unwrap();
        assert!(player.core.run_direction.is_none());
        assert_eq!(player.core.position, start.translate(3, 0));
    }

    #[test]
    fn test_run_energy_sent_on_change_only() {
        let mut player = player_at(Position::default());
        player.session.set_cipher(shared::IsaacCipher::new(&[0; 4]));
        player.sync_run_energy().unwrap();
        let first = player.session.drain();
        assert_eq!(first.len(), 2);
        player.sync_run_energy().unwrap();
        assert!(player.session.drain().is_empty());
    }
}
