//! Opcode to handler routing for game packets.
//!
//! Each handler receives the acting player's context and a reader over its
//! own payload only. Errors and panics are reported to the dispatcher, which
//! logs them; the connection stays open and the next packet decodes
//! normally because the payload was already split off the stream.

pub mod buttons;
pub mod chat;
pub mod command;
pub mod walking;

use crate::engine::Services;
use crate::network::{IncomingPacket, SessionError};
use crate::scheduler::{panic_message, SchedulerError};
use crate::world::{Player, World, WorldError};
use log::debug;
use shared::packet::client;
use shared::{CodecError, PacketReader};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no player in slot {0}")]
    MissingPlayer(usize),

    #[error("invalid packet: {0}")]
    Invalid(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    World(#[from] WorldError),
}

/// Everything a handler may touch while processing one packet.
pub struct HandlerContext<'a> {
    pub world: &'a mut World,
    pub services: &'a Services,
    pub slot: usize,
    pub opcode: u8,
}

impl<'a> HandlerContext<'a> {
    pub fn new(world: &'a mut World, services: &'a Services, slot: usize, opcode: u8) -> Self {
        Self {
            world,
            services,
            slot,
            opcode,
        }
    }

    pub fn player(&self) -> Result<&Player, HandlerError> {
        self.world
            .player(self.slot)
            .ok_or(HandlerError::MissingPlayer(self.slot))
    }

    pub fn player_mut(&mut self) -> Result<&mut Player, HandlerError> {
        self.world
            .player_mut(self.slot)
            .ok_or(HandlerError::MissingPlayer(self.slot))
    }
}

pub trait PacketHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        reader: &mut PacketReader<'_>,
    ) -> Result<(), HandlerError>;
}

impl<F> PacketHandler for F
where
    F: Fn(&mut HandlerContext<'_>, &mut PacketReader<'_>) -> Result<(), HandlerError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        reader: &mut PacketReader<'_>,
    ) -> Result<(), HandlerError> {
        self(ctx, reader)
    }
}

/// Fixed table of 256 optional handlers, one per opcode.
pub struct HandlerRegistry {
    handlers: Vec<Option<Box<dyn PacketHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: (0..256).map(|_| None).collect(),
        }
    }

    /// A registry with every handler the server ships with.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for opcode in [
            client::IDLE,
            client::FOCUS_CHANGE,
            client::CAMERA_MOVEMENT,
            client::LOADED_REGION,
            client::ENTER_REGION,
            client::MOUSE_CLICK,
        ] {
            registry.register(opcode, ignore);
        }
        registry.register(client::IDLE_LOGOUT, idle_logout);
        registry.register(client::CHAT, chat::handle);
        registry.register(client::COMMAND, command::handle);
        registry.register(client::BUTTON_CLICK, buttons::handle);
        for opcode in [client::WALK, client::WALK_MINIMAP, client::WALK_ON_COMMAND] {
            registry.register(opcode, walking::handle);
        }
        registry
    }

    /// Installs `handler` for `opcode`, returning whether one was replaced.
    pub fn register<H: PacketHandler + 'static>(&mut self, opcode: u8, handler: H) -> bool {
        self.handlers[opcode as usize]
            .replace(Box::new(handler))
            .is_some()
    }

    pub fn is_registered(&self, opcode: u8) -> bool {
        self.handlers[opcode as usize].is_some()
    }

    /// Routes a packet to its handler. Unknown opcodes are skipped.
    pub fn dispatch(
        &self,
        ctx: &mut HandlerContext<'_>,
        packet: &IncomingPacket,
    ) -> Result<(), HandlerError> {
        let Some(handler) = &self.handlers[packet.opcode as usize] else {
            debug!(
                "Unhandled opcode {} ({} bytes) from slot {}",
                packet.opcode,
                packet.payload.len(),
                ctx.slot
            );
            return Ok(());
        };
        let mut reader = packet.reader();
        panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, &mut reader)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&payload))))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Client noise the server has no use for.
pub fn ignore(_: &mut HandlerContext<'_>, _: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    Ok(())
}

fn idle_logout(ctx: &mut HandlerContext<'_>, _: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    ctx.player()?.logout()?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_defaults_cover_known_opcodes() {
        let registry = HandlerRegistry::with_defaults();
        for opcode in [0, 3, 4, 86, 98, 103, 121, 164, 185, 202, 210, 241, 248] {
            assert!(registry.is_registered(opcode), "opcode {}", opcode);
        }
        assert!(!registry.is_registered(1));
    }

    #[test]
    fn test_unknown_opcode_is_skipped() {
        let fixture = Fixture::new();
        assert!(fixture.dispatch(1, &[1, 2, 3]).is_ok());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let fixture = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register(
            client::CHAT,
            |_: &mut HandlerContext<'_>, _: &mut PacketReader<'_>| -> Result<(), HandlerError> {
                panic!("broken handler")
            },
        );
        assert!(!registry.register(client::IDLE, ignore));
        assert!(registry.register(client::IDLE, ignore));

        let packet = IncomingPacket {
            opcode: client::CHAT,
            payload: Bytes::from_static(&[0, 0]),
        };
        let mut world = fixture.world.lock();
        let mut ctx = HandlerContext::new(&mut world, &fixture.services, fixture.slot, client::CHAT);
        let result = registry.dispatch(&mut ctx, &packet);
        assert!(matches!(result, Err(HandlerError::Panicked(message)) if message.contains("broken")));
    }

    #[test]
    fn test_idle_logout_requests_disconnect() {
        let fixture = Fixture::new();
        fixture.dispatch(client::IDLE_LOGOUT, &[]).unwrap();
        let world = fixture.world.lock();
        assert!(world
            .player(fixture.slot)
            .unwrap()
            .session
            .is_disconnect_requested());
    }

    #[test]
    fn test_missing_player_reported() {
        let fixture = Fixture::new();
        fixture.world.lock().unregister_player(fixture.slot);
        assert!(matches!(
            fixture.dispatch(client::IDLE_LOGOUT, &[]),
            Err(HandlerError::MissingPlayer(_))
        ));
    }
}
