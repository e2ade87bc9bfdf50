//! Interface button clicks.

use super::{HandlerContext, HandlerError};
use crate::world::Animation;
use log::debug;
use shared::{ByteOrder, PacketReader, ValueType};

pub const WALK_BUTTON: u16 = 152;
pub const RUN_BUTTON: u16 = 153;
pub const LOGOUT_BUTTON: u16 = 2458;

/// Emote tab buttons and the animation each one plays.
const EMOTES: [(u16, u16); 12] = [
    (161, 860), // cry
    (162, 857), // think
    (163, 863), // wave
    (164, 858), // bow
    (165, 859), // angry
    (166, 866), // dance
    (167, 864), // beckon
    (168, 855), // yes
    (169, 856), // no
    (170, 861), // laugh
    (171, 862), // cheer
    (172, 865), // clap
];

pub fn emote_for(button: u16) -> Option<u16> {
    EMOTES
        .iter()
        .find(|(id, _)| *id == button)
        .map(|(_, animation)| *animation)
}

pub fn handle(ctx: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let button = reader.get_u16(ValueType::Standard, ByteOrder::Big)?;
    let player = ctx.player_mut()?;
    match button {
        WALK_BUTTON => player.core.movement.set_running(false),
        RUN_BUTTON => player.core.movement.set_running(true),
        LOGOUT_BUTTON => player.logout()?,
        _ => match emote_for(button) {
            Some(animation) => player.core.play_animation(Animation::new(animation)),
            None => debug!("Unhandled button {} from '{}'", button, player.username),
        },
    }
    Ok(())
}
