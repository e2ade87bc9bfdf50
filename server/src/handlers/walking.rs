//! Walk requests from clicks on the game screen, the minimap, or as the
//! approach to another action.

use super::{HandlerContext, HandlerError};
use shared::packet::client;
use shared::{ByteOrder, PacketReader, Position, ValueType};

/// Trailing bytes the minimap variant appends after the path.
const MINIMAP_TRAILER: usize = 14;
/// Header and footer around the step deltas.
const PATH_OVERHEAD: usize = 5;

/// A decoded walk request: absolute first tile, then offsets from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkRequest {
    pub first_x: i32,
    pub first_y: i32,
    pub deltas: Vec<(i8, i8)>,
    pub run: bool,
}

impl WalkRequest {
    pub fn decode(opcode: u8, reader: &mut PacketReader<'_>) -> Result<Self, HandlerError> {
        let mut size = reader.len();
        if opcode == client::WALK_MINIMAP {
            size = size.saturating_sub(MINIMAP_TRAILER);
        }
        if size < PATH_OVERHEAD {
            return Err(HandlerError::Invalid(format!("walk payload of {} bytes", size)));
        }
        let steps = (size - PATH_OVERHEAD) / 2;

        let first_x = reader.get_u16(ValueType::A, ByteOrder::Little)? as i32;
        let mut deltas = Vec::with_capacity(steps);
        for _ in 0..steps {
            let dx = reader.get_i8(ValueType::Standard)?;
            let dy = reader.get_i8(ValueType::Standard)?;
            deltas.push((dx, dy));
        }
        let first_y = reader.get_u16(ValueType::Standard, ByteOrder::Little)? as i32;
        let run = reader.get_u8(ValueType::C)? == 1;
        reader.skip_remaining();

        Ok(Self {
            first_x,
            first_y,
            deltas,
            run,
        })
    }

    /// Absolute tiles in walking order on plane `z`.
    pub fn waypoints(&self, z: i32) -> Vec<Position> {
        let first = Position::new(self.first_x, self.first_y, z);
        std::iter::once(first)
            .chain(
                self.deltas
                    .iter()
                    .map(|&(dx, dy)| first.translate(dx as i32, dy as i32)),
            )
            .collect()
    }
}

pub fn handle(ctx: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let request = WalkRequest::decode(ctx.opcode, reader)?;
    let player = ctx.player_mut()?;

    if let Some(listener) = player.movement_listener.take() {
        listener.cancel_if_running();
    }
    let current = player.core.position;
    let movement = &mut player.core.movement;
    movement.clear();
    movement.set_run_path(request.run);
    for waypoint in request.waypoints(current.z) {
        movement.add_step(current, waypoint);
    }
    Ok(())
}
