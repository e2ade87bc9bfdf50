//! Builders for the fixed-layout packets the server sends outside the update
//! pipeline.

use shared::packet::server;
use shared::{ByteOrder, OutgoingPacket, PacketBuffer, Position, ValueType};

/// Tells the client which slot it occupies.
pub fn initialize_player(slot: usize, member: bool) -> OutgoingPacket {
    let mut payload = PacketBuffer::with_capacity(3);
    payload
        .put_u8(member as u8, ValueType::A)
        .put_u16(slot as u16, ValueType::A, ByteOrder::Little);
    OutgoingPacket::server(server::INITIALIZE_PLAYER, payload)
}

/// Loads the map region centred on `position`.
pub fn load_region(position: &Position) -> OutgoingPacket {
    let mut payload = PacketBuffer::with_capacity(4);
    payload
        .put_u16(position.chunk_x() as u16, ValueType::A, ByteOrder::Big)
        .put_u16(position.chunk_y() as u16, ValueType::Standard, ByteOrder::Big);
    OutgoingPacket::server(server::LOAD_REGION, payload)
}

pub fn game_message(text: &str) -> OutgoingPacket {
    let mut payload = PacketBuffer::with_capacity(text.len() + 1);
    payload.put_string(text);
    OutgoingPacket::server(server::GAME_MESSAGE, payload)
}

pub fn run_energy(energy: u8) -> OutgoingPacket {
    let mut payload = PacketBuffer::with_capacity(1);
    payload.put_u8(energy, ValueType::Standard);
    OutgoingPacket::server(server::RUN_ENERGY, payload)
}

pub fn logout() -> OutgoingPacket {
    OutgoingPacket::server(server::LOGOUT, PacketBuffer::new())
}
