//! Opcode tables for both directions of the game protocol.

use crate::buffer::{PacketBuffer, PacketLength};
use crate::error::CodecError;
use crate::isaac::Keystream;

/// Client-to-server opcodes the server understands.
pub mod client {
    pub const IDLE: u8 = 0;
    pub const FOCUS_CHANGE: u8 = 3;
    pub const CHAT: u8 = 4;
    pub const CAMERA_MOVEMENT: u8 = 86;
    pub const WALK_ON_COMMAND: u8 = 98;
    pub const COMMAND: u8 = 103;
    pub const LOADED_REGION: u8 = 121;
    pub const WALK: u8 = 164;
    pub const BUTTON_CLICK: u8 = 185;
    pub const IDLE_LOGOUT: u8 = 202;
    pub const ENTER_REGION: u8 = 210;
    pub const MOUSE_CLICK: u8 = 241;
    pub const WALK_MINIMAP: u8 = 248;
}

/// Server-to-client opcodes the server emits.
pub mod server {
    pub const MOB_UPDATE: u8 = 65;
    pub const LOAD_REGION: u8 = 73;
    pub const PLAYER_UPDATE: u8 = 81;
    pub const LOGOUT: u8 = 109;
    pub const RUN_ENERGY: u8 = 110;
    pub const INITIALIZE_PLAYER: u8 = 249;
    pub const GAME_MESSAGE: u8 = 253;
}

/// Payload length of every client-to-server opcode. `-1` means a one-byte
/// length follows the opcode, `-2` a two-byte length.
#[rustfmt::skip]
pub const INBOUND_PACKET_LENGTHS: [i8; 256] = [
    0, 0, 0, 1, -1, 0, 0, 0, 0, 0,      // 0
    0, 0, 0, 0, 8, 0, 6, 2, 2, 0,       // 10
    0, 2, 0, 6, 0, 12, 0, 0, 0, 0,      // 20
    0, 0, 0, 0, 0, 8, 4, 0, 0, 2,       // 30
    2, 6, 0, 6, 0, -1, 0, 0, 0, 0,      // 40
    0, 0, 0, 12, 0, 0, 0, 8, 8, 12,     // 50
    8, 8, 0, 0, 0, 0, 0, 0, 0, 0,       // 60
    6, 0, 2, 2, 8, 6, 0, -1, 0, 6,      // 70
    0, 0, 0, 0, 0, 1, 4, 6, 0, 0,       // 80
    0, 0, 0, 0, 0, 3, 0, 0, -1, 0,      // 90
    0, 13, 0, -1, 0, 0, 0, 0, 0, 0,     // 100
    0, 0, 0, 0, 0, 0, 0, 6, 0, 0,       // 110
    1, 0, 6, 0, 0, 0, -1, 0, 2, 6,      // 120
    0, 4, 6, 8, 0, 6, 0, 0, 0, 2,       // 130
    0, 0, 0, 0, 0, 6, 0, 0, 0, 0,       // 140
    0, 0, 1, 2, 0, 2, 6, 0, 0, 0,       // 150
    0, 0, 0, 0, -1, -1, 0, 0, 0, 0,     // 160
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0,       // 170
    0, 8, 0, 3, 0, 2, 0, 0, 8, 1,       // 180
    0, 0, 12, 0, 0, 0, 0, 0, 0, 0,      // 190
    2, 0, 0, 0, 0, 0, 0, 0, 4, 0,       // 200
    4, 0, 0, 0, 7, 8, 0, 0, 10, 0,      // 210
    0, 0, 0, 0, 0, 0, -1, 0, 6, 0,      // 220
    1, 0, 0, 0, 6, 0, 6, 8, 1, 0,       // 230
    0, 4, 0, 0, 0, 0, -1, 0, -1, 4,     // 240
    0, 0, 6, 6, 0, 0,                   // 250
];

/// Length of an inbound packet as declared by the table.
pub fn inbound_length(opcode: u8) -> PacketLength {
    PacketLength::from_table(INBOUND_PACKET_LENGTHS[opcode as usize])
}

/// Length of a server packet, for clients framing the server stream.
pub fn outbound_length(opcode: u8) -> Option<PacketLength> {
    match opcode {
        server::MOB_UPDATE | server::PLAYER_UPDATE => Some(PacketLength::VarShort),
        server::LOAD_REGION => Some(PacketLength::Fixed(4)),
        server::LOGOUT => Some(PacketLength::Fixed(0)),
        server::RUN_ENERGY => Some(PacketLength::Fixed(1)),
        server::INITIALIZE_PLAYER => Some(PacketLength::Fixed(3)),
        server::GAME_MESSAGE => Some(PacketLength::VarByte),
        _ => None,
    }
}

/// A packet whose payload is complete but whose header has not been written.
///
/// The header is encoded only when the packet is queued on a session, so the
/// keystream advances in the same order the packets hit the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub opcode: u8,
    pub length: PacketLength,
    pub payload: Vec<u8>,
}

impl OutgoingPacket {
    pub fn new(opcode: u8, length: PacketLength, payload: PacketBuffer) -> Self {
        Self {
            opcode,
            length,
            payload: payload.into_vec(),
        }
    }

    /// Packet for a known server opcode, with the length taken from
    /// [`outbound_length`].
    pub fn server(opcode: u8, payload: PacketBuffer) -> Self {
        let length = outbound_length(opcode).unwrap_or(PacketLength::VarShort);
        Self::new(opcode, length, payload)
    }

    /// Encoded size including the header.
    pub fn wire_len(&self) -> usize {
        1 + self.length.field_size() + self.payload.len()
    }

    /// Appends header and payload to `buf`, consuming exactly one key.
    pub fn encode_into(
        &self,
        buf: &mut PacketBuffer,
        cipher: &mut dyn Keystream,
    ) -> Result<(), CodecError> {
        match self.length {
            PacketLength::Fixed(_) => {
                buf.put_opcode(self.opcode, cipher);
                buf.put_bytes(&self.payload);
            }
            PacketLength::VarByte => {
                buf.put_var_header(self.opcode, cipher)?;
                buf.put_bytes(&self.payload);
                buf.finish_var_header()?;
            }
            PacketLength::VarShort => {
                buf.put_var_short_header(self.opcode, cipher)?;
                buf.put_bytes(&self.payload);
                buf.finish_var_short_header()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ValueType;
    use crate::isaac::IsaacCipher;

    #[test]
    fn test_table_size_and_known_entries() {
        assert_eq!(INBOUND_PACKET_LENGTHS.len(), 256);
        assert_eq!(inbound_length(client::IDLE), PacketLength::Fixed(0));
        assert_eq!(inbound_length(client::CHAT), PacketLength::VarByte);
        assert_eq!(inbound_length(client::WALK), PacketLength::VarByte);
        assert_eq!(inbound_length(client::WALK_MINIMAP), PacketLength::VarByte);
        assert_eq!(inbound_length(client::BUTTON_CLICK), PacketLength::Fixed(2));
        assert_eq!(inbound_length(client::CAMERA_MOVEMENT), PacketLength::Fixed(4));
        assert_eq!(inbound_length(client::COMMAND), PacketLength::VarByte);
    }

    #[test]
    fn test_encode_var_packet() {
        let mut payload = PacketBuffer::new();
        payload.put_string("hello");
        let packet = OutgoingPacket::server(server::GAME_MESSAGE, payload);
        assert_eq!(packet.wire_len(), 8);

        let mut cipher = IsaacCipher::new(&[5, 6, 7, 8]);
        let mut reference = IsaacCipher::new(&[5, 6, 7, 8]);
        let mut buf = PacketBuffer::new();
        packet.encode_into(&mut buf, &mut cipher).unwrap();

        assert_eq!(buf.len(), 8);
        assert_eq!(reference.decode_opcode(buf.as_slice()[0]), server::GAME_MESSAGE);
        assert_eq!(buf.as_slice()[1], 6);
        assert_eq!(&buf.as_slice()[2..], b"hello\n");
    }

    #[test]
    fn test_encode_fixed_packet() {
        let mut payload = PacketBuffer::new();
        payload.put_u8(100, ValueType::Standard);
        let packet = OutgoingPacket::server(server::RUN_ENERGY, payload);

        let mut cipher = IsaacCipher::new(&[0, 0, 0, 0]);
        let mut reference = IsaacCipher::new(&[0, 0, 0, 0]);
        let mut buf = PacketBuffer::new();
        packet.encode_into(&mut buf, &mut cipher).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(reference.decode_opcode(buf.as_slice()[0]), server::RUN_ENERGY);
        assert_eq!(buf.as_slice()[1], 100);
    }
}
