//! Protocol primitives shared by the server and any client implementation:
//! buffers, the opcode keystream, packet-length tables and world coordinates.

pub mod buffer;
pub mod error;
pub mod isaac;
pub mod packet;
pub mod position;
pub mod reader;

pub use buffer::{BitWriter, ByteOrder, PacketBuffer, PacketLength, ValueType};
pub use error::CodecError;
pub use isaac::{seeds_from_keys, IsaacCipher, Keystream, SessionCiphers};
pub use packet::{inbound_length, outbound_length, OutgoingPacket, INBOUND_PACKET_LENGTHS};
pub use position::{Direction, Position, VIEW_DISTANCE};
pub use reader::{BitReader, PacketReader};

/// Length of one game tick in milliseconds.
pub const TICK_MILLIS: u64 = 600;
/// Client build the server speaks to.
pub const PROTOCOL_REVISION: u16 = 317;
/// Player slot space, slot 0 included. The last index is the update-list
/// terminator and is never occupied.
pub const MAX_PLAYERS: usize = 2048;
/// Mob registry capacity, slot 0 included.
pub const MAX_MOBS: usize = 8192;
/// Longest username the base-37 encoding can hold.
pub const MAX_NAME_LENGTH: usize = 12;
/// Byte terminating protocol strings.
pub const STRING_TERMINATOR: u8 = 10;
/// Byte terminating C-style strings.
pub const NUL_TERMINATOR: u8 = 0;

const NAME_CHARS: &[u8; 37] = b"_abcdefghijklmnopqrstuvwxyz0123456789";

/// Encodes a display name as a base-37 number. Unsupported characters are
/// written as spaces; names are truncated to [`MAX_NAME_LENGTH`].
pub fn name_to_long(name: &str) -> u64 {
    let mut value: u64 = 0;
    for c in name.chars().take(MAX_NAME_LENGTH) {
        value *= 37;
        match c {
            'A'..='Z' => value += 1 + (c as u64 - 'A' as u64),
            'a'..='z' => value += 1 + (c as u64 - 'a' as u64),
            '0'..='9' => value += 27 + (c as u64 - '0' as u64),
            _ => {}
        }
    }
    while value % 37 == 0 && value != 0 {
        value /= 37;
    }
    value
}

/// Inverse of [`name_to_long`]; produces the lowercase, underscore form.
pub fn long_to_name(mut value: u64) -> String {
    let mut chars = Vec::with_capacity(MAX_NAME_LENGTH);
    while value != 0 {
        chars.push(NAME_CHARS[(value % 37) as usize] as char);
        value /= 37;
    }
    chars.iter().rev().collect()
}

/// Formats a protocol name for display: underscores become spaces and each
/// word is capitalised.
pub fn format_name(name: &str) -> String {
    name.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
