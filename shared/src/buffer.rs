//! Outbound packet construction.
//!
//! [`PacketBuffer`] is byte oriented. Bit-packed sections are written through
//! a [`BitWriter`] borrowed from the buffer, so byte writes cannot interleave
//! with an open bit section.

use crate::error::CodecError;
use crate::isaac::Keystream;

/// Transformation applied to the least significant byte of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Standard,
    /// Adds 128.
    A,
    /// Negates.
    C,
    /// Subtracts from 128.
    S,
}

impl ValueType {
    pub fn apply(self, value: u8) -> u8 {
        match self {
            ValueType::Standard => value,
            ValueType::A => value.wrapping_add(128),
            ValueType::C => value.wrapping_neg(),
            ValueType::S => 128u8.wrapping_sub(value),
        }
    }

    pub fn revert(self, value: u8) -> u8 {
        match self {
            ValueType::Standard => value,
            ValueType::A => value.wrapping_sub(128),
            ValueType::C => value.wrapping_neg(),
            ValueType::S => 128u8.wrapping_sub(value),
        }
    }
}

/// Byte order of multi-byte values.
///
/// The middle orders only exist for 32-bit values; 16 and 64-bit values
/// written with them fall back to [`ByteOrder::Big`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
    /// Bytes 2, 3, 0, 1 of the big-endian layout.
    Middle,
    /// Bytes 1, 0, 3, 2 of the big-endian layout.
    InverseMiddle,
}

/// How the length of a packet is conveyed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    Fixed(usize),
    /// One length byte follows the opcode.
    VarByte,
    /// Two length bytes follow the opcode.
    VarShort,
}

impl PacketLength {
    /// Interprets an entry of a packet-length table.
    pub fn from_table(entry: i8) -> Self {
        match entry {
            -1 => PacketLength::VarByte,
            -2 => PacketLength::VarShort,
            n => PacketLength::Fixed(n.max(0) as usize),
        }
    }

    /// Number of explicit length bytes that follow the opcode.
    pub fn field_size(self) -> usize {
        match self {
            PacketLength::Fixed(_) => 0,
            PacketLength::VarByte => 1,
            PacketLength::VarShort => 2,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    open_header: Option<(usize, usize)>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            open_header: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.open_header = None;
    }

    /// Writes an obfuscated opcode for a fixed-length packet.
    pub fn put_opcode(&mut self, opcode: u8, cipher: &mut dyn Keystream) {
        self.data.push(cipher.encode_opcode(opcode));
    }

    /// Writes an opcode followed by a one-byte length placeholder.
    pub fn put_var_header(
        &mut self,
        opcode: u8,
        cipher: &mut dyn Keystream,
    ) -> Result<(), CodecError> {
        self.open_header(opcode, cipher, 1)
    }

    /// Writes an opcode followed by a two-byte length placeholder.
    pub fn put_var_short_header(
        &mut self,
        opcode: u8,
        cipher: &mut dyn Keystream,
    ) -> Result<(), CodecError> {
        self.open_header(opcode, cipher, 2)
    }

    fn open_header(
        &mut self,
        opcode: u8,
        cipher: &mut dyn Keystream,
        field: usize,
    ) -> Result<(), CodecError> {
        if self.open_header.is_some() {
            return Err(CodecError::HeaderAlreadyOpen);
        }
        self.put_opcode(opcode, cipher);
        let position = self.data.len();
        self.data.resize(position + field, 0);
        self.open_header = Some((position, field));
        Ok(())
    }

    /// Patches the length of the open variable header. Works for both
    /// header sizes.
    pub fn finish_var_header(&mut self) -> Result<(), CodecError> {
        let (position, field) = self.open_header.ok_or(CodecError::NoOpenHeader)?;
        let len = self.data.len() - position - field;
        let max = if field == 1 { u8::MAX as usize } else { u16::MAX as usize };
        if len > max {
            return Err(CodecError::LengthOverflow { len, field });
        }
        if field == 1 {
            self.data[position] = len as u8;
        } else {
            self.data[position] = (len >> 8) as u8;
            self.data[position + 1] = len as u8;
        }
        self.open_header = None;
        Ok(())
    }

    /// Alias of [`PacketBuffer::finish_var_header`] for readability at call sites.
    pub fn finish_var_short_header(&mut self) -> Result<(), CodecError> {
        self.finish_var_header()
    }

    pub fn put_u8(&mut self, value: u8, ty: ValueType) -> &mut Self {
        self.data.push(ty.apply(value));
        self
    }

    pub fn put_i8(&mut self, value: i8, ty: ValueType) -> &mut Self {
        self.put_u8(value as u8, ty)
    }

    pub fn put_u16(&mut self, value: u16, ty: ValueType, order: ByteOrder) -> &mut Self {
        let high = (value >> 8) as u8;
        let low = ty.apply(value as u8);
        match order {
            ByteOrder::Little => self.data.extend_from_slice(&[low, high]),
            _ => self.data.extend_from_slice(&[high, low]),
        }
        self
    }

    pub fn put_i16(&mut self, value: i16, ty: ValueType, order: ByteOrder) -> &mut Self {
        self.put_u16(value as u16, ty, order)
    }

    /// Writes the low 24 bits big-endian.
    pub fn put_u24(&mut self, value: u32) -> &mut Self {
        self.data
            .extend_from_slice(&[(value >> 16) as u8, (value >> 8) as u8, value as u8]);
        self
    }

    pub fn put_u32(&mut self, value: u32, ty: ValueType, order: ByteOrder) -> &mut Self {
        let b = value.to_be_bytes();
        let low = ty.apply(b[3]);
        let bytes = match order {
            ByteOrder::Big => [b[0], b[1], b[2], low],
            ByteOrder::Little => [low, b[2], b[1], b[0]],
            ByteOrder::Middle => [b[2], low, b[0], b[1]],
            ByteOrder::InverseMiddle => [b[1], b[0], low, b[2]],
        };
        self.data.extend_from_slice(&bytes);
        self
    }

    pub fn put_i32(&mut self, value: i32, ty: ValueType, order: ByteOrder) -> &mut Self {
        self.put_u32(value as u32, ty, order)
    }

    pub fn put_u64(&mut self, value: u64, ty: ValueType, order: ByteOrder) -> &mut Self {
        let mut b = value.to_be_bytes();
        b[7] = ty.apply(b[7]);
        if order == ByteOrder::Little {
            b.reverse();
        }
        self.data.extend_from_slice(&b);
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Writes the bytes in reverse order, each transformed.
    pub fn put_bytes_reverse(&mut self, bytes: &[u8], ty: ValueType) -> &mut Self {
        self.data.extend(bytes.iter().rev().map(|&b| ty.apply(b)));
        self
    }

    /// Writes a line-feed terminated string.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_terminated(value, crate::STRING_TERMINATOR)
    }

    /// Writes a null terminated string.
    pub fn put_cstring(&mut self, value: &str) -> &mut Self {
        self.put_terminated(value, crate::NUL_TERMINATOR)
    }

    fn put_terminated(&mut self, value: &str, terminator: u8) -> &mut Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(terminator);
        self
    }

    /// Opens a bit-packed section starting at the next byte boundary.
    pub fn bit_access(&mut self) -> BitWriter<'_> {
        let bit_position = self.data.len() * 8;
        BitWriter {
            data: &mut self.data,
            bit_position,
        }
    }
}

/// Bit-level view over a [`PacketBuffer`]. Dropping it returns to byte access;
/// the final partial byte is zero padded.
pub struct BitWriter<'a> {
    data: &'a mut Vec<u8>,
    bit_position: usize,
}

impl BitWriter<'_> {
    /// Writes the low `num_bits` bits of `value`, most significant bit first.
    pub fn put(&mut self, num_bits: u32, value: u32) -> &mut Self {
        debug_assert!((1..=32).contains(&num_bits));
        let mut remaining = num_bits;
        let mut byte_pos = self.bit_position >> 3;
        let mut bit_offset = 8 - (self.bit_position & 7) as u32;
        self.bit_position += num_bits as usize;

        let required = (self.bit_position + 7) / 8;
        if self.data.len() < required {
            self.data.resize(required, 0);
        }

        while remaining > bit_offset {
            let chunk = (value >> (remaining - bit_offset)) & mask(bit_offset);
            self.data[byte_pos] &= !(mask(bit_offset) as u8);
            self.data[byte_pos] |= chunk as u8;
            byte_pos += 1;
            remaining -= bit_offset;
            bit_offset = 8;
        }

        let shift = bit_offset - remaining;
        let field = (mask(remaining) << shift) as u8;
        self.data[byte_pos] &= !field;
        self.data[byte_pos] |= ((value & mask(remaining)) << shift) as u8;
        self
    }

    pub fn put_flag(&mut self, flag: bool) -> &mut Self {
        self.put(1, flag as u32)
    }

    /// Writes a signed value in two's complement truncated to `num_bits`.
    pub fn put_signed(&mut self, num_bits: u32, value: i32) -> &mut Self {
        self.put(num_bits, value as u32 & mask(num_bits))
    }
}

fn mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}
