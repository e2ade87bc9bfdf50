//! Inbound payload decoding.

use crate::buffer::{ByteOrder, ValueType};
use crate::error::CodecError;

/// Cursor over a single packet payload. Reads never cross the end of the
/// payload, so a misbehaving handler cannot desynchronize the stream.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::Underflow {
                needed,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&self.data[start..start + needed])
    }

    pub fn get_u8(&mut self, ty: ValueType) -> Result<u8, CodecError> {
        Ok(ty.revert(self.take(1)?[0]))
    }

    pub fn get_i8(&mut self, ty: ValueType) -> Result<i8, CodecError> {
        Ok(self.get_u8(ty)? as i8)
    }

    pub fn get_u16(&mut self, ty: ValueType, order: ByteOrder) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        let (high, low) = match order {
            ByteOrder::Little => (bytes[1], bytes[0]),
            _ => (bytes[0], bytes[1]),
        };
        Ok(((high as u16) << 8) | ty.revert(low) as u16)
    }

    pub fn get_i16(&mut self, ty: ValueType, order: ByteOrder) -> Result<i16, CodecError> {
        Ok(self.get_u16(ty, order)? as i16)
    }

    pub fn get_u32(&mut self, ty: ValueType, order: ByteOrder) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        let big = match order {
            ByteOrder::Big => [b[0], b[1], b[2], ty.revert(b[3])],
            ByteOrder::Little => [b[3], b[2], b[1], ty.revert(b[0])],
            ByteOrder::Middle => [b[2], b[3], b[0], ty.revert(b[1])],
            ByteOrder::InverseMiddle => [b[1], b[0], b[3], ty.revert(b[2])],
        };
        Ok(u32::from_be_bytes(big))
    }

    pub fn get_i32(&mut self, ty: ValueType, order: ByteOrder) -> Result<i32, CodecError> {
        Ok(self.get_u32(ty, order)? as i32)
    }

    pub fn get_u64(&mut self, ty: ValueType, order: ByteOrder) -> Result<u64, CodecError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        if order == ByteOrder::Little {
            b.reverse();
        }
        b[7] = ty.revert(b[7]);
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Reads `len` bytes written back to front, reverting `ty` on each.
    pub fn get_bytes_reverse(&mut self, len: usize, ty: ValueType) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(len)?.iter().rev().map(|&b| ty.revert(b)).collect())
    }

    /// Reads a line-feed terminated string, lossily decoded.
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        self.get_terminated(crate::STRING_TERMINATOR)
    }

    /// Reads a null terminated string, lossily decoded.
    pub fn get_cstring(&mut self) -> Result<String, CodecError> {
        self.get_terminated(crate::NUL_TERMINATOR)
    }

    fn get_terminated(&mut self, terminator: u8) -> Result<String, CodecError> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or(CodecError::UnterminatedString)?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(value)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.take(len).map(|_| ())
    }

    /// Discards whatever is left of the payload.
    pub fn skip_remaining(&mut self) {
        self.pos = self.data.len();
    }

    /// Opens a bit-level view from the current byte position.
    pub fn bit_access(&mut self) -> BitReader<'_, 'a> {
        let bit_position = self.pos * 8;
        BitReader {
            reader: self,
            bit_position,
        }
    }
}

/// Bit-level view over a [`PacketReader`]. Dropping it moves the byte cursor
/// to the next boundary after the last bit read.
pub struct BitReader<'r, 'a> {
    reader: &'r mut PacketReader<'a>,
    bit_position: usize,
}

impl BitReader<'_, '_> {
    pub fn get(&mut self, num_bits: u32) -> Result<u32, CodecError> {
        debug_assert!((1..=32).contains(&num_bits));
        let end = self.bit_position + num_bits as usize;
        if end > self.reader.data.len() * 8 {
            return Err(CodecError::Underflow {
                needed: (end + 7) / 8 - self.reader.pos,
                remaining: self.reader.remaining(),
            });
        }
        let mut value = 0u32;
        for bit in self.bit_position..end {
            let byte = self.reader.data[bit >> 3];
            let set = (byte >> (7 - (bit & 7))) & 1;
            value = (value << 1) | set as u32;
        }
        self.bit_position = end;
        Ok(value)
    }

    pub fn get_flag(&mut self) -> Result<bool, CodecError> {
        Ok(self.get(1)? == 1)
    }

    /// Reads a two's complement value of `num_bits` bits.
    pub fn get_signed(&mut self, num_bits: u32) -> Result<i32, CodecError> {
        let raw = self.get(num_bits)?;
        let sign = 1u32 << (num_bits - 1);
        Ok(if raw & sign != 0 {
            raw as i32 - (sign << 1) as i32
        } else {
            raw as i32
        })
    }
}

impl Drop for BitReader<'_, '_> {
    fn drop(&mut self) {
        self.reader.pos = (self.bit_position + 7) / 8;
    }
}
