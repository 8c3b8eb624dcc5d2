//! Unsigned LEB128 varints as used by the frame header.

use std::io::{self, Read};

use crate::error::TransportError;

/// Largest number of bytes a 32-bit varint may occupy.
pub const MAX_VARINT_LEN: usize = 5;

/// Returns the encoded length of `value` in bytes.
#[must_use]
pub const fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x001F_FFFF => 3,
        0x0020_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Appends `value` to `buffer`, seven bits at a time, least significant first.
pub fn encode(mut value: u32, buffer: &mut Vec<u8>) {
    while value >= 0x80 {
        buffer.push(u8::try_from(value & 0x7F).unwrap_or_default() | 0x80);
        value >>= 7;
    }
    buffer.push(u8::try_from(value).unwrap_or_default());
}

/// Reads one varint, returning the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`TransportError::Closed`] if the stream ends before the first
/// byte, [`TransportError::Io`] if it ends mid-varint, and
/// [`TransportError::VarintOverflow`] if the value does not fit in 32 bits.
pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<(u32, usize), TransportError> {
    let mut value: u32 = 0;
    for index in 0..MAX_VARINT_LEN {
        let byte = match read_byte(reader)? {
            Some(byte) => byte,
            None if index == 0 => return Err(TransportError::Closed),
            None => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a varint",
                )));
            }
        };
        let bits = u32::from(byte & 0x7F);
        let shift = 7 * u32::try_from(index).unwrap_or(u32::MAX);
        // The fifth byte may only carry the top four bits.
        if index == MAX_VARINT_LEN - 1 && bits > 0x0F {
            return Err(TransportError::VarintOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(TransportError::VarintOverflow)
}

fn read_byte<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u8>, TransportError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let [value] = byte;
                return Ok(Some(value));
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(TransportError::Io(error)),
        }
    }
}
