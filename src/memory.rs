//! Bounds-checked access to raw image bytes.
//!
//! Executables handed to the comparison engine are untrusted: a truncated
//! header or a relocation entry pointing past the load module must surface as
//! [`DiffError::OutOfBounds`], never as a panic. All range arithmetic is done
//! with checked operations so that `offset + length` cannot wrap before it is
//! compared to the buffer size.

use crate::error::{DiffError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// A fixed-size value that can be decoded from the image's byte order.
///
/// MZ images are always little-endian, independent of the host.
pub trait Primitive: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

impl Primitive for u8 {
    const SIZE: usize = 1;
    fn decode(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Primitive for i8 {
    const SIZE: usize = 1;
    fn decode(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
}

impl Primitive for u16 {
    const SIZE: usize = 2;
    fn decode(bytes: &[u8]) -> Self {
        LittleEndian::read_u16(bytes)
    }
}

impl Primitive for i16 {
    const SIZE: usize = 2;
    fn decode(bytes: &[u8]) -> Self {
        LittleEndian::read_i16(bytes)
    }
}

impl Primitive for u32 {
    const SIZE: usize = 4;
    fn decode(bytes: &[u8]) -> Self {
        LittleEndian::read_u32(bytes)
    }
}

impl Primitive for i32 {
    const SIZE: usize = 4;
    fn decode(bytes: &[u8]) -> Self {
        LittleEndian::read_i32(bytes)
    }
}

/// Borrow `length` bytes at `offset`, failing if the range leaves the buffer.
pub fn read_bytes(data: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    match offset.checked_add(length) {
        Some(end) if end <= data.len() => Ok(&data[offset..end]),
        _ => Err(DiffError::OutOfBounds {
            offset,
            length,
            size: data.len(),
        }),
    }
}

/// Read a `T` at `offset`.
pub fn read<T: Primitive>(data: &[u8], offset: usize) -> Result<T> {
    read_bytes(data, offset, T::SIZE).map(T::decode)
}

/// Read a 16-bit little-endian word at `offset`.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    read_bytes(data, offset, 2).map(LittleEndian::read_u16)
}

/// Non-failing range check for speculative probes.
///
/// A missing buffer, an offset past the end, or a length running past the
/// end are all reported as `false`.
pub fn is_valid_range(data: Option<&[u8]>, offset: usize, length: usize) -> bool {
    let Some(data) = data else {
        return false;
    };
    let size = data.len();
    if offset > size {
        return false;
    }
    length <= size - offset
}

/// Saturate `offset` to the last valid index of a buffer of `size` bytes.
///
/// An empty buffer has no valid index, which is reported as out of bounds.
pub fn clamp_offset(offset: usize, size: usize) -> Result<usize> {
    if size == 0 {
        return Err(DiffError::OutOfBounds {
            offset,
            length: 0,
            size,
        });
    }
    Ok(if offset >= size { size - 1 } else { offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_little_endian() {
        let data = [0x34, 0x12, 0x78, 0x56];
        assert_eq!(read::<u16>(&data, 0).unwrap(), 0x1234);
        assert_eq!(read::<u32>(&data, 0).unwrap(), 0x5678_1234);
        assert_eq!(read::<u8>(&data, 3).unwrap(), 0x56);
        assert_eq!(read::<i16>(&[0xFE, 0xFF], 0).unwrap(), -2);
        assert_eq!(read_u16_le(&data, 2).unwrap(), 0x5678);
    }

    #[test]
    fn test_read_past_end() {
        let data = [0u8; 4];
        assert!(read::<u16>(&data, 2).is_ok());
        assert!(matches!(
            read::<u16>(&data, 3),
            Err(DiffError::OutOfBounds { offset: 3, length: 2, size: 4 })
        ));
        assert!(read::<u32>(&data, 1).is_err());
        assert!(read_u16_le(&data, 4).is_err());
        assert!(read::<u8>(&[], 0).is_err());
    }

    #[test]
    fn test_offset_overflow_is_caught() {
        let data = [0u8; 4];
        assert!(read::<u16>(&data, usize::MAX).is_err());
        assert!(read_bytes(&data, usize::MAX - 1, 4).is_err());
        assert!(!is_valid_range(Some(&data), usize::MAX, 1));
    }

    #[test]
    fn test_is_valid_range() {
        let data = [0u8; 8];
        assert!(is_valid_range(Some(&data), 0, 8));
        assert!(is_valid_range(Some(&data), 8, 0));
        assert!(!is_valid_range(Some(&data), 9, 0));
        assert!(!is_valid_range(Some(&data), 4, 5));
        assert!(!is_valid_range(None, 0, 0));
    }

    #[test]
    fn test_clamp_offset() {
        assert_eq!(clamp_offset(3, 10).unwrap(), 3);
        assert_eq!(clamp_offset(10, 10).unwrap(), 9);
        assert_eq!(clamp_offset(usize::MAX, 10).unwrap(), 9);
        assert!(clamp_offset(0, 0).is_err());
    }
}
