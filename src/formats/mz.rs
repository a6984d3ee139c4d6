//! DOS MZ executable loading.
//!
//! Only what the comparison needs is handled: the fixed header, the load
//! module and the relocation table. The load module is placed at
//! `load_segment:0000` and every relocation fixup is adjusted by the load
//! segment, the way DOS itself would do it.

use crate::architectures::x86::{self, Instruction, MAX_INSTRUCTION_LENGTH};
use crate::error::{DiffError, Result};
use crate::memory::{read_bytes, read_u16_le};
use crate::types::{segment_to_offset, Address, Offset, PARAGRAPH_SIZE};
use std::path::Path;
use tracing::debug;

/// MZ header signature.
pub const MZ_SIGNATURE: [u8; 2] = [b'M', b'Z'];
/// Alternative (obsolete) signature.
pub const ZM_SIGNATURE: [u8; 2] = [b'Z', b'M'];

/// Size of the fixed part of the MZ header.
pub const MZ_HEADER_SIZE: usize = 28;

/// Bytes per file page.
pub const PAGE_SIZE: usize = 512;

/// Fixed MZ header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MzHeader {
    /// Bytes used in the last page, zero for a full page
    pub bytes_last_page: u16,
    /// File size in 512-byte pages
    pub pages: u16,
    /// Number of relocation entries
    pub relocation_count: u16,
    /// Header size in paragraphs
    pub header_paragraphs: u16,
    /// Minimum extra paragraphs
    pub min_alloc: u16,
    /// Maximum extra paragraphs
    pub max_alloc: u16,
    /// Initial stack segment, relative to the load segment
    pub ss: u16,
    /// Initial stack pointer
    pub sp: u16,
    /// Checksum, usually zero
    pub checksum: u16,
    /// Initial instruction pointer
    pub ip: u16,
    /// Initial code segment, relative to the load segment
    pub cs: u16,
    /// File offset of the relocation table
    pub relocation_offset: u16,
    /// Overlay number
    pub overlay: u16,
}

impl MzHeader {
    /// Parse the fixed header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MZ_HEADER_SIZE {
            return Err(DiffError::TruncatedData {
                offset: 0,
                expected: MZ_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if !super::is_mz(data) {
            return Err(DiffError::InvalidSignature {
                found: data[..2].to_vec(),
            });
        }
        Ok(Self {
            bytes_last_page: read_u16_le(data, 2)?,
            pages: read_u16_le(data, 4)?,
            relocation_count: read_u16_le(data, 6)?,
            header_paragraphs: read_u16_le(data, 8)?,
            min_alloc: read_u16_le(data, 10)?,
            max_alloc: read_u16_le(data, 12)?,
            ss: read_u16_le(data, 14)?,
            sp: read_u16_le(data, 16)?,
            checksum: read_u16_le(data, 18)?,
            ip: read_u16_le(data, 20)?,
            cs: read_u16_le(data, 22)?,
            relocation_offset: read_u16_le(data, 24)?,
            overlay: read_u16_le(data, 26)?,
        })
    }

    /// File size declared by the page counts.
    pub fn file_size(&self) -> usize {
        if self.pages == 0 {
            return 0;
        }
        let last = if self.bytes_last_page > 0 {
            usize::from(self.bytes_last_page)
        } else {
            PAGE_SIZE
        };
        (usize::from(self.pages) - 1) * PAGE_SIZE + last
    }

    /// Header size in bytes.
    pub fn header_size(&self) -> usize {
        usize::from(self.header_paragraphs) * PARAGRAPH_SIZE as usize
    }
}

/// An executable image placed in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    image: Vec<u8>,
    load_segment: u16,
    entry: Address,
}

impl Executable {
    /// Load an MZ executable from a file.
    pub fn load<P: AsRef<Path>>(path: P, load_segment: u16) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        debug!(
            "loaded {} ({} bytes)",
            path.as_ref().display(),
            data.len()
        );
        Self::from_mz(&data, load_segment)
    }

    /// Parse an MZ file image and relocate it to `load_segment`.
    pub fn from_mz(data: &[u8], load_segment: u16) -> Result<Self> {
        let header = MzHeader::parse(data)?;
        let start = header.header_size();
        let declared = header.file_size();
        let end = if declared == 0 || declared > data.len() {
            data.len()
        } else {
            declared
        };
        if start > end {
            return Err(DiffError::TruncatedData {
                offset: 0,
                expected: start,
                actual: end,
            });
        }
        let mut image = data[start..end].to_vec();

        for i in 0..usize::from(header.relocation_count) {
            let entry = usize::from(header.relocation_offset) + i * 4;
            let offset = read_u16_le(data, entry)?;
            let segment = read_u16_le(data, entry + 2)?;
            let fixup = Address::new(segment, offset);
            let pos = fixup.linear() as usize;
            let value = read_u16_le(&image, pos)?.wrapping_add(load_segment);
            image[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
        }

        debug!(
            "MZ: load module {} bytes, {} relocations, entry {:04X}:{:04X}",
            image.len(),
            header.relocation_count,
            header.cs,
            header.ip
        );

        Ok(Self {
            image,
            load_segment,
            entry: Address::new(header.cs, header.ip).rebase(load_segment),
        })
    }

    /// Wrap a flat image already placed at `load_segment:0000`.
    pub fn from_raw(image: Vec<u8>, load_segment: u16, entry: Address) -> Self {
        Self {
            image,
            load_segment,
            entry,
        }
    }

    /// The loaded image bytes.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Size of the loaded image.
    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// Segment the image was loaded at.
    pub fn load_segment(&self) -> u16 {
        self.load_segment
    }

    /// Program entry point.
    pub fn entry(&self) -> Address {
        self.entry
    }

    /// Linear offset of the first image byte.
    pub fn base(&self) -> Offset {
        segment_to_offset(self.load_segment)
    }

    /// Position of a linear offset inside the image, if it is inside.
    pub fn image_offset(&self, linear: Offset) -> Option<usize> {
        let pos = linear.checked_sub(self.base())? as usize;
        (pos < self.image.len()).then_some(pos)
    }

    /// Borrow `length` image bytes starting at linear offset `linear`.
    pub fn bytes(&self, linear: Offset, length: usize) -> Result<&[u8]> {
        let pos = linear
            .checked_sub(self.base())
            .ok_or(DiffError::OutOfBounds {
                offset: linear as usize,
                length,
                size: self.image.len(),
            })?;
        read_bytes(&self.image, pos as usize, length)
    }

    /// Decode the instruction at `addr`.
    pub fn decode(&self, addr: Address) -> Result<Instruction> {
        let pos = self
            .image_offset(addr.linear())
            .ok_or(DiffError::OutOfBounds {
                offset: addr.linear() as usize,
                length: 1,
                size: self.image.len(),
            })?;
        let end = self.image.len().min(pos + MAX_INSTRUCTION_LENGTH);
        x86::decode(&self.image[pos..end], addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a one-page MZ file with a 2-paragraph header.
    fn build_mz(code: &[u8], relocs: &[(u16, u16)], cs: u16, ip: u16) -> Vec<u8> {
        let mut data = vec![0u8; 32];
        data[0..2].copy_from_slice(&MZ_SIGNATURE);
        let total = 32 + code.len();
        data[2..4].copy_from_slice(&((total % PAGE_SIZE) as u16).to_le_bytes());
        data[4..6].copy_from_slice(&((total / PAGE_SIZE + 1) as u16).to_le_bytes());
        data[6..8].copy_from_slice(&(relocs.len() as u16).to_le_bytes());
        data[8..10].copy_from_slice(&2u16.to_le_bytes());
        data[20..22].copy_from_slice(&ip.to_le_bytes());
        data[22..24].copy_from_slice(&cs.to_le_bytes());
        data[24..26].copy_from_slice(&28u16.to_le_bytes());
        assert!(relocs.len() <= 1, "header only has room for one relocation");
        for (i, (off, seg)) in relocs.iter().enumerate() {
            let at = 28 + i * 4;
            data[at..at + 2].copy_from_slice(&off.to_le_bytes());
            data[at + 2..at + 4].copy_from_slice(&seg.to_le_bytes());
        }
        data.extend_from_slice(code);
        data
    }

    #[test]
    fn test_parse_header() {
        let data = build_mz(&[0xC3], &[], 0, 0);
        let header = MzHeader::parse(&data).unwrap();
        assert_eq!(header.header_size(), 32);
        assert_eq!(header.file_size(), 33);
    }

    #[test]
    fn test_accepts_zm_signature() {
        let mut data = build_mz(&[0xC3], &[], 0, 0);
        data[0..2].copy_from_slice(&ZM_SIGNATURE);
        assert_eq!(MzHeader::parse(&data).unwrap().file_size(), 33);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut data = build_mz(&[0xC3], &[], 0, 0);
        data[0] = b'X';
        assert!(matches!(
            MzHeader::parse(&data),
            Err(DiffError::InvalidSignature { .. })
        ));
        assert!(matches!(
            MzHeader::parse(&data[..10]),
            Err(DiffError::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_load_and_relocate() {
        // mov ax, 0x0001 (segment fixup at offset 1); ret
        let code = [0xB8, 0x01, 0x00, 0xC3];
        let data = build_mz(&code, &[(1, 0)], 0, 0);
        let exe = Executable::from_mz(&data, 0x1000).unwrap();
        assert_eq!(exe.size(), 4);
        assert_eq!(exe.image()[1..3], [0x01, 0x10]);
        assert_eq!(exe.entry(), Address::new(0x1000, 0));
        assert_eq!(exe.decode(exe.entry()).unwrap().to_string(), "mov ax, 0x1001");
    }

    #[test]
    fn test_relocation_out_of_image() {
        let data = build_mz(&[0xC3], &[(0x10, 0)], 0, 0);
        assert!(matches!(
            Executable::from_mz(&data, 0),
            Err(DiffError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_header_larger_than_file() {
        let mut data = build_mz(&[], &[], 0, 0);
        data[8..10].copy_from_slice(&0x100u16.to_le_bytes());
        assert!(Executable::from_mz(&data, 0).is_err());
    }

    #[test]
    fn test_bounds_checked_access() {
        let exe = Executable::from_raw(vec![0x90, 0xC3], 0x1000, Address::new(0x1000, 0));
        assert_eq!(exe.bytes(0x10000, 2).unwrap(), &[0x90, 0xC3]);
        assert!(exe.bytes(0x10001, 2).is_err());
        assert!(exe.bytes(0xFFFF, 1).is_err());
        assert!(exe.decode(Address::new(0x1000, 2)).is_err());
        assert!(exe.decode(Address::new(0x0FFF, 0)).is_err());
        assert_eq!(exe.decode(Address::new(0x1000, 1)).unwrap().to_string(), "ret");
        assert_eq!(exe.image_offset(0x10001), Some(1));
        assert_eq!(exe.image_offset(0x10002), None);
    }
}
