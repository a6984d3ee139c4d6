//! Input file formats.
//!
//! - MZ executables (the binaries being compared)
//! - JSON map files describing their layout

pub mod mapfile;
pub mod mz;

pub use mapfile::guess_target_map;
pub use mz::{Executable, MzHeader};

/// Check whether `data` starts with an MZ signature.
pub fn is_mz(data: &[u8]) -> bool {
    data.len() >= 2 && (data[..2] == mz::MZ_SIGNATURE || data[..2] == mz::ZM_SIGNATURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mz() {
        assert!(is_mz(b"MZ\x00\x00"));
        assert!(is_mz(b"ZM"));
        assert!(!is_mz(b"M"));
        assert!(!is_mz(b"\x7FELF"));
    }
}
