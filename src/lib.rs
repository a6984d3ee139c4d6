//! mzdiff - Structural comparison of DOS MZ executables
//!
//! This library compares a reference executable against a target (typically
//! a reconstruction of the reference from source) at the instruction level,
//! tolerating relocated code and data, equivalent instruction variants and
//! configurable value differences.
//!
//! # Features
//!
//! - **MZ Loading**: Parses MZ headers and applies relocations at a chosen load segment
//! - **Offset Correspondence**: Tracks code, data and stack address correspondence
//! - **Variant Tolerance**: Accepts equivalent instruction sequences (`add sp, 0x2` / `pop cx`)
//! - **Duplicate Detection**: Explains moved routines through edit distance
//! - **Data Comparison**: Compares data segments variable by variable using map files
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mzdiff::{compare_files, CompareOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let report = compare_files("GAME.EXE", "REBUILT.EXE", &CompareOptions::loose())?;
//!     println!("matched: {}", report.matched);
//!     for diag in report.failures() {
//!         println!("{}", diag.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Lower-level use
//!
//! ```rust
//! use mzdiff::{Address, Analyzer, CodeMap, CompareOptions, Executable};
//!
//! let code = vec![0x55, 0x8B, 0xEC, 0x5D, 0xC3]; // push bp; mov bp, sp; pop bp; ret
//! let reference = Executable::from_raw(code.clone(), 0x1000, Address::new(0x1000, 0));
//! let target = Executable::from_raw(code, 0x1000, Address::new(0x1000, 0));
//!
//! let analyzer = Analyzer::new(CompareOptions::strict());
//! let report = analyzer.compare_code(&reference, &target, &CodeMap::default(), None)?;
//! assert!(report.matched);
//! # Ok::<(), mzdiff::DiffError>(())
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

pub mod analysis;
pub mod architectures;
pub mod error;
pub mod formats;
pub mod formatter;
pub mod memory;
pub mod types;

pub use analysis::{
    Analyzer, CodeMap, ComparisonReport, Diagnostic, DiagnosticKind, OffsetMap, Severity,
    Statistics, VariantTable,
};
pub use error::{DiffError, Result};
pub use formats::Executable;
pub use types::{Address, CompareOptions, Offset, Routine, SOffset, Segment, SegmentType, Variable};

use std::path::Path;

/// Compare the code of two MZ files without map information.
///
/// Both files are loaded at `options.load_segment` and walked from their
/// entry points with the built-in variant dictionary.
///
/// # Example
///
/// ```rust,no_run
/// use mzdiff::{compare_files, CompareOptions};
///
/// let report = compare_files("A.EXE", "B.EXE", &CompareOptions::strict())?;
/// assert!(report.matched);
/// # Ok::<(), mzdiff::DiffError>(())
/// ```
pub fn compare_files<P: AsRef<Path>, Q: AsRef<Path>>(
    reference: P,
    target: Q,
    options: &CompareOptions,
) -> Result<ComparisonReport> {
    let reference = Executable::load(reference, options.load_segment)?;
    let target = Executable::load(target, options.load_segment)?;
    Analyzer::new(options.clone()).compare_code(&reference, &target, &CodeMap::default(), None)
}

/// Get version information for this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(!v.is_empty());
    }

    #[test]
    fn test_options() {
        let default = CompareOptions::new();
        let strict = CompareOptions::strict();
        let loose = CompareOptions::loose();

        assert_eq!(default, strict);
        assert!(strict.strict && !strict.variant);
        assert!(!loose.strict && !loose.variant);
        assert_eq!(loose.max_data, strict.max_data);
    }

    #[test]
    fn test_compare_files() {
        let dir = tempfile::tempdir().unwrap();
        // 32-byte header, one page, entry at 0000:0000
        let mut data = vec![0u8; 32];
        data[0..2].copy_from_slice(b"MZ");
        data[2..4].copy_from_slice(&37u16.to_le_bytes()); // bytes in last page
        data[4..6].copy_from_slice(&1u16.to_le_bytes()); // pages
        data[8..10].copy_from_slice(&2u16.to_le_bytes()); // header paragraphs
        data.extend_from_slice(&[0x55, 0x8B, 0xEC, 0x5D, 0xC3]);

        let a = dir.path().join("A.EXE");
        let b = dir.path().join("B.EXE");
        std::fs::write(&a, &data).unwrap();
        std::fs::write(&b, &data).unwrap();

        let report = compare_files(&a, &b, &CompareOptions::strict()).unwrap();
        assert!(report.matched);
        assert_eq!(report.statistics.instructions, 4);

        assert!(compare_files(&a, dir.path().join("missing.exe"), &CompareOptions::strict()).is_err());
    }
}
