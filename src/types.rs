//! Core types for the comparison engine.
//!
//! This module defines the value types shared by the loader, the map files
//! and the analysis passes: segmented addresses, linear offsets, segments,
//! routines, and the options controlling a comparison run.

use crate::error::DiffError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Linear position in the flat 1 MiB real-mode address space.
pub type Offset = u32;

/// Signed offset used for data and stack references (`[0x1234]`, `[bp-0x2]`).
pub type SOffset = i32;

/// Size of one paragraph, the granularity of segment bases.
pub const PARAGRAPH_SIZE: Offset = 16;

/// Largest extent a single real-mode segment can address.
pub const SEGMENT_LIMIT: Offset = 0x10000;

/// Convert a segment value to the linear offset of its base.
pub const fn segment_to_offset(segment: u16) -> Offset {
    (segment as Offset) << 4
}

/// A segment:offset pair in the 16-bit real-mode address space.
///
/// Equality, ordering and hashing use the linear form, so `1000:0010` and
/// `1001:0000` are the same address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Address {
    /// Segment value (paragraph number)
    pub segment: u16,
    /// Offset within the segment
    pub offset: u16,
}

impl Address {
    /// Create an address from its segment and offset parts.
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// The linear offset this address resolves to.
    pub const fn linear(&self) -> Offset {
        segment_to_offset(self.segment) + self.offset as Offset
    }

    /// Move forward within the same segment, wrapping at 64 KiB like the CPU.
    pub fn advance(&self, count: u16) -> Self {
        Self::new(self.segment, self.offset.wrapping_add(count))
    }

    /// Same offset, segment moved by `delta` paragraphs (used for relocation).
    pub fn rebase(&self, delta: u16) -> Self {
        Self::new(self.segment.wrapping_add(delta), self.offset)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.linear() == other.linear()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.linear().hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.linear().cmp(&other.linear())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

impl FromStr for Address {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DiffError::InvalidAddress {
            text: s.to_string(),
        };
        let (seg, off) = s.trim().split_once(':').ok_or_else(invalid)?;
        let segment = u16::from_str_radix(seg, 16).map_err(|_| invalid())?;
        let offset = u16::from_str_radix(off, 16).map_err(|_| invalid())?;
        Ok(Self::new(segment, offset))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Classification of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentType {
    /// Executable code
    Code,
    /// Initialized or uninitialized data
    Data,
    /// Stack
    Stack,
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentType::Code => "CODE",
            SegmentType::Data => "DATA",
            SegmentType::Stack => "STACK",
        };
        write!(f, "{}", s)
    }
}

/// A named region of the address space starting at a paragraph boundary.
///
/// Its extent is implicit: it ends where the next segment starts, at the
/// 64 KiB real-mode limit, or at the end of the image, whichever comes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name from the map
    pub name: String,
    /// Segment classification
    #[serde(rename = "type")]
    pub kind: SegmentType,
    /// Segment value (paragraph number)
    pub address: u16,
}

impl Segment {
    /// Create a new segment.
    pub fn new(name: impl Into<String>, kind: SegmentType, address: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
        }
    }

    /// Linear offset of the first byte of this segment.
    pub fn start_offset(&self) -> Offset {
        segment_to_offset(self.address)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:04X}", self.name, self.kind, self.address)
    }
}

/// A routine recorded in a map file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    /// Routine name
    pub name: String,
    /// Entry point
    pub entry: Address,
    /// Last byte of the routine, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Address>,
    /// Hand-written assembly, skipped unless explicitly requested
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub assembly: bool,
}

impl Routine {
    /// Create a compiled routine with an unknown end.
    pub fn new(name: impl Into<String>, entry: Address) -> Self {
        Self {
            name: name.into(),
            entry,
            end: None,
            assembly: false,
        }
    }
}

/// A data variable recorded in a map file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Location of the first byte
    pub address: Address,
}

impl Variable {
    /// Create a new variable.
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Options controlling a comparison run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareOptions {
    /// Tolerate differing immediate values and displacements
    pub ignore_diff: bool,
    /// Do not check call targets against the code correspondence
    pub no_call: bool,
    /// Descend into routines marked as assembly in the map
    pub check_asm: bool,
    /// Suppress the statistics summary
    pub no_stats: bool,
    /// Reference instructions to skip at the first hard divergence of a routine
    pub ref_skip: usize,
    /// Target instructions to skip at the first hard divergence of a routine
    pub tgt_skip: usize,
    /// Instructions of context shown after a code divergence
    pub ctx_count: usize,
    /// Hex-dump lines of context shown around a data divergence
    pub data_ctx_count: usize,
    /// Treat offset map conflicts as divergences
    pub strict: bool,
    /// Accept registered instruction variants as equal
    pub variant: bool,
    /// Allow the reference data segment to extend past the target's
    pub ext_data: bool,
    /// Maximum fan-out of one data offset in either direction
    pub max_data: usize,
    /// Maximum duplicate distance, in percent of the reference block length
    pub dup_threshold: usize,
    /// Segment at which both executables are loaded
    pub load_segment: u16,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self::strict()
    }
}

impl CompareOptions {
    /// Default options: strict correspondence, no variants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict correspondence checking.
    pub fn strict() -> Self {
        Self {
            ignore_diff: false,
            no_call: false,
            check_asm: false,
            no_stats: false,
            ref_skip: 0,
            tgt_skip: 0,
            ctx_count: 10,
            data_ctx_count: 4,
            strict: true,
            variant: false,
            ext_data: false,
            max_data: 2,
            dup_threshold: 10,
            load_segment: 0,
        }
    }

    /// Loose checking: correspondence conflicts are reported but tolerated.
    ///
    /// Variant matching stays off; enable it separately with `variant`.
    pub fn loose() -> Self {
        Self {
            strict: false,
            ..Self::strict()
        }
    }
}
