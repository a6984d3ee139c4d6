//! Near-duplicate detection for relocated code.
//!
//! When positional comparison fails, the reference block may still exist in
//! the target at a different location. Blocks are compared as sequences of
//! instruction signatures (mnemonic and operand shape, no addresses), and the
//! candidate with the smallest Levenshtein distance wins. Whether that
//! distance is small enough to call it a duplicate is the caller's decision.

use crate::architectures::x86::Instruction;
use crate::types::Address;
use std::fmt;

/// Edit distance between two blocks, in instructions.
pub type Distance = usize;

/// Upper bound no computed distance can reach.
pub const MAX_DISTANCE: Distance = Distance::MAX;

/// A straight-line run of instructions reduced to signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Address of the first instruction
    pub start: Address,
    /// Instruction signatures in order
    pub signatures: Vec<String>,
}

impl CodeBlock {
    /// Build a block from decoded instructions.
    pub fn from_instructions(start: Address, instructions: &[Instruction]) -> Self {
        Self {
            start,
            signatures: instructions.iter().map(Instruction::signature).collect(),
        }
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the block holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Best duplicate hypothesis for a reference block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duplicate {
    /// Edit distance to the winning candidate
    pub distance: Distance,
    /// Reference block length
    pub ref_size: usize,
    /// Winning candidate length
    pub tgt_size: usize,
    /// Index of the winning candidate
    pub dup_idx: usize,
}

impl Duplicate {
    /// Distance relative to the reference block, in percent.
    pub fn percent(&self) -> usize {
        if self.ref_size == 0 {
            return 100;
        }
        self.distance.saturating_mul(100) / self.ref_size
    }
}

impl fmt::Display for Duplicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "distance = {}, size ref: {} tgt: {}, idx: {}",
            self.distance, self.ref_size, self.tgt_size, self.dup_idx
        )
    }
}

/// Levenshtein distance between two blocks.
pub fn edit_distance(reference: &CodeBlock, target: &CodeBlock) -> Distance {
    strsim::generic_levenshtein(&reference.signatures, &target.signatures)
}

/// Score every candidate against `reference` and keep the closest one.
///
/// Ties go to the earliest candidate. Empty blocks never qualify.
pub fn find_duplicate(reference: &CodeBlock, candidates: &[CodeBlock]) -> Option<Duplicate> {
    if reference.is_empty() {
        return None;
    }
    let mut best: Option<Duplicate> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if candidate.is_empty() {
            continue;
        }
        let distance = edit_distance(reference, candidate);
        if best.map_or(true, |b| distance < b.distance) {
            best = Some(Duplicate {
                distance,
                ref_size: reference.len(),
                tgt_size: candidate.len(),
                dup_idx: idx,
            });
        }
    }
    best
}
