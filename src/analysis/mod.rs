//! Structural comparison of two executables.
//!
//! The [`Analyzer`] walks the reference and the target in lockstep and
//! records every correspondence it observes in an [`OffsetMap`]. A pair of
//! instructions that cannot be reconciled directly is first checked against
//! the [`VariantTable`], then against similar code elsewhere in the target
//! (see [`duplicate`]), before it is reported as a hard mismatch.

pub mod codemap;
pub mod compare;
pub mod data;
pub mod duplicate;
pub mod offset_map;
pub mod report;
pub mod variants;

pub use codemap::{CodeMap, SegmentTable};
pub use duplicate::{edit_distance, find_duplicate, CodeBlock, Duplicate};
pub use offset_map::{BoundedMultiMap, MappingInfo, OffsetMap};
pub use report::{ComparisonReport, Diagnostic, DiagnosticKind, NearMatch, Severity, Statistics};
pub use variants::VariantTable;

use crate::types::CompareOptions;

/// Comparison driver configured for one kind of run.
#[derive(Debug, Clone)]
pub struct Analyzer {
    options: CompareOptions,
    variants: VariantTable,
}

impl Analyzer {
    /// Create an analyzer using the built-in variant dictionary.
    pub fn new(options: CompareOptions) -> Self {
        Self::with_variants(options, VariantTable::builtin())
    }

    /// Create an analyzer with a caller-supplied variant dictionary.
    pub fn with_variants(options: CompareOptions, variants: VariantTable) -> Self {
        Self { options, variants }
    }

    /// Options in effect.
    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Variant dictionary in effect.
    pub fn variants(&self) -> &VariantTable {
        &self.variants
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(CompareOptions::default())
    }
}
