//! Comparison verdicts and their diagnostic payload.

use super::duplicate::Duplicate;
use crate::types::Address;
use serde::Serialize;
use std::fmt;

/// How much a diagnostic weighs on the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, e.g. an accepted instruction variant
    Info,
    /// A tolerated difference
    Soft,
    /// A difference that fails the comparison
    Hard,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Soft => "soft",
            Severity::Hard => "HARD",
        };
        write!(f, "{}", s)
    }
}

/// What kind of difference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Instructions differ
    Mismatch,
    /// Immediates or displacements differ
    ValueDiff,
    /// Code address correspondence rejected
    CodeConflict,
    /// Data offset correspondence rejected
    DataConflict,
    /// Stack offset correspondence rejected
    StackConflict,
    /// Accepted through the variant dictionary
    Variant,
    /// Instructions skipped to realign the streams
    Skip,
    /// Divergence explained by a similar block elsewhere in the target
    NearMatch,
    /// Data bytes differ
    DataDiff,
    /// Compared regions have different sizes
    SizeMismatch,
    /// A reference variable has no counterpart in the target map
    MissingVariable,
}

/// Duplicate hypothesis attached to a near-match diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NearMatch {
    /// Where the similar target block starts
    pub target: Address,
    /// Edit distance in instructions
    pub distance: usize,
    /// Reference block length
    pub ref_size: usize,
    /// Target block length
    pub tgt_size: usize,
}

impl NearMatch {
    /// Attach a location to a scorer result.
    pub fn new(target: Address, dup: &Duplicate) -> Self {
        Self {
            target,
            distance: dup.distance,
            ref_size: dup.ref_size,
            tgt_size: dup.tgt_size,
        }
    }
}

/// One reported difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Weight on the verdict
    pub severity: Severity,
    /// Kind of difference
    pub kind: DiagnosticKind,
    /// Routine the difference was found in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
    /// Reference location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Address>,
    /// Target location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Address>,
    /// Reference instruction or bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_text: Option<String>,
    /// Target instruction or bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tgt_text: Option<String>,
    /// Human-readable explanation
    pub message: String,
    /// Reference lines following the difference
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ref_context: Vec<String>,
    /// Target lines following the difference
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tgt_context: Vec<String>,
    /// Similar target block, for near-matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near_match: Option<NearMatch>,
}

impl Diagnostic {
    /// A diagnostic carrying only a message.
    pub fn new(severity: Severity, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            routine: None,
            reference: None,
            target: None,
            ref_text: None,
            tgt_text: None,
            message: message.into(),
            ref_context: Vec::new(),
            tgt_context: Vec::new(),
            near_match: None,
        }
    }

    /// Replace the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the locations on both sides.
    pub fn at(mut self, reference: Address, target: Address) -> Self {
        self.reference = Some(reference);
        self.target = Some(target);
        self
    }

    /// Attach the compared texts.
    pub fn texts(mut self, reference: impl Into<String>, target: impl Into<String>) -> Self {
        self.ref_text = Some(reference.into());
        self.tgt_text = Some(target.into());
        self
    }

    /// Attach the routine name.
    pub fn in_routine(mut self, routine: Option<&str>) -> Self {
        self.routine = routine.map(str::to_string);
        self
    }

    /// Attach context lines.
    pub fn context(mut self, reference: Vec<String>, target: Vec<String>) -> Self {
        self.ref_context = reference;
        self.tgt_context = target;
        self
    }
}

/// Counters collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Instruction pairs compared
    pub instructions: usize,
    /// Routines walked
    pub routines: usize,
    /// Assembly routines not walked
    pub routines_skipped: usize,
    /// Divergences resolved by the variant dictionary
    pub variant_matches: usize,
    /// Tolerated differences
    pub soft_differences: usize,
    /// Divergences explained by a similar block
    pub near_matches: usize,
    /// Data bytes compared
    pub data_bytes: usize,
    /// Data variables compared
    pub variables: usize,
}

/// Verdict of a comparison run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    /// Whether the executables are structurally equivalent
    pub matched: bool,
    /// Differences in the order they were found
    pub diagnostics: Vec<Diagnostic>,
    /// Run counters
    pub statistics: Statistics,
}

impl ComparisonReport {
    /// Start a passing report.
    pub fn new() -> Self {
        Self {
            matched: true,
            ..Self::default()
        }
    }

    /// Record a diagnostic; a hard one fails the run.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Hard => self.matched = false,
            Severity::Soft => self.statistics.soft_differences += 1,
            Severity::Info => {}
        }
        self.diagnostics.push(diagnostic);
    }

    /// Diagnostics that failed the run.
    pub fn failures(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Hard)
    }

    /// Diagnostics of a given kind.
    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_updates_verdict() {
        let mut report = ComparisonReport::new();
        assert!(report.matched);
        report.push(Diagnostic::new(Severity::Soft, DiagnosticKind::ValueDiff, "x"));
        assert!(report.matched);
        assert_eq!(report.statistics.soft_differences, 1);
        report.push(Diagnostic::new(Severity::Hard, DiagnosticKind::Mismatch, "y"));
        assert!(!report.matched);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.of_kind(DiagnosticKind::ValueDiff).count(), 1);
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let diag = Diagnostic::new(Severity::Info, DiagnosticKind::Variant, "ok")
            .at(Address::new(0x1000, 0), Address::new(0x1000, 2));
        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("\"reference\":\"1000:0000\""));
        assert!(json.contains("\"kind\":\"variant\""));
        assert!(!json.contains("ref_context"));
        assert!(!json.contains("near_match"));
    }
}
