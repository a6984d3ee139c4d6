//! Output formatters for comparison reports.
//!
//! This module provides trait-based formatters for rendering a
//! [`ComparisonReport`] in human-readable or JSON form.

use crate::analysis::report::{ComparisonReport, Diagnostic, Severity, Statistics};
use std::path::Path;

/// Trait for formatting comparison reports.
///
/// Implementors provide methods for rendering each component of a report,
/// plus a method to render the complete report.
pub trait ReportFormatter {
    /// Format the compared file pair.
    fn format_files(&self, reference: &Path, target: &Path) -> String;

    /// Format one diagnostic.
    fn format_diagnostic(&self, diagnostic: &Diagnostic) -> Option<String>;

    /// Format the run statistics.
    fn format_statistics(&self, statistics: &Statistics) -> Option<String>;

    /// Format the final verdict.
    fn format_verdict(&self, matched: bool) -> String;

    /// Format the complete report.
    ///
    /// Default implementation concatenates all component outputs.
    fn format_report(&self, report: &ComparisonReport, reference: &Path, target: &Path) -> String {
        let mut parts = vec![self.format_files(reference, target)];
        parts.extend(
            report
                .diagnostics
                .iter()
                .filter_map(|d| self.format_diagnostic(d)),
        );
        if let Some(s) = self.format_statistics(&report.statistics) {
            parts.push(s);
        }
        parts.push(self.format_verdict(report.matched));
        parts.join("")
    }
}

/// Human-readable output formatter.
#[derive(Debug, Clone)]
pub struct HumanFormatter {
    /// Show informational diagnostics (variants, skips)
    pub verbose: bool,
    /// Print the statistics summary
    pub show_stats: bool,
}

impl Default for HumanFormatter {
    fn default() -> Self {
        Self {
            verbose: false,
            show_stats: true,
        }
    }
}

impl HumanFormatter {
    /// Create a new human formatter with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a verbose formatter.
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            ..Self::default()
        }
    }

    /// Drop the statistics summary.
    pub fn without_stats(mut self) -> Self {
        self.show_stats = false;
        self
    }
}

impl ReportFormatter for HumanFormatter {
    fn format_files(&self, reference: &Path, target: &Path) -> String {
        format!(
            "Reference: {}\nTarget:    {}\n",
            reference.display(),
            target.display()
        )
    }

    fn format_diagnostic(&self, d: &Diagnostic) -> Option<String> {
        if d.severity == Severity::Info && !self.verbose {
            return None;
        }

        let mut s = format!("  [{}] {:?}", d.severity, d.kind);
        if let Some(ref routine) = d.routine {
            s.push_str(&format!(" in {}", routine));
        }
        s.push_str(&format!(": {}\n", d.message));
        if let (Some(r), Some(t)) = (d.reference, d.target) {
            s.push_str(&format!(
                "    {}: {:<32} {}: {}\n",
                r,
                d.ref_text.as_deref().unwrap_or(""),
                t,
                d.tgt_text.as_deref().unwrap_or("")
            ));
        }
        if let Some(ref near) = d.near_match {
            s.push_str(&format!(
                "    similar block at {}: distance {}, size ref {} tgt {}\n",
                near.target, near.distance, near.ref_size, near.tgt_size
            ));
        }
        let rows = d.ref_context.len().max(d.tgt_context.len());
        for i in 0..rows {
            s.push_str(&format!(
                "      {:<48} {}\n",
                d.ref_context.get(i).map_or("", String::as_str),
                d.tgt_context.get(i).map_or("", String::as_str)
            ));
        }
        Some(s)
    }

    fn format_statistics(&self, st: &Statistics) -> Option<String> {
        if !self.show_stats {
            return None;
        }
        let mut s = String::from("Statistics:\n");
        if st.instructions > 0 || st.routines > 0 {
            s.push_str(&format!(
                "  {} instructions in {} routines ({} skipped)\n",
                st.instructions, st.routines, st.routines_skipped
            ));
            s.push_str(&format!(
                "  {} variant matches, {} near-matches\n",
                st.variant_matches, st.near_matches
            ));
        }
        if st.variables > 0 {
            s.push_str(&format!(
                "  {} data bytes in {} variables\n",
                st.data_bytes, st.variables
            ));
        }
        s.push_str(&format!("  {} soft differences\n", st.soft_differences));
        Some(s)
    }

    fn format_verdict(&self, matched: bool) -> String {
        if matched {
            String::from("Comparison result: match\n")
        } else {
            String::from("Comparison result: MISMATCH\n")
        }
    }
}

/// JSON output formatter.
#[derive(Debug, Clone)]
pub struct JsonFormatter {
    /// Pretty-print JSON
    pub pretty: bool,
    /// Include the statistics object
    pub show_stats: bool,
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self {
            pretty: true,
            show_stats: true,
        }
    }
}

impl JsonFormatter {
    /// Create a new JSON formatter with pretty printing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compact JSON formatter.
    pub fn compact() -> Self {
        Self {
            pretty: false,
            ..Self::default()
        }
    }
}

impl ReportFormatter for JsonFormatter {
    fn format_files(&self, _reference: &Path, _target: &Path) -> String {
        String::new() // Handled in format_report
    }

    fn format_diagnostic(&self, _diagnostic: &Diagnostic) -> Option<String> {
        None // Handled in format_report
    }

    fn format_statistics(&self, _statistics: &Statistics) -> Option<String> {
        None // Handled in format_report
    }

    fn format_verdict(&self, _matched: bool) -> String {
        String::new() // Handled in format_report
    }

    fn format_report(&self, report: &ComparisonReport, reference: &Path, target: &Path) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            reference: String,
            target: String,
            matched: bool,
            diagnostics: &'a [Diagnostic],
            #[serde(skip_serializing_if = "Option::is_none")]
            statistics: Option<&'a Statistics>,
        }

        let output = JsonOutput {
            reference: reference.display().to_string(),
            target: target.display().to_string(),
            matched: report.matched,
            diagnostics: &report.diagnostics,
            statistics: self.show_stats.then_some(&report.statistics),
        };

        let mut s = if self.pretty {
            serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
        } else {
            serde_json::to_string(&output).unwrap_or_else(|_| "{}".to_string())
        };
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::report::DiagnosticKind;
    use crate::types::Address;
    use std::path::PathBuf;

    fn sample_report() -> ComparisonReport {
        let mut report = ComparisonReport::new();
        report.push(
            Diagnostic::new(Severity::Info, DiagnosticKind::Variant, "accepted variant `pop cx`")
                .at(Address::new(0x1000, 3), Address::new(0x1000, 3))
                .texts("add sp, 0x2", "pop cx"),
        );
        report.push(
            Diagnostic::new(Severity::Hard, DiagnosticKind::Mismatch, "instructions differ")
                .in_routine(Some("main"))
                .at(Address::new(0x1000, 6), Address::new(0x1000, 4))
                .texts("pop bp", "pop si")
                .context(vec!["1000:0007: ret".into()], vec!["1000:0005: ret".into()]),
        );
        report.statistics.instructions = 4;
        report.statistics.routines = 1;
        report
    }

    #[test]
    fn test_human_formatter() {
        let formatter = HumanFormatter::new();
        let output = formatter.format_report(
            &sample_report(),
            &PathBuf::from("ref.exe"),
            &PathBuf::from("tgt.exe"),
        );

        assert!(output.contains("Reference: ref.exe"));
        assert!(output.contains("[HARD] Mismatch in main: instructions differ"));
        assert!(output.contains("1000:0006: pop bp"));
        assert!(output.contains("1000:0007: ret"));
        assert!(output.contains("4 instructions in 1 routines"));
        assert!(output.ends_with("Comparison result: MISMATCH\n"));
        // informational entries only in verbose mode
        assert!(!output.contains("Variant"));
    }

    #[test]
    fn test_human_formatter_verbose_without_stats() {
        let formatter = HumanFormatter::verbose().without_stats();
        let output = formatter.format_report(
            &sample_report(),
            &PathBuf::from("ref.exe"),
            &PathBuf::from("tgt.exe"),
        );

        assert!(output.contains("[info] Variant"));
        assert!(!output.contains("Statistics"));
    }

    #[test]
    fn test_json_formatter() {
        let formatter = JsonFormatter::new();
        let output = formatter.format_report(
            &sample_report(),
            &PathBuf::from("ref.exe"),
            &PathBuf::from("tgt.exe"),
        );

        assert!(output.contains("\"reference\": \"ref.exe\""));
        assert!(output.contains("\"matched\": false"));
        assert!(output.contains("\"severity\": \"hard\""));
        assert!(output.contains("\"instructions\": 4"));

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["diagnostics"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_json_formatter_compact() {
        let formatter = JsonFormatter {
            show_stats: false,
            ..JsonFormatter::compact()
        };
        let output = formatter.format_report(
            &ComparisonReport::new(),
            &PathBuf::from("a"),
            &PathBuf::from("b"),
        );
        assert_eq!(
            output,
            "{\"reference\":\"a\",\"target\":\"b\",\"matched\":true,\"diagnostics\":[]}\n"
        );
    }
}
