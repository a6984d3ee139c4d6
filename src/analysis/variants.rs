//! Instruction equivalence dictionary.
//!
//! Compilers emit different but equivalent code for the same source, e.g.
//! `pop cx` instead of `add sp, 0x2` to drop a word from the stack. The
//! table maps one canonical instruction to the sequences accepted in its
//! place. Lookup is keyed by the canonical form only: alternatives are not
//! made equivalent to each other, and no reverse entries are generated.

use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;

/// Canonical instruction text to its accepted alternative sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantTable {
    entries: HashMap<String, Vec<Vec<String>>>,
}

impl Default for VariantTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariantTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The built-in dictionary of common compiler variations.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("add sp, 0x2", [vec!["pop cx"], vec!["inc sp", "inc sp"]]);
        table.insert("add sp, 0x4", [vec!["pop cx", "pop cx"]]);
        table.insert("sub ax, ax", [vec!["xor ax, ax"]]);
        table
    }

    /// Parse a user dictionary: a JSON object of canonical text to a list
    /// of alternative sequences.
    pub fn from_json(text: &str) -> Result<Self> {
        let entries: HashMap<String, Vec<Vec<String>>> = serde_json::from_str(text)?;
        Ok(Self { entries })
    }

    /// Read a user dictionary from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Register alternatives for `canonical`, appending to existing ones.
    pub fn insert<I, S>(&mut self, canonical: impl Into<String>, alternatives: I)
    where
        I: IntoIterator<Item = Vec<S>>,
        S: Into<String>,
    {
        let slot = self.entries.entry(canonical.into()).or_default();
        for alt in alternatives {
            slot.push(alt.into_iter().map(Into::into).collect());
        }
    }

    /// Alternatives registered for `canonical`.
    pub fn alternatives(&self, canonical: &str) -> &[Vec<String>] {
        self.entries.get(canonical).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of canonical entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the longest registered alternative.
    pub fn max_alternative_len(&self) -> usize {
        self.entries
            .values()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    /// Whether `candidate` is `canonical` itself or one of its alternatives.
    pub fn matches<S: AsRef<str>>(&self, canonical: &str, candidate: &[S]) -> bool {
        if candidate.len() == 1 && candidate[0].as_ref() == canonical {
            return true;
        }
        self.alternatives(canonical)
            .iter()
            .any(|alt| same_sequence(alt, candidate))
    }

    /// Find an alternative of `canonical` at the start of `stream`.
    ///
    /// Returns the number of stream elements the longest matching
    /// alternative covers.
    pub fn match_prefix<S: AsRef<str>>(&self, canonical: &str, stream: &[S]) -> Option<usize> {
        self.alternatives(canonical)
            .iter()
            .filter(|alt| !alt.is_empty() && alt.len() <= stream.len())
            .filter(|alt| same_sequence(alt, &stream[..alt.len()]))
            .map(Vec::len)
            .max()
    }
}

fn same_sequence<S: AsRef<str>>(alt: &[String], candidate: &[S]) -> bool {
    alt.len() == candidate.len() && alt.iter().zip(candidate).all(|(a, c)| a == c.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_matches() {
        let table = VariantTable::builtin();
        assert!(table.matches("add sp, 0x2", &["pop cx"]));
        assert!(table.matches("add sp, 0x2", &["inc sp", "inc sp"]));
        assert!(table.matches("add sp, 0x2", &["add sp, 0x2"]));
        assert!(table.matches("add sp, 0x4", &["pop cx", "pop cx"]));
        assert!(table.matches("sub ax, ax", &["xor ax, ax"]));
        assert!(!table.matches("add sp, 0x2", &["pop dx"]));
        assert!(!table.matches("add sp, 0x2", &["inc sp"]));
    }

    #[test]
    fn test_no_reverse_entries() {
        let table = VariantTable::builtin();
        assert!(!table.matches("pop cx", &["add sp, 0x2"]));
        assert!(!table.matches("xor ax, ax", &["sub ax, ax"]));
        // alternatives are not equivalent to each other
        assert!(!table.matches("pop cx", &["inc sp", "inc sp"]));
    }

    #[test]
    fn test_match_prefix() {
        let table = VariantTable::builtin();
        let stream = ["inc sp", "inc sp", "ret"];
        assert_eq!(table.match_prefix("add sp, 0x2", &stream), Some(2));
        assert_eq!(table.match_prefix("add sp, 0x2", &["pop cx", "ret"]), Some(1));
        assert_eq!(table.match_prefix("add sp, 0x2", &["inc sp"]), None);
        assert_eq!(table.match_prefix("ret", &stream), None);
        assert_eq!(table.max_alternative_len(), 2);
    }

    #[test]
    fn test_user_dictionary() {
        let table = VariantTable::from_json(r#"{ "mov ax, 0x0": [["xor ax, ax"]] }"#).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.matches("mov ax, 0x0", &["xor ax, ax"]));
        assert!(!table.matches("add sp, 0x2", &["pop cx"]));
        assert!(VariantTable::from_json("[]").is_err());
    }

    #[test]
    fn test_empty_table() {
        let table = VariantTable::empty();
        assert!(table.is_empty());
        assert!(table.matches("nop", &["nop"]));
        assert!(!table.matches("add sp, 0x2", &["pop cx"]));
        assert_eq!(table.max_alternative_len(), 0);
    }
}
