//! Error types for the MZ comparison engine.
//!
//! Correspondence conflicts between the two executables are not errors: the
//! offset map reports them as boolean verdicts. Everything here is either a
//! malformed input, a missing collaborator (map file) or a usage problem.

use thiserror::Error;

/// Primary error type for mzdiff.
#[derive(Debug, Error)]
pub enum DiffError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A read would run past the end of a buffer.
    #[error("Memory access out of bounds: {length} bytes at offset 0x{offset:X}, buffer size 0x{size:X}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },

    /// Truncated data when parsing a header.
    #[error("Truncated data at offset {offset}: expected {expected} bytes, got {actual}")]
    TruncatedData {
        offset: usize,
        expected: usize,
        actual: usize,
    },

    /// The file does not start with an MZ signature.
    #[error("Invalid executable signature: {found:02X?}")]
    InvalidSignature { found: Vec<u8> },

    /// A map file could not be parsed.
    #[error("Invalid map file: {message}")]
    InvalidMap { message: String },

    /// A map file required for the requested comparison is absent or empty.
    #[error("Missing map: {what}")]
    MissingMap { what: String },

    /// A segment named on the command line is not present in a map.
    #[error("Segment '{name}' not found in {side} map")]
    UnknownSegment { name: String, side: &'static str },

    /// An address string could not be parsed.
    #[error("Invalid address '{text}', expected SSSS:OOOO")]
    InvalidAddress { text: String },

    /// The decoder could not make sense of the bytes at an address.
    #[error("Unable to decode instruction at {address}")]
    Decode { address: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl From<serde_json::Error> for DiffError {
    fn from(e: serde_json::Error) -> Self {
        DiffError::InvalidMap {
            message: e.to_string(),
        }
    }
}

/// Result type alias for mzdiff operations.
pub type Result<T> = std::result::Result<T, DiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiffError::OutOfBounds {
            offset: 0x10,
            length: 2,
            size: 0x11,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x10"));
        assert!(msg.contains("0x11"));
    }

    #[test]
    fn test_json_error_becomes_invalid_map() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: DiffError = parse.unwrap_err().into();
        assert!(matches!(err, DiffError::InvalidMap { .. }));
    }
}
