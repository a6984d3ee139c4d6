//! JSON map files.
//!
//! A map file describes the layout of one executable: the load segment it
//! was produced for, its image size, segments, routines and variables.
//!
//! ```json
//! {
//!   "load_segment": "0000",
//!   "image_size": 4096,
//!   "segments": [{ "name": "CODE1", "type": "CODE", "address": 0 }],
//!   "routines": [{ "name": "main", "entry": "0000:0010" }],
//!   "variables": [{ "name": "counter", "address": "0100:0004" }]
//! }
//! ```

use crate::analysis::codemap::CodeMap;
use crate::error::{DiffError, Result};
use crate::types::{Offset, Routine, Segment, Variable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct MapFile {
    #[serde(with = "hex_word")]
    load_segment: u16,
    #[serde(default)]
    image_size: Offset,
    #[serde(default)]
    segments: Vec<Segment>,
    #[serde(default)]
    routines: Vec<Routine>,
    #[serde(default)]
    variables: Vec<Variable>,
}

mod hex_word {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04X}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = String::deserialize(deserializer)?;
        u16::from_str_radix(text.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
    }
}

impl CodeMap {
    /// Parse a map from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: MapFile = serde_json::from_str(text)?;
        let mut map = CodeMap::new(file.load_segment, file.image_size);
        map.set_segments(file.segments);
        for routine in file.routines {
            map.add_routine(routine);
        }
        for variable in file.variables {
            map.add_variable(variable);
        }
        Ok(map)
    }

    /// Render the map as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        let file = MapFile {
            load_segment: self.load_segment(),
            image_size: self.image_size(),
            segments: self.segments().iter().cloned().collect(),
            routines: self.routines().to_vec(),
            variables: self.variables().to_vec(),
        };
        serde_json::to_string_pretty(&file).map_err(DiffError::from)
    }

    /// Read a map file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let map = Self::from_json(&text)?;
        debug!(
            "map {}: {} segments, {} routines, {} variables",
            path.as_ref().display(),
            map.segments().len(),
            map.routines().len(),
            map.variables().len()
        );
        Ok(map)
    }

    /// Write the map to disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Guess the target map location from the reference map path.
pub fn guess_target_map(reference: &Path) -> std::path::PathBuf {
    reference.with_extension("tgt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, SegmentType};
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "load_segment": "1000",
        "image_size": 8192,
        "segments": [
            { "name": "DATA", "type": "DATA", "address": 4224 },
            { "name": "CODE", "type": "CODE", "address": 4096 }
        ],
        "routines": [
            { "name": "main", "entry": "1000:0010" },
            { "name": "_memcpy", "entry": "1000:0100", "end": "1000:0120", "assembly": true }
        ],
        "variables": [{ "name": "counter", "address": "1080:0004" }]
    }"#;

    #[test]
    fn test_parse() {
        let map = CodeMap::from_json(SAMPLE).unwrap();
        assert_eq!(map.load_segment(), 0x1000);
        assert_eq!(map.image_size(), 8192);
        let names: Vec<_> = map.segments().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["CODE", "DATA"]);
        assert_eq!(map.segments().iter().nth(1).unwrap().kind, SegmentType::Data);
        assert!(map.routines()[1].assembly);
        assert!(!map.routines()[0].assembly);
        assert_eq!(map.routines()[1].end, Some(Address::new(0x1000, 0x120)));
        assert_eq!(map.variables()[0].address, Address::new(0x1080, 4));
    }

    #[test]
    fn test_round_trip_on_disk() {
        let map = CodeMap::from_json(SAMPLE).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        map.save(file.path()).unwrap();
        let back = CodeMap::load(file.path()).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CodeMap::from_json("{ \"segments\": 5 }"),
            Err(DiffError::InvalidMap { .. })
        ));
        assert!(CodeMap::from_json(r#"{ "load_segment": "zz" }"#).is_err());
    }

    #[test]
    fn test_minimal_map_is_empty() {
        let map = CodeMap::from_json(r#"{ "load_segment": "0" }"#).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_guess_target_map() {
        let guess = guess_target_map(Path::new("/tmp/game.map"));
        assert_eq!(guess, Path::new("/tmp/game.tgt"));
    }
}
