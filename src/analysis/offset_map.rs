//! Address correspondence between the reference and the target executable.
//!
//! Three independent tables are kept:
//!
//! - **code**: reference address to target address, injective in both
//!   directions. A pair, once accepted, is accepted for the whole run.
//! - **data**: reference data offset to a bounded set of target offsets. A
//!   source may fan out to at most `max_data` targets, and a target may be
//!   reached from at most `max_data` sources.
//! - **stack**: one-to-one like code, but scoped to a single routine and
//!   cleared with [`OffsetMap::reset_stack`] at every routine entry.
//!
//! Conflicts are reported as `false` and never mutate the tables.

use super::codemap::SegmentTable;
use crate::types::{Address, SOffset, Segment, SegmentType};
use bimap::BiMap;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// What a reference code address was matched to, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    /// Target address the reference address corresponds to
    pub target_address: Address,
    /// Reference instruction that established the correspondence
    pub source_instruction_address: Address,
    /// Text of that instruction, for diagnostics
    pub source_instruction: String,
}

impl MappingInfo {
    /// Create a mapping to `target_address` established by an instruction.
    pub fn new(
        target_address: Address,
        source_instruction_address: Address,
        source_instruction: impl Into<String>,
    ) -> Self {
        Self {
            target_address,
            source_instruction_address,
            source_instruction: source_instruction.into(),
        }
    }
}

/// Many-to-many offset correspondence with a fan-out bound on both sides.
#[derive(Debug, Clone, Default)]
pub struct BoundedMultiMap {
    max: usize,
    forward: BTreeMap<SOffset, Vec<SOffset>>,
    reverse_count: HashMap<SOffset, usize>,
}

impl BoundedMultiMap {
    /// Create an empty map allowing `max` partners per offset.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            forward: BTreeMap::new(),
            reverse_count: HashMap::new(),
        }
    }

    /// Fan-out bound.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Targets recorded for `from`, in insertion order.
    pub fn targets(&self, from: SOffset) -> &[SOffset] {
        self.forward.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct sources mapped to `to`.
    pub fn source_count(&self, to: SOffset) -> usize {
        self.reverse_count.get(&to).copied().unwrap_or(0)
    }

    /// Accept `from -> to` if it is already known or both bounds allow it.
    pub fn insert(&mut self, from: SOffset, to: SOffset) -> bool {
        let targets = self.targets(from);
        if targets.contains(&to) {
            return true;
        }
        if targets.len() >= self.max || self.source_count(to) >= self.max {
            return false;
        }
        self.forward.entry(from).or_default().push(to);
        *self.reverse_count.entry(to).or_insert(0) += 1;
        true
    }

    /// Number of source offsets with at least one target.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// The correspondence tables for one comparison run.
#[derive(Debug, Clone, Default)]
pub struct OffsetMap {
    code: BTreeMap<Address, MappingInfo>,
    code_sources: HashMap<Address, Address>,
    data: BoundedMultiMap,
    stack: BiMap<SOffset, SOffset>,
    segments: SegmentTable,
}

impl OffsetMap {
    /// Create an empty map with the given data fan-out bound.
    pub fn new(max_data: usize) -> Self {
        Self {
            data: BoundedMultiMap::new(max_data),
            ..Self::default()
        }
    }

    /// Target address for a known reference address.
    pub fn get_code(&self, from: Address) -> Option<Address> {
        self.code.get(&from).map(|m| m.target_address)
    }

    /// Full mapping record for a known reference address.
    pub fn code_mapping(&self, from: Address) -> Option<&MappingInfo> {
        self.code.get(&from)
    }

    /// Assert that `from` corresponds to `mapping.target_address`.
    pub fn code_match(&mut self, from: Address, mapping: MappingInfo) -> bool {
        if let Some(existing) = self.code.get(&from) {
            return existing.target_address == mapping.target_address;
        }
        if let Some(other) = self.code_sources.get(&mapping.target_address) {
            trace!(
                "code target {} already claimed by {}",
                mapping.target_address,
                other
            );
            return false;
        }
        trace!("code {} -> {}", from, mapping.target_address);
        self.code_sources.insert(mapping.target_address, from);
        self.code.insert(from, mapping);
        true
    }

    /// Assert that data offset `from` corresponds to `to`.
    pub fn data_match(&mut self, from: SOffset, to: SOffset) -> bool {
        let accepted = self.data.insert(from, to);
        if !accepted {
            trace!(
                "data {:#x} -> {:#x} rejected, known targets: {}",
                from,
                to,
                offsets_str(self.data.targets(from))
            );
        }
        accepted
    }

    /// Assert that stack offset `from` corresponds to `to`.
    pub fn stack_match(&mut self, from: SOffset, to: SOffset) -> bool {
        if let Some(existing) = self.stack.get_by_left(&from) {
            return *existing == to;
        }
        self.stack.insert_no_overwrite(from, to).is_ok()
    }

    /// Forget all stack correspondences; called at routine entry.
    pub fn reset_stack(&mut self) {
        self.stack.clear();
    }

    /// Register a segment of the reference executable.
    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.add(segment);
    }

    /// Reference segments registered so far.
    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    /// Classify a reference address against the registered segments.
    pub fn segment_type(&self, addr: Address) -> Option<SegmentType> {
        self.segments.find(addr.linear(), false).map(|s| s.kind)
    }

    /// All accepted code correspondences, ordered by reference address.
    pub fn code_entries(&self) -> impl Iterator<Item = (&Address, &MappingInfo)> {
        self.code.iter()
    }

    /// The data correspondence table.
    pub fn data(&self) -> &BoundedMultiMap {
        &self.data
    }

    /// Number of stack correspondences in the current routine.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }
}

fn offsets_str(offsets: &[SOffset]) -> String {
    offsets
        .iter()
        .map(|o| format!("{:#x}", o))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(target: Address) -> MappingInfo {
        MappingInfo::new(target, Address::new(0, 0), "call")
    }

    #[test]
    fn test_code_match_is_injective() {
        let mut map = OffsetMap::new(1);
        let a = Address::new(0x1000, 0x10);
        let b = Address::new(0x1000, 0x20);
        let c = Address::new(0x1000, 0x30);

        assert!(map.code_match(a, mapping(b)));
        // idempotent
        assert!(map.code_match(a, mapping(b)));
        // same source, other target
        assert!(!map.code_match(a, mapping(c)));
        assert_eq!(map.get_code(a), Some(b));
        // other source, same target
        assert!(!map.code_match(c, mapping(b)));
        assert_eq!(map.get_code(c), None);
        assert_eq!(map.code_entries().count(), 1);
    }

    #[test]
    fn test_code_match_normalizes_aliases() {
        let mut map = OffsetMap::new(1);
        let from = Address::new(0x1000, 0x0010);
        assert!(map.code_match(from, mapping(Address::new(0x2000, 0x0000))));
        assert!(map.code_match(Address::new(0x1001, 0x0000), mapping(Address::new(0x1FFF, 0x0010))));
    }

    #[test]
    fn test_get_code_unmapped() {
        let map = OffsetMap::new(1);
        assert_eq!(map.get_code(Address::new(0x1234, 0x5678)), None);
    }

    #[test]
    fn test_data_fan_out() {
        let mut map = OffsetMap::new(2);
        assert!(map.data_match(0x10, 0x20));
        assert!(map.data_match(0x10, 0x24));
        assert!(map.data_match(0x10, 0x20));
        assert!(!map.data_match(0x10, 0x28));
        assert_eq!(map.data().targets(0x10), &[0x20, 0x24]);
    }

    #[test]
    fn test_data_fan_in() {
        let mut map = OffsetMap::new(2);
        assert!(map.data_match(0x10, 0x20));
        assert!(map.data_match(0x12, 0x20));
        assert!(!map.data_match(0x14, 0x20));
        assert!(map.data().targets(0x14).is_empty());
        assert_eq!(map.data().source_count(0x20), 2);
    }

    #[test]
    fn test_data_zero_bound_rejects_everything() {
        let mut map = OffsetMap::new(0);
        assert!(!map.data_match(0x10, 0x10));
        assert!(map.data().is_empty());
    }

    #[test]
    fn test_stack_match_one_to_one() {
        let mut map = OffsetMap::new(1);
        assert!(map.stack_match(-2, -4));
        assert!(map.stack_match(-2, -4));
        assert!(!map.stack_match(-2, -6));
        assert!(!map.stack_match(-8, -4));
        assert_eq!(map.stack_len(), 1);
    }

    #[test]
    fn test_reset_stack_scopes_correspondence() {
        let mut map = OffsetMap::new(1);
        assert!(map.stack_match(-2, -4));
        assert!(!map.stack_match(-2, -6));
        map.reset_stack();
        assert!(map.stack_match(-2, -6));
        assert!(map.stack_match(-8, -4));
    }

    #[test]
    fn test_segments() {
        let mut map = OffsetMap::new(1);
        map.add_segment(Segment::new("DATA", SegmentType::Data, 0x2000));
        map.add_segment(Segment::new("CODE", SegmentType::Code, 0x1000));
        assert_eq!(map.segments().len(), 2);
        assert_eq!(map.segment_type(Address::new(0x1000, 4)), Some(SegmentType::Code));
        assert_eq!(map.segment_type(Address::new(0x2000, 4)), Some(SegmentType::Data));
        assert_eq!(map.segment_type(Address::new(0x0800, 0)), None);
    }
}
