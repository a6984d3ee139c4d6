//! Segment table and the per-executable code map.
//!
//! The segment table answers "which segment owns this linear offset". A
//! segment owns the bytes from its start up to the next segment's start, the
//! 64 KiB real-mode limit, or the end of the image, whichever comes first.
//! Lookups only ever compare offsets; the distance into a segment is computed
//! after the ordering search has established `offset >= start`.

use crate::types::{
    segment_to_offset, Address, Offset, Routine, Segment, SegmentType, Variable, SEGMENT_LIMIT,
};

/// Segments ordered by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    end: Option<Offset>,
}

impl SegmentTable {
    /// Create an empty table with no image end.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table whose last segment stops at `end`.
    pub fn with_end(end: Offset) -> Self {
        Self {
            segments: Vec::new(),
            end: Some(end),
        }
    }

    /// Insert a segment, keeping the table ordered.
    ///
    /// Segments sharing a start offset keep their insertion order.
    pub fn add(&mut self, segment: Segment) {
        let start = segment.start_offset();
        let idx = self.segments.partition_point(|s| s.start_offset() <= start);
        self.segments.insert(idx, segment);
    }

    /// Replace the whole table contents.
    pub fn set(&mut self, segments: impl IntoIterator<Item = Segment>) {
        self.segments.clear();
        for seg in segments {
            self.add(seg);
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the table has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Look up a segment by name.
    pub fn by_name(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Exclusive end of the segment at `idx`.
    fn extent_end(&self, idx: usize) -> Offset {
        let start = self.segments[idx].start_offset();
        let mut end = start.saturating_add(SEGMENT_LIMIT);
        if let Some(next) = self.segments[idx + 1..]
            .iter()
            .find(|s| s.start_offset() > start)
        {
            end = end.min(next.start_offset());
        } else if let Some(image_end) = self.end {
            end = end.min(image_end);
        }
        end
    }

    /// Half-open linear range `[start, end)` owned by `segment`.
    ///
    /// Returns `None` if the segment is not part of this table.
    pub fn extent(&self, segment: &Segment) -> Option<(Offset, Offset)> {
        let idx = self.segments.iter().rposition(|s| s == segment)?;
        let start = segment.start_offset();
        Some((start, self.extent_end(idx).max(start)))
    }

    /// Find the segment owning `offset`.
    ///
    /// With `past` set, an offset that falls in a gap (or before the first
    /// segment) resolves to the next segment starting after it instead of
    /// `None`. An offset inside a segment always resolves to that segment.
    pub fn find(&self, offset: Offset, past: bool) -> Option<&Segment> {
        let after = self.segments.partition_point(|s| s.start_offset() <= offset);
        if after > 0 {
            let idx = after - 1;
            if offset < self.extent_end(idx) {
                return Some(&self.segments[idx]);
            }
        }
        if past {
            self.segments.get(after)
        } else {
            None
        }
    }

    /// Find the segment owning `offset` together with the distance into it.
    pub fn find_relative(&self, offset: Offset) -> Option<(&Segment, Offset)> {
        let seg = self.find(offset, false)?;
        Some((seg, offset - seg.start_offset()))
    }

    /// Name the position of `offset` for diagnostics: `NAME+0xREL` inside a
    /// segment, otherwise the next segment after it.
    pub fn describe(&self, offset: Offset) -> String {
        match self.find_relative(offset) {
            Some((seg, rel)) => format!("{}+{:#x}", seg.name, rel),
            None => match self.find(offset, true) {
                Some(next) => format!("before {}", next.name),
                None => "outside known segments".to_string(),
            },
        }
    }
}

/// Segment, routine and variable layout of one executable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeMap {
    load_segment: u16,
    image_size: Offset,
    segments: SegmentTable,
    routines: Vec<Routine>,
    variables: Vec<Variable>,
}

impl CodeMap {
    /// Create an empty map for an image of `image_size` bytes loaded at
    /// `load_segment`. A zero size means the image extent is unknown.
    pub fn new(load_segment: u16, image_size: Offset) -> Self {
        let segments = if image_size == 0 {
            SegmentTable::new()
        } else {
            SegmentTable::with_end(segment_to_offset(load_segment).saturating_add(image_size))
        };
        Self {
            load_segment,
            image_size,
            segments,
            routines: Vec::new(),
            variables: Vec::new(),
        }
    }

    /// Load segment the map addresses are relative to.
    pub fn load_segment(&self) -> u16 {
        self.load_segment
    }

    /// Image size in bytes, zero if unknown.
    pub fn image_size(&self) -> Offset {
        self.image_size
    }

    /// Replace the segment list.
    pub fn set_segments(&mut self, segments: impl IntoIterator<Item = Segment>) {
        self.segments.set(segments);
    }

    /// Add a single segment.
    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.add(segment);
    }

    /// The segment table.
    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    /// Add a routine.
    pub fn add_routine(&mut self, routine: Routine) {
        self.routines.push(routine);
    }

    /// All routines in map order.
    pub fn routines(&self) -> &[Routine] {
        &self.routines
    }

    /// Add a variable.
    pub fn add_variable(&mut self, variable: Variable) {
        self.variables.push(variable);
    }

    /// All variables in map order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Move every address from the map's load segment to `load_segment`.
    pub fn rebase(&mut self, load_segment: u16) {
        let delta = load_segment.wrapping_sub(self.load_segment);
        if delta == 0 {
            return;
        }
        let mut rebased = CodeMap::new(load_segment, self.image_size);
        rebased.set_segments(self.segments.iter().map(|s| Segment {
            address: s.address.wrapping_add(delta),
            ..s.clone()
        }));
        rebased.routines = self
            .routines
            .drain(..)
            .map(|mut r| {
                r.entry = r.entry.rebase(delta);
                r.end = r.end.map(|e| e.rebase(delta));
                r
            })
            .collect();
        rebased.variables = self
            .variables
            .drain(..)
            .map(|mut v| {
                v.address = v.address.rebase(delta);
                v
            })
            .collect();
        *self = rebased;
    }

    /// Whether the map carries no layout information at all.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.routines.is_empty() && self.variables.is_empty()
    }

    /// See [`SegmentTable::find`].
    pub fn find_segment(&self, offset: Offset, past: bool) -> Option<&Segment> {
        self.segments.find(offset, past)
    }

    /// Classify the segment owning `addr`.
    pub fn segment_type(&self, addr: Address) -> Option<SegmentType> {
        self.segments.find(addr.linear(), false).map(|s| s.kind)
    }

    /// The routine whose entry point is `addr`.
    pub fn routine_at(&self, addr: Address) -> Option<&Routine> {
        self.routines.iter().find(|r| r.entry == addr)
    }

    /// Variables located inside `[start, end)`, ordered by address.
    pub fn variables_in(&self, start: Offset, end: Offset) -> Vec<&Variable> {
        let mut vars: Vec<_> = self
            .variables
            .iter()
            .filter(|v| (start..end).contains(&v.address.linear()))
            .collect();
        vars.sort_by_key(|v| v.address);
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_segment_map() -> CodeMap {
        let mut map = CodeMap::new(0x1000, 0x10000);
        map.set_segments([
            Segment::new("CODE", SegmentType::Code, 0x1000),
            Segment::new("DATA", SegmentType::Data, 0x2000),
        ]);
        map
    }

    #[test]
    fn test_empty_map() {
        let map = CodeMap::new(0x1000, 0);
        assert!(map.find_segment(0, false).is_none());
        assert!(map.find_segment(0, true).is_none());
        assert!(map.find_segment(Offset::MAX, false).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_no_segments_any_offset() {
        for size in [0, 1, 100, 256] {
            let map = CodeMap::new(0x1000, size);
            for off in [0, 1, 255, 256, 0x7FFF_FFFF, 0x8000_0000, Offset::MAX] {
                assert!(map.find_segment(off, false).is_none());
            }
        }
    }

    #[test]
    fn test_find_basic() {
        let mut map = CodeMap::new(0x1000, 0x30000);
        map.set_segments([
            Segment::new("STACK", SegmentType::Stack, 0x3000),
            Segment::new("CODE", SegmentType::Code, 0x1000),
            Segment::new("DATA", SegmentType::Data, 0x2000),
        ]);
        let code = segment_to_offset(0x1000);
        let data = segment_to_offset(0x2000);
        let stack = segment_to_offset(0x3000);

        assert_eq!(map.find_segment(code, false).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(data, false).unwrap().address, 0x2000);
        assert_eq!(map.find_segment(stack, false).unwrap().address, 0x3000);
        assert_eq!(map.find_segment(code + 0x1234, false).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(data + 0x5678, false).unwrap().address, 0x2000);
        assert_eq!(map.find_segment(code + 0xFFFF, false).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(code + 0x10000, false).unwrap().address, 0x2000);
        assert!(map.find_segment(code - 1, false).is_none());
        assert!(map.find_segment(0, false).is_none());
    }

    #[test]
    fn test_segment_limit() {
        let mut map = CodeMap::new(0x1000, 0x10000);
        map.set_segments([Segment::new("CODE", SegmentType::Code, 0x1000)]);
        let code = segment_to_offset(0x1000);
        assert_eq!(map.find_segment(code, false).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(code + 0x8000, false).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(code + 0xFFFF, false).unwrap().address, 0x1000);
        assert!(map.find_segment(code + 0x10000, false).is_none());
        assert!(map.find_segment(Offset::MAX, false).is_none());
    }

    #[test]
    fn test_image_end_bounds_last_segment() {
        let mut map = CodeMap::new(0x1000, 0x100);
        map.set_segments([Segment::new("CODE", SegmentType::Code, 0x1000)]);
        let code = segment_to_offset(0x1000);
        assert!(map.find_segment(code + 0xFF, false).is_some());
        assert!(map.find_segment(code + 0x100, false).is_none());
    }

    #[test]
    fn test_past_mode() {
        let map = two_segment_map();
        let code = segment_to_offset(0x1000);
        let data = segment_to_offset(0x2000);
        assert_eq!(map.find_segment(code - 1, true).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(0, true).unwrap().address, 0x1000);
        // containing segment wins over the next one
        assert_eq!(map.find_segment(code + 0x1234, true).unwrap().address, 0x1000);
        assert_eq!(map.find_segment(data - 1, true).unwrap().address, 0x1000);
        assert!(map.find_segment(data + 0x10000, true).is_none());
    }

    #[test]
    fn test_past_mode_gap() {
        let mut table = SegmentTable::new();
        table.add(Segment::new("A", SegmentType::Code, 0x1000));
        table.add(Segment::new("B", SegmentType::Data, 0x3000));
        let gap = segment_to_offset(0x2800);
        assert!(table.find(gap, false).is_none());
        assert_eq!(table.find(gap, true).unwrap().name, "B");
    }

    #[test]
    fn test_extreme_segment_values() {
        let mut map = CodeMap::new(0xFFFF, Offset::MAX);
        map.set_segments([Segment::new("CODE", SegmentType::Code, 0xFFFF)]);
        let start = segment_to_offset(0xFFFF);
        assert!(map.find_segment(start, false).is_some());
        assert!(map.find_segment(Offset::MAX, false).is_none());
        assert!(map.find_segment(Offset::MAX, true).is_none());
    }

    #[test]
    fn test_find_relative() {
        let map = two_segment_map();
        let (seg, rel) = map
            .segments()
            .find_relative(segment_to_offset(0x2000) + 0x42)
            .unwrap();
        assert_eq!(seg.name, "DATA");
        assert_eq!(rel, 0x42);
        assert!(map.segments().find_relative(0x100).is_none());
    }

    #[test]
    fn test_describe() {
        let map = two_segment_map();
        let table = map.segments();
        assert_eq!(table.describe(segment_to_offset(0x1000) + 0x10), "CODE+0x10");
        assert_eq!(table.describe(0x100), "before CODE");
        assert_eq!(table.describe(Offset::MAX), "outside known segments");
        assert_eq!(SegmentTable::new().describe(0), "outside known segments");
    }

    #[test]
    fn test_extent() {
        let map = two_segment_map();
        let data = map.segments().by_name("DATA").unwrap();
        let (start, end) = map.segments().extent(data).unwrap();
        assert_eq!(start, 0x20000);
        // image ends at 0x20000, so the data segment is empty
        assert_eq!(end, 0x20000);
        let code = map.segments().by_name("CODE").unwrap();
        assert_eq!(map.segments().extent(code).unwrap(), (0x10000, 0x20000));
    }

    #[test]
    fn test_rebase() {
        let mut map = CodeMap::new(0, 0x100);
        map.set_segments([
            Segment::new("CODE", SegmentType::Code, 0),
            Segment::new("DATA", SegmentType::Data, 0x8),
        ]);
        map.add_routine(Routine::new("main", Address::new(0, 0x10)));
        map.add_variable(Variable::new("v", Address::new(0x8, 0x2)));
        map.rebase(0x1000);

        assert_eq!(map.load_segment(), 0x1000);
        assert_eq!(map.segments().by_name("DATA").unwrap().address, 0x1008);
        assert_eq!(map.routines()[0].entry, Address::new(0x1000, 0x10));
        assert_eq!(map.variables()[0].address, Address::new(0x1008, 0x2));
        // image end moves along
        assert!(map.find_segment(0x100FF, false).is_some());
        assert!(map.find_segment(0x10100, false).is_none());
    }

    #[test]
    fn test_routines_and_variables() {
        let mut map = two_segment_map();
        map.add_routine(Routine::new("main", Address::new(0x1000, 0x10)));
        map.add_variable(Variable::new("b", Address::new(0x2000, 0x4)));
        map.add_variable(Variable::new("a", Address::new(0x2000, 0x0)));
        assert_eq!(map.routine_at(Address::new(0x1001, 0)).unwrap().name, "main");
        let vars = map.variables_in(0x20000, 0x30000);
        assert_eq!(vars[0].name, "a");
        assert_eq!(vars[1].name, "b");
        assert_eq!(map.segment_type(Address::new(0x1000, 0x10)), Some(SegmentType::Code));
    }
}
