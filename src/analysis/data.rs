//! Data segment comparison.
//!
//! Data offsets cannot be discovered by walking instructions, so both map
//! files are required. Variables of the named segment are paired by name;
//! their positions inside the segment go through the data table of an
//! [`OffsetMap`] (so the fan-out bound applies), and their initialized
//! bytes are compared. Bytes beyond the end of an image (uninitialized
//! data) are never compared.

use super::codemap::CodeMap;
use super::offset_map::OffsetMap;
use super::report::{ComparisonReport, Diagnostic, DiagnosticKind, Severity};
use super::Analyzer;
use crate::error::{DiffError, Result};
use crate::formats::mz::Executable;
use crate::types::{Address, Offset, SOffset, Segment, Variable};
use tracing::{debug, info};

/// Bytes per hex-dump line.
const DUMP_WIDTH: usize = 16;

/// A region compared as a unit.
#[derive(Debug)]
struct DataBlock {
    name: String,
    reference: Offset,
    target: Offset,
    ref_size: Offset,
    tgt_size: Offset,
}

/// One side of a data comparison.
struct Side<'a> {
    exe: &'a Executable,
    segment: &'a Segment,
    start: Offset,
    end: Offset,
}

impl Side<'_> {
    fn address(&self, linear: Offset) -> Address {
        let rel = linear.saturating_sub(self.start);
        Address::new(self.segment.address, rel as u16)
    }

    /// Initialized bytes available from `linear`, capped at `size`.
    fn available(&self, linear: Offset, size: Offset) -> usize {
        match self.exe.image_offset(linear) {
            Some(pos) => (size as usize).min(self.exe.size() - pos),
            None => 0,
        }
    }
}

impl Analyzer {
    /// Compare the data segment `segment` of `reference` and `target`.
    ///
    /// Fails with [`DiffError::MissingMap`] if either map is empty and with
    /// [`DiffError::UnknownSegment`] if a map has no segment of that name.
    pub fn compare_data(
        &self,
        reference: &Executable,
        target: &Executable,
        ref_map: &CodeMap,
        tgt_map: &CodeMap,
        segment: &str,
    ) -> Result<ComparisonReport> {
        if ref_map.is_empty() {
            return Err(DiffError::MissingMap {
                what: "reference map is required for data comparison".to_string(),
            });
        }
        if tgt_map.is_empty() {
            return Err(DiffError::MissingMap {
                what: "target map is required for data comparison".to_string(),
            });
        }
        let ref_side = side(reference, ref_map, segment, "reference")?;
        let tgt_side = side(target, tgt_map, segment, "target")?;
        info!(
            "comparing data segment {}: {:#x}-{:#x} / {:#x}-{:#x}",
            segment, ref_side.start, ref_side.end, tgt_side.start, tgt_side.end
        );

        let opts = self.options();
        let mut report = ComparisonReport::new();
        let (ref_len, tgt_len) = (
            ref_side.end - ref_side.start,
            tgt_side.end - tgt_side.start,
        );
        if ref_len != tgt_len {
            let severity = if opts.ext_data {
                Severity::Soft
            } else {
                Severity::Hard
            };
            report.push(Diagnostic::new(
                severity,
                DiagnosticKind::SizeMismatch,
                format!(
                    "segment {} is {:#x} bytes in the reference, {:#x} in the target",
                    segment, ref_len, tgt_len
                ),
            ));
            if !opts.ext_data {
                return Ok(report);
            }
        }

        let mut offsets = OffsetMap::new(opts.max_data);
        for block in pair_blocks(&ref_side, ref_map, &tgt_side, tgt_map, &mut report) {
            let ref_rel = SOffset::try_from(block.reference - ref_side.start).unwrap_or(SOffset::MAX);
            let tgt_rel = SOffset::try_from(block.target - tgt_side.start).unwrap_or(SOffset::MAX);
            if !offsets.data_match(ref_rel, tgt_rel) {
                let severity = if opts.strict {
                    Severity::Hard
                } else {
                    Severity::Soft
                };
                report.push(
                    Diagnostic::new(
                        severity,
                        DiagnosticKind::DataConflict,
                        format!(
                            "{}: offset {:#x} ({}) cannot also correspond to {:#x} ({})",
                            block.name,
                            ref_rel,
                            ref_map.segments().describe(block.reference),
                            tgt_rel,
                            tgt_map.segments().describe(block.target)
                        ),
                    )
                    .at(ref_side.address(block.reference), tgt_side.address(block.target)),
                );
                if opts.strict {
                    continue;
                }
            }
            self.compare_block(&block, &ref_side, &tgt_side, &mut report)?;
        }

        info!(
            "data comparison {}: {} bytes in {} variables",
            if report.matched { "matched" } else { "failed" },
            report.statistics.data_bytes,
            report.statistics.variables
        );
        Ok(report)
    }

    fn compare_block(
        &self,
        block: &DataBlock,
        ref_side: &Side<'_>,
        tgt_side: &Side<'_>,
        report: &mut ComparisonReport,
    ) -> Result<()> {
        let opts = self.options();
        let location = (
            ref_side.address(block.reference),
            tgt_side.address(block.target),
        );
        let size = if block.ref_size == block.tgt_size || opts.ext_data {
            block.ref_size.min(block.tgt_size)
        } else {
            report.push(
                Diagnostic::new(
                    Severity::Hard,
                    DiagnosticKind::SizeMismatch,
                    format!(
                        "{} is {:#x} bytes in the reference, {:#x} in the target",
                        block.name, block.ref_size, block.tgt_size
                    ),
                )
                .at(location.0, location.1),
            );
            return Ok(());
        };

        let ref_avail = ref_side.available(block.reference, size);
        let tgt_avail = tgt_side.available(block.target, size);
        if ref_avail != tgt_avail && !opts.ext_data {
            report.push(
                Diagnostic::new(
                    Severity::Hard,
                    DiagnosticKind::SizeMismatch,
                    format!(
                        "{} has {:#x} initialized bytes in the reference, {:#x} in the target",
                        block.name, ref_avail, tgt_avail
                    ),
                )
                .at(location.0, location.1),
            );
            return Ok(());
        }
        let count = ref_avail.min(tgt_avail);
        report.statistics.variables += 1;
        if count == 0 {
            debug!("{}: uninitialized", block.name);
            return Ok(());
        }
        let ref_bytes = ref_side.exe.bytes(block.reference, count)?;
        let tgt_bytes = tgt_side.exe.bytes(block.target, count)?;
        report.statistics.data_bytes += count;
        debug!("{}: {} bytes at {} / {}", block.name, count, location.0, location.1);

        let Some(pos) = ref_bytes.iter().zip(tgt_bytes).position(|(a, b)| a != b) else {
            return Ok(());
        };
        let at = pos as Offset;
        report.push(
            Diagnostic::new(
                Severity::Hard,
                DiagnosticKind::DataDiff,
                format!("{} differs at +{:#x}", block.name, pos),
            )
            .at(
                ref_side.address(block.reference + at),
                tgt_side.address(block.target + at),
            )
            .texts(
                format!("{:02x}", ref_bytes[pos]),
                format!("{:02x}", tgt_bytes[pos]),
            )
            .context(
                dump(ref_side, block.reference, ref_bytes, pos, opts.data_ctx_count),
                dump(tgt_side, block.target, tgt_bytes, pos, opts.data_ctx_count),
            ),
        );
        Ok(())
    }
}

fn side<'a>(
    exe: &'a Executable,
    map: &'a CodeMap,
    name: &str,
    which: &'static str,
) -> Result<Side<'a>> {
    let unknown = || DiffError::UnknownSegment {
        name: name.to_string(),
        side: which,
    };
    let segment = map.segments().by_name(name).ok_or_else(unknown)?;
    let (start, end) = map.segments().extent(segment).ok_or_else(unknown)?;
    Ok(Side {
        exe,
        segment,
        start,
        end,
    })
}

/// Split the segment into blocks paired by variable name.
fn pair_blocks(
    ref_side: &Side<'_>,
    ref_map: &CodeMap,
    tgt_side: &Side<'_>,
    tgt_map: &CodeMap,
    report: &mut ComparisonReport,
) -> Vec<DataBlock> {
    let ref_vars = ref_map.variables_in(ref_side.start, ref_side.end);
    if ref_vars.is_empty() {
        return vec![DataBlock {
            name: ref_side.segment.name.clone(),
            reference: ref_side.start,
            target: tgt_side.start,
            ref_size: ref_side.end - ref_side.start,
            tgt_size: tgt_side.end - tgt_side.start,
        }];
    }
    let tgt_vars = tgt_map.variables_in(tgt_side.start, tgt_side.end);
    let size_of = |vars: &[&Variable], idx: usize, end: Offset| {
        let start = vars[idx].address.linear();
        vars.get(idx + 1)
            .map_or(end, |next| next.address.linear())
            .saturating_sub(start)
    };

    let mut blocks = Vec::with_capacity(ref_vars.len());
    for (i, var) in ref_vars.iter().enumerate() {
        let Some(j) = tgt_vars.iter().position(|v| v.name == var.name) else {
            report.push(
                Diagnostic::new(
                    Severity::Hard,
                    DiagnosticKind::MissingVariable,
                    format!(
                        "variable {} has no counterpart in target segment {}",
                        var.name, tgt_side.segment.name
                    ),
                )
                .texts(var.name.clone(), String::new()),
            );
            continue;
        };
        blocks.push(DataBlock {
            name: var.name.clone(),
            reference: var.address.linear(),
            target: tgt_vars[j].address.linear(),
            ref_size: size_of(&ref_vars[..], i, ref_side.end),
            tgt_size: size_of(&tgt_vars[..], j, tgt_side.end),
        });
    }
    blocks
}

/// Hex dump of `lines` lines around `pos`.
fn dump(side: &Side<'_>, start: Offset, bytes: &[u8], pos: usize, lines: usize) -> Vec<String> {
    let first = (pos / DUMP_WIDTH).saturating_sub(lines / 2) * DUMP_WIDTH;
    bytes
        .chunks(DUMP_WIDTH)
        .enumerate()
        .skip(first / DUMP_WIDTH)
        .take(lines)
        .map(|(i, chunk)| {
            let addr = side.address(start + (i * DUMP_WIDTH) as Offset);
            let hex: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
            format!("{}  {}", addr, hex.join(" "))
        })
        .collect()
}
