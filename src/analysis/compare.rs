//! Code comparison.
//!
//! Routines are discovered from the entry point through call targets and
//! compared one at a time; inside a routine, jump targets are queued as
//! further blocks. Every address an instruction pair refers to is asserted
//! against the [`OffsetMap`], so a call to `0x120` in the reference must
//! consistently correspond to the same target routine for the whole run.

use super::codemap::CodeMap;
use super::duplicate::{find_duplicate, CodeBlock};
use super::offset_map::{MappingInfo, OffsetMap};
use super::report::{ComparisonReport, Diagnostic, DiagnosticKind, NearMatch, Severity};
use super::Analyzer;
use crate::architectures::x86::{Correspondence, Instruction, InstructionMatch};
use crate::error::Result;
use crate::formats::mz::Executable;
use crate::types::{Address, SOffset, SegmentType};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, trace, warn};

/// Longest straight-line block considered for duplicate detection.
const MAX_BLOCK_LENGTH: usize = 256;

impl Analyzer {
    /// Compare the code of `reference` against `target`, starting at their
    /// entry points.
    ///
    /// `ref_map` supplies segments and routine metadata for the reference;
    /// `tgt_map`, when present, adds target routine entries as duplicate
    /// candidates. Decoding past the end of either image is fatal.
    pub fn compare_code(
        &self,
        reference: &Executable,
        target: &Executable,
        ref_map: &CodeMap,
        tgt_map: Option<&CodeMap>,
    ) -> Result<ComparisonReport> {
        let mut run = CodeRun::new(self, reference, target, ref_map, tgt_map);
        run.execute()?;
        info!(
            "code comparison {}: {} instructions in {} routines",
            if run.report.matched { "matched" } else { "failed" },
            run.report.statistics.instructions,
            run.report.statistics.routines
        );
        Ok(run.report)
    }
}

#[derive(Debug, Clone)]
struct RoutineScope {
    ref_entry: Address,
    tgt_entry: Address,
    name: Option<String>,
}

enum Step {
    Aligned,
    Advance { reference: usize, target: usize },
    Abandon,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEnd {
    Done,
    Abandon,
    Fail,
}

/// Correspondence check outcome.
enum Verdict {
    Accepted,
    Rejected(DiagnosticKind, String),
}

struct CodeRun<'a> {
    analyzer: &'a Analyzer,
    reference: &'a Executable,
    target: &'a Executable,
    ref_map: &'a CodeMap,
    tgt_map: Option<&'a CodeMap>,
    offsets: OffsetMap,
    routines: VecDeque<(Address, Address)>,
    routines_seen: HashSet<Address>,
    visited: HashSet<Address>,
    tgt_entries: Vec<Address>,
    skip_pending: bool,
    report: ComparisonReport,
}

impl<'a> CodeRun<'a> {
    fn new(
        analyzer: &'a Analyzer,
        reference: &'a Executable,
        target: &'a Executable,
        ref_map: &'a CodeMap,
        tgt_map: Option<&'a CodeMap>,
    ) -> Self {
        let mut offsets = OffsetMap::new(analyzer.options().max_data);
        for seg in ref_map.segments().iter() {
            offsets.add_segment(seg.clone());
        }
        Self {
            analyzer,
            reference,
            target,
            ref_map,
            tgt_map,
            offsets,
            routines: VecDeque::new(),
            routines_seen: HashSet::new(),
            visited: HashSet::new(),
            tgt_entries: Vec::new(),
            skip_pending: true,
            report: ComparisonReport::new(),
        }
    }

    fn execute(&mut self) -> Result<()> {
        let (r, t) = (self.reference.entry(), self.target.entry());
        info!("comparing code from entry points {} / {}", r, t);
        self.offsets
            .code_match(r, MappingInfo::new(t, r, "entry point"));
        self.routines.push_back((r, t));
        self.tgt_entries.push(t);

        while let Some((r, t)) = self.routines.pop_front() {
            if !self.routines_seen.insert(r) {
                continue;
            }
            let routine = self.ref_map.routine_at(r);
            let scope = RoutineScope {
                ref_entry: r,
                tgt_entry: t,
                name: routine.map(|x| x.name.clone()),
            };
            if routine.map_or(false, |x| x.assembly) && !self.analyzer.options().check_asm {
                info!("skipping assembly routine {} at {}", scope_name(&scope), r);
                self.report.statistics.routines_skipped += 1;
                continue;
            }

            self.offsets.reset_stack();
            self.skip_pending = true;
            self.report.statistics.routines += 1;
            debug!("routine {} at {} / {}", scope_name(&scope), r, t);
            match self.compare_routine(&scope)? {
                BlockEnd::Fail => break,
                BlockEnd::Abandon => debug!("routine {} abandoned", scope_name(&scope)),
                BlockEnd::Done => {}
            }
        }
        Ok(())
    }

    fn compare_routine(&mut self, scope: &RoutineScope) -> Result<BlockEnd> {
        let mut blocks = VecDeque::from([(scope.ref_entry, scope.tgt_entry)]);
        while let Some((r, t)) = blocks.pop_front() {
            if self.visited.contains(&r) {
                continue;
            }
            match self.compare_block(scope, r, t, &mut blocks)? {
                BlockEnd::Done => {}
                end => return Ok(end),
            }
        }
        Ok(BlockEnd::Done)
    }

    fn compare_block(
        &mut self,
        scope: &RoutineScope,
        mut r: Address,
        mut t: Address,
        blocks: &mut VecDeque<(Address, Address)>,
    ) -> Result<BlockEnd> {
        let mut realigned = false;
        loop {
            if !self.visited.insert(r) && !realigned {
                trace!("{} already compared", r);
                return Ok(BlockEnd::Done);
            }
            realigned = false;

            let ri = self.reference.decode(r)?;
            let ti = self.target.decode(t)?;
            self.report.statistics.instructions += 1;
            trace!("{}: {} | {}: {}", ri.address, ri, ti.address, ti);

            match self.compare_pair(scope, &ri, &ti, blocks)? {
                Step::Aligned => {
                    if ri.flow.ends_block() || ti.flow.ends_block() {
                        return Ok(BlockEnd::Done);
                    }
                    r = ri.next_address();
                    t = ti.next_address();
                }
                Step::Advance { reference, target } => {
                    let (nr, r_end) = step_over(self.reference, r, reference)?;
                    let (nt, t_end) = step_over(self.target, t, target)?;
                    if r_end || t_end {
                        return Ok(BlockEnd::Done);
                    }
                    realigned = reference == 0;
                    r = nr;
                    t = nt;
                }
                Step::Abandon => return Ok(BlockEnd::Abandon),
                Step::Fail => return Ok(BlockEnd::Fail),
            }
        }
    }

    fn compare_pair(
        &mut self,
        scope: &RoutineScope,
        ri: &Instruction,
        ti: &Instruction,
        blocks: &mut VecDeque<(Address, Address)>,
    ) -> Result<Step> {
        let analyzer = self.analyzer;
        let opts = analyzer.options();
        let cmp = ri.compare(ti);
        match cmp.result {
            InstructionMatch::Match => {}
            InstructionMatch::ValueDiff if opts.ignore_diff => {
                self.report.push(
                    pair_diagnostic(Severity::Soft, DiagnosticKind::ValueDiff, scope, ri, ti)
                        .with_message("value difference ignored"),
                );
            }
            InstructionMatch::ValueDiff => {
                return self.diverge(scope, ri, ti, DiagnosticKind::ValueDiff, "values differ")
            }
            InstructionMatch::Mismatch => {
                return self.diverge(
                    scope,
                    ri,
                    ti,
                    DiagnosticKind::Mismatch,
                    "instructions differ",
                )
            }
        }

        for corr in &cmp.correspondences {
            if let Verdict::Rejected(kind, message) = self.check_correspondence(ri, corr, blocks) {
                if opts.strict {
                    return self.diverge(scope, ri, ti, kind, &message);
                }
                self.report
                    .push(pair_diagnostic(Severity::Soft, kind, scope, ri, ti).with_message(message));
            }
        }
        Ok(Step::Aligned)
    }

    /// Assert one correspondence and queue the branch target on success.
    fn check_correspondence(
        &mut self,
        ri: &Instruction,
        corr: &Correspondence,
        blocks: &mut VecDeque<(Address, Address)>,
    ) -> Verdict {
        match *corr {
            Correspondence::Code {
                reference,
                target,
                call,
            } => {
                if call && self.analyzer.options().no_call {
                    return Verdict::Accepted;
                }
                if matches!(
                    self.offsets.segment_type(reference),
                    Some(SegmentType::Data | SegmentType::Stack)
                ) {
                    debug!("{} points into {}, comparing as data", ri, self.locate(reference));
                    let (from, to) = (SOffset::from(reference.offset), SOffset::from(target.offset));
                    return self.data_verdict(from, to);
                }
                let mapping = MappingInfo::new(target, ri.address, ri.to_string());
                if !self.offsets.code_match(reference, mapping) {
                    let message = match self.offsets.code_mapping(reference) {
                        Some(known) => format!(
                            "{} ({}) already corresponds to {}, established by `{}` at {}",
                            reference,
                            self.locate(reference),
                            known.target_address,
                            known.source_instruction,
                            known.source_instruction_address
                        ),
                        None => format!(
                            "target {} already corresponds to another reference address",
                            target
                        ),
                    };
                    return Verdict::Rejected(DiagnosticKind::CodeConflict, message);
                }
                if call {
                    self.routines.push_back((reference, target));
                    self.tgt_entries.push(target);
                } else {
                    blocks.push_back((reference, target));
                }
                Verdict::Accepted
            }
            Correspondence::Data { reference, target } => self.data_verdict(reference, target),
            Correspondence::Stack { reference, target } => {
                if self.offsets.stack_match(reference, target) {
                    Verdict::Accepted
                } else {
                    Verdict::Rejected(
                        DiagnosticKind::StackConflict,
                        format!(
                            "stack offset {:#x} cannot correspond to {:#x} in this routine",
                            reference, target
                        ),
                    )
                }
            }
        }
    }

    fn data_verdict(&mut self, from: SOffset, to: SOffset) -> Verdict {
        if self.offsets.data_match(from, to) {
            return Verdict::Accepted;
        }
        let known: Vec<String> = self
            .offsets
            .data()
            .targets(from)
            .iter()
            .map(|o| format!("{:#x}", o))
            .collect();
        Verdict::Rejected(
            DiagnosticKind::DataConflict,
            format!(
                "data offset {:#x} cannot also correspond to {:#x} (known: [{}], limit {})",
                from,
                to,
                known.join(", "),
                self.offsets.data().max()
            ),
        )
    }

    /// Resolve a divergence through variants, the one-shot skip or a
    /// duplicate; otherwise report a hard mismatch.
    fn diverge(
        &mut self,
        scope: &RoutineScope,
        ri: &Instruction,
        ti: &Instruction,
        kind: DiagnosticKind,
        message: &str,
    ) -> Result<Step> {
        let analyzer = self.analyzer;
        let opts = analyzer.options();

        if opts.variant {
            if let Some(step) = self.try_variant(scope, ri, ti) {
                return Ok(step);
            }
        }

        if self.skip_pending && (opts.ref_skip > 0 || opts.tgt_skip > 0) {
            self.skip_pending = false;
            info!(
                "skipping {} reference and {} target instructions at {} / {}",
                opts.ref_skip, opts.tgt_skip, ri.address, ti.address
            );
            self.report.push(
                pair_diagnostic(Severity::Info, DiagnosticKind::Skip, scope, ri, ti).with_message(
                    format!(
                        "skipped {} reference and {} target instructions",
                        opts.ref_skip, opts.tgt_skip
                    ),
                ),
            );
            return Ok(Step::Advance {
                reference: opts.ref_skip,
                target: opts.tgt_skip,
            });
        }

        if let Some(step) = self.try_duplicate(scope, ri, ti, message) {
            return Ok(step);
        }

        warn!("{} / {}: {}: `{}` vs `{}`", ri.address, ti.address, message, ri, ti);
        let context = (
            self.context(self.reference, ri),
            self.context(self.target, ti),
        );
        self.report.push(
            pair_diagnostic(Severity::Hard, kind, scope, ri, ti)
                .with_message(message)
                .context(context.0, context.1),
        );
        Ok(Step::Fail)
    }

    fn try_variant(
        &mut self,
        scope: &RoutineScope,
        ri: &Instruction,
        ti: &Instruction,
    ) -> Option<Step> {
        let analyzer = self.analyzer;
        let variants = analyzer.variants();
        let depth = variants.max_alternative_len();
        if depth == 0 {
            return None;
        }
        let ref_stream = texts(self.reference, ri.address, depth);
        let tgt_stream = texts(self.target, ti.address, depth);

        let (step, covered) = if let Some(n) = variants.match_prefix(&ri.to_string(), &tgt_stream[..])
        {
            (Step::Advance { reference: 1, target: n }, tgt_stream[..n].join("; "))
        } else if let Some(n) = variants.match_prefix(&ti.to_string(), &ref_stream[..]) {
            (Step::Advance { reference: n, target: 1 }, ref_stream[..n].join("; "))
        } else {
            return None;
        };

        debug!("variant at {} / {}: {} ~ {}", ri.address, ti.address, ri, covered);
        self.report.statistics.variant_matches += 1;
        self.report.push(
            pair_diagnostic(Severity::Info, DiagnosticKind::Variant, scope, ri, ti)
                .with_message(format!("accepted variant `{}`", covered)),
        );
        Some(step)
    }

    fn try_duplicate(
        &mut self,
        scope: &RoutineScope,
        ri: &Instruction,
        ti: &Instruction,
        message: &str,
    ) -> Option<Step> {
        let analyzer = self.analyzer;
        let opts = analyzer.options();
        let ref_block = block_at(self.reference, scope.ref_entry);

        let mut seen = HashSet::new();
        let starts: Vec<Address> = self
            .tgt_map
            .map(|m| m.routines().iter().map(|r| r.entry).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .chain(self.tgt_entries.iter().copied())
            .filter(|a| *a != scope.tgt_entry && seen.insert(*a))
            .collect();
        let candidates: Vec<CodeBlock> = starts.iter().map(|a| block_at(self.target, *a)).collect();

        let dup = find_duplicate(&ref_block, &candidates)?;
        let location = starts[dup.dup_idx];
        debug!(
            "best duplicate for routine at {}: {} at {} ({}%)",
            scope.ref_entry,
            dup,
            location,
            dup.percent()
        );
        if dup.percent() > opts.dup_threshold {
            return None;
        }

        warn!(
            "routine at {} resembles {} in the target ({})",
            scope.ref_entry, location, dup
        );
        self.report.statistics.near_matches += 1;
        let severity = if opts.strict {
            Severity::Hard
        } else {
            Severity::Soft
        };
        let mut diag = pair_diagnostic(severity, DiagnosticKind::NearMatch, scope, ri, ti)
            .with_message(format!("{}; similar code at {} ({})", message, location, dup));
        diag.near_match = Some(NearMatch::new(location, &dup));
        if opts.strict {
            diag = diag.context(self.context(self.reference, ri), self.context(self.target, ti));
        }
        self.report.push(diag);
        Some(if opts.strict {
            Step::Fail
        } else {
            Step::Abandon
        })
    }

    /// Instructions following `instr`, for diagnostics.
    fn context(&self, exe: &Executable, instr: &Instruction) -> Vec<String> {
        let count = self.analyzer.options().ctx_count;
        if count == 0 || instr.flow.ends_block() {
            return Vec::new();
        }
        straight_line(exe, instr.next_address(), count)
            .iter()
            .map(|i| format!("{}: {}", i.address, i))
            .collect()
    }

    /// Describe where a reference address lies in the segment layout.
    fn locate(&self, addr: Address) -> String {
        self.offsets.segments().describe(addr.linear())
    }
}

fn scope_name(scope: &RoutineScope) -> &str {
    scope.name.as_deref().unwrap_or("?")
}

fn pair_diagnostic(
    severity: Severity,
    kind: DiagnosticKind,
    scope: &RoutineScope,
    ri: &Instruction,
    ti: &Instruction,
) -> Diagnostic {
    Diagnostic::new(severity, kind, String::new())
        .at(ri.address, ti.address)
        .texts(ri.to_string(), ti.to_string())
        .in_routine(scope.name.as_deref())
}

/// Decode up to `limit` instructions from `start`, stopping after the first
/// one that ends a block or at the first undecodable byte.
fn straight_line(exe: &Executable, start: Address, limit: usize) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut addr = start;
    while out.len() < limit {
        let Ok(instr) = exe.decode(addr) else {
            break;
        };
        let done = instr.flow.ends_block();
        addr = instr.next_address();
        out.push(instr);
        if done {
            break;
        }
    }
    out
}

fn texts(exe: &Executable, start: Address, limit: usize) -> Vec<String> {
    straight_line(exe, start, limit)
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn block_at(exe: &Executable, start: Address) -> CodeBlock {
    CodeBlock::from_instructions(start, &straight_line(exe, start, MAX_BLOCK_LENGTH))
}

/// Move past `count` instructions. Reports whether one of them ended the block.
fn step_over(exe: &Executable, from: Address, count: usize) -> Result<(Address, bool)> {
    let mut addr = from;
    for _ in 0..count {
        let instr = exe.decode(addr)?;
        addr = instr.next_address();
        if instr.flow.ends_block() {
            return Ok((addr, true));
        }
    }
    Ok((addr, false))
}
