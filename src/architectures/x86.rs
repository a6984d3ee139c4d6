//! 16-bit x86 instruction records.
//!
//! Decoding is delegated to `iced-x86`; this module converts its output into
//! a small record that carries exactly what the comparison engine needs:
//! the text form, the operands that can hold addresses, and how control
//! leaves the instruction.

use crate::error::{DiffError, Result};
use crate::types::{Address, SOffset};
use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, OpKind, Register};
use std::fmt;

/// Longest possible x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Falls through to the next instruction
    Next,
    /// Direct call, falls through on return
    Call,
    /// Call through a register or memory operand
    IndirectCall,
    /// Direct unconditional jump
    Jump,
    /// Jump through a register or memory operand
    IndirectJump,
    /// Conditional jump or loop
    ConditionalJump,
    /// `ret`, `retf`, `iret`
    Return,
    /// Software interrupt
    Interrupt,
    /// Execution cannot continue past this instruction
    Stop,
}

impl Flow {
    /// Whether the instruction after this one is not reached by falling through.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Flow::Jump | Flow::IndirectJump | Flow::Return | Flow::Stop
        )
    }
}

/// A memory operand in 16-bit addressing form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    /// Explicit segment override
    pub segment: Option<String>,
    /// Base register (`bx`, `bp`)
    pub base: Option<String>,
    /// Index register (`si`, `di`)
    pub index: Option<String>,
    /// Displacement, or the absolute offset when there is no base or index
    pub displacement: u16,
    /// Access size in bytes, zero if not applicable
    pub size: usize,
}

impl MemoryOperand {
    /// Frame-relative operand (`[bp+...]`).
    pub fn is_stack(&self) -> bool {
        self.base.as_deref() == Some("bp")
    }

    /// Absolute operand (`[0x1234]`).
    pub fn is_absolute(&self) -> bool {
        self.base.is_none() && self.index.is_none()
    }

    fn same_shape(&self, other: &Self) -> bool {
        self.segment == other.segment
            && self.base == other.base
            && self.index == other.index
            && self.size == other.size
    }

    fn size_keyword(&self) -> Option<&'static str> {
        match self.size {
            1 => Some("byte"),
            2 => Some("word"),
            4 => Some("dword"),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(seg) = &self.segment {
            write!(f, "{}:", seg)?;
        }
        write!(f, "[")?;
        if self.is_absolute() {
            return write!(f, "{:#x}]", self.displacement);
        }
        let regs: Vec<&str> = [self.base.as_deref(), self.index.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        write!(f, "{}", regs.join("+"))?;
        let disp = self.displacement as i16;
        if disp < 0 {
            write!(f, "-{:#x}", disp.unsigned_abs())?;
        } else if disp > 0 {
            write!(f, "+{:#x}", disp)?;
        }
        write!(f, "]")
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Register, lower-case name
    Register(String),
    /// Immediate value with its width in bits
    Immediate { value: u32, bits: u8 },
    /// Direct near branch target
    Near(Address),
    /// Direct far branch target
    Far(Address),
    /// Memory reference
    Memory(MemoryOperand),
}

impl Operand {
    fn signature(&self) -> String {
        match self {
            Operand::Register(r) => r.clone(),
            Operand::Immediate { .. } => "imm".to_string(),
            Operand::Near(_) => "near".to_string(),
            Operand::Far(_) => "far".to_string(),
            Operand::Memory(m) => {
                let regs: Vec<&str> = [m.segment.as_deref(), m.base.as_deref(), m.index.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                format!("mem{}[{}]", m.size, regs.join("+"))
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{}", r),
            Operand::Immediate { value, bits } => {
                let masked = match bits {
                    8 => value & 0xFF,
                    16 => value & 0xFFFF,
                    _ => *value,
                };
                write!(f, "{:#x}", masked)
            }
            Operand::Near(addr) => write!(f, "{:#x}", addr.offset),
            Operand::Far(addr) => write!(f, "{:#x}:{:#x}", addr.segment, addr.offset),
            Operand::Memory(m) => write!(f, "{}", m),
        }
    }
}

/// A location pair that must be checked against the offset map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correspondence {
    /// Branch or call destinations
    Code {
        reference: Address,
        target: Address,
        call: bool,
    },
    /// Absolute memory operands
    Data { reference: SOffset, target: SOffset },
    /// Frame-relative memory operands
    Stack { reference: SOffset, target: SOffset },
}

/// Outcome of comparing two instructions in isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstructionMatch {
    /// Same instruction, modulo the locations still to be checked
    Match,
    /// Same shape, differing immediates or displacements
    ValueDiff,
    /// Different instructions
    Mismatch,
}

/// Result of [`Instruction::compare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    /// Textual verdict
    pub result: InstructionMatch,
    /// Locations to verify against the offset map
    pub correspondences: Vec<Correspondence>,
}

/// A decoded 16-bit instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Location of the first byte
    pub address: Address,
    /// Encoded length in bytes
    pub length: u16,
    /// `rep`, `repne` or `lock`
    pub prefix: Option<String>,
    /// Lower-case mnemonic
    pub mnemonic: String,
    /// Explicit operands
    pub operands: Vec<Operand>,
    /// How control leaves the instruction
    pub flow: Flow,
}

impl Instruction {
    /// Address of the instruction that follows in memory.
    pub fn next_address(&self) -> Address {
        self.address.advance(self.length)
    }

    /// Direct branch or call destination.
    pub fn branch_target(&self) -> Option<Address> {
        self.operands.iter().find_map(|op| match op {
            Operand::Near(a) | Operand::Far(a) => Some(*a),
            _ => None,
        })
    }

    /// Address-insensitive form used for similarity scoring.
    pub fn signature(&self) -> String {
        let ops: Vec<String> = self.operands.iter().map(Operand::signature).collect();
        match &self.prefix {
            Some(p) => format!("{} {} {}", p, self.mnemonic, ops.join(",")),
            None => format!("{} {}", self.mnemonic, ops.join(",")),
        }
    }

    /// Compare against the corresponding instruction of the other executable.
    pub fn compare(&self, other: &Instruction) -> Comparison {
        let mismatch = Comparison {
            result: InstructionMatch::Mismatch,
            correspondences: Vec::new(),
        };
        if self.prefix != other.prefix
            || self.mnemonic != other.mnemonic
            || self.operands.len() != other.operands.len()
        {
            return mismatch;
        }

        let call = matches!(self.flow, Flow::Call);
        let mut result = InstructionMatch::Match;
        let mut correspondences = Vec::new();
        for (a, b) in self.operands.iter().zip(&other.operands) {
            match (a, b) {
                (Operand::Register(x), Operand::Register(y)) if x == y => {}
                (Operand::Immediate { value: x, .. }, Operand::Immediate { value: y, .. }) => {
                    if x != y {
                        result = result.max(InstructionMatch::ValueDiff);
                    }
                }
                (Operand::Near(x), Operand::Near(y)) | (Operand::Far(x), Operand::Far(y)) => {
                    correspondences.push(Correspondence::Code {
                        reference: *x,
                        target: *y,
                        call,
                    });
                }
                (Operand::Memory(x), Operand::Memory(y)) if x.same_shape(y) => {
                    if x.is_stack() {
                        correspondences.push(Correspondence::Stack {
                            reference: SOffset::from(x.displacement as i16),
                            target: SOffset::from(y.displacement as i16),
                        });
                    } else if x.is_absolute() {
                        correspondences.push(Correspondence::Data {
                            reference: SOffset::from(x.displacement),
                            target: SOffset::from(y.displacement),
                        });
                    } else if x.displacement != y.displacement {
                        result = result.max(InstructionMatch::ValueDiff);
                    }
                }
                _ => return mismatch,
            }
        }
        Comparison {
            result,
            correspondences,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.prefix {
            write!(f, "{} ", p)?;
        }
        write!(f, "{}", self.mnemonic)?;
        let sized = !self
            .operands
            .iter()
            .any(|op| matches!(op, Operand::Register(_)));
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}", if i == 0 { " " } else { ", " })?;
            if let (true, Operand::Memory(m)) = (sized, op) {
                if let Some(kw) = m.size_keyword() {
                    write!(f, "{} ", kw)?;
                }
            }
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

fn register_name(reg: Register) -> Option<String> {
    if reg == Register::None {
        None
    } else {
        Some(format!("{:?}", reg).to_ascii_lowercase())
    }
}

fn flow_of(instr: &iced_x86::Instruction) -> Flow {
    match instr.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend => Flow::Next,
        FlowControl::Call => Flow::Call,
        FlowControl::IndirectCall => Flow::IndirectCall,
        FlowControl::UnconditionalBranch => Flow::Jump,
        FlowControl::IndirectBranch => Flow::IndirectJump,
        FlowControl::ConditionalBranch => Flow::ConditionalJump,
        FlowControl::Return => Flow::Return,
        FlowControl::Interrupt => Flow::Interrupt,
        FlowControl::Exception => Flow::Stop,
        #[allow(unreachable_patterns)]
        _ => Flow::Next,
    }
}

/// Decode one real-mode instruction from `bytes`, located at `address`.
pub fn decode(bytes: &[u8], address: Address) -> Result<Instruction> {
    let mut decoder = Decoder::with_ip(16, bytes, u64::from(address.offset), DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        if decoder.last_error() == DecoderError::NoMoreBytes {
            return Err(DiffError::OutOfBounds {
                offset: usize::from(address.offset),
                length: MAX_INSTRUCTION_LENGTH.min(bytes.len() + 1),
                size: bytes.len(),
            });
        }
        return Err(DiffError::Decode {
            address: address.to_string(),
        });
    }

    let mut operands = Vec::with_capacity(instr.op_count() as usize);
    for i in 0..instr.op_count() {
        let op = match instr.op_kind(i) {
            OpKind::Register => match register_name(instr.op_register(i)) {
                Some(name) => Operand::Register(name),
                None => continue,
            },
            OpKind::NearBranch16 => Operand::Near(Address::new(address.segment, instr.near_branch16())),
            OpKind::FarBranch16 => Operand::Far(Address::new(
                instr.far_branch_selector(),
                instr.far_branch16(),
            )),
            kind @ (OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate8to16
            | OpKind::Immediate32
            | OpKind::Immediate8to32) => {
                let bits = match kind {
                    OpKind::Immediate8 | OpKind::Immediate8_2nd => 8,
                    OpKind::Immediate16 | OpKind::Immediate8to16 => 16,
                    _ => 32,
                };
                Operand::Immediate {
                    value: instr.immediate(i) as u32,
                    bits,
                }
            }
            OpKind::Memory => Operand::Memory(MemoryOperand {
                segment: register_name(instr.segment_prefix()),
                base: register_name(instr.memory_base()),
                index: register_name(instr.memory_index()),
                displacement: instr.memory_displacement32() as u16,
                size: instr.memory_size().size(),
            }),
            // implicit string operands are part of the mnemonic
            _ => continue,
        };
        operands.push(op);
    }

    let prefix = if instr.has_lock_prefix() {
        Some("lock")
    } else if instr.has_repne_prefix() {
        Some("repne")
    } else if instr.has_rep_prefix() {
        Some("rep")
    } else {
        None
    };

    Ok(Instruction {
        address,
        length: instr.len() as u16,
        prefix: prefix.map(str::to_string),
        mnemonic: format!("{:?}", instr.mnemonic()).to_ascii_lowercase(),
        operands,
        flow: flow_of(&instr),
    })
}
