//! PIM instruction set
//!
//! Every instruction is one 32-bit word:
//!
//! ```text
//!  31      26 25      18 17      10 9        2 1  0
//! +----------+----------+----------+----------+----+
//! |  opcode  |   dest   |   src1   |   src2   |aux |
//! +----------+----------+----------+----------+----+
//! ```
//!
//! Operand fields hold a register number, loop level, 8-bit immediate,
//! region index or access-pattern index depending on the opcode. Absent
//! operands are zero. `aux` selects the immediate form of `LOAD` and holds the
//! stride scale of `CONFIG`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::BinOp;

pub const OPCODE_SHIFT: u32 = 26;
pub const DEST_SHIFT: u32 = 18;
pub const SRC1_SHIFT: u32 = 10;
pub const SRC2_SHIFT: u32 = 2;
pub const OPCODE_MASK: u32 = 0x3f;
pub const FIELD_MASK: u32 = 0xff;
pub const AUX_MASK: u32 = 0x3;

/// Register number of the accumulator unit
pub const ACC_REGISTER: u8 = 7;
/// Scratch registers R0..R6
pub const MAX_SCRATCH_REGISTERS: u8 = 7;

/// `aux` value marking `LOAD Rd, #imm`
pub const LOAD_IMMEDIATE: u8 = 1;
/// Largest `CONFIG` stride scale (the stride field is shifted left by it)
pub const MAX_STRIDE_SCALE: u8 = 3;

/// Opcodes; unlisted 6-bit values are reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop = 0,
    Load = 1,
    Store = 2,
    Move = 3,
    Add = 4,
    Sub = 5,
    Mul = 6,
    Div = 7,
    Config = 17,
}

impl Opcode {
    pub const ALL: [Opcode; 9] = [
        Opcode::Nop,
        Opcode::Load,
        Opcode::Store,
        Opcode::Move,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Config,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Load => "LOAD",
            Opcode::Store => "STORE",
            Opcode::Move => "MOVE",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Config => "CONFIG",
        }
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Opcode> {
        Self::ALL.into_iter().find(|op| op.bits() == bits)
    }

    /// Datapath opcode implementing a source operator
    pub fn for_operator(op: BinOp) -> Option<Opcode> {
        match op {
            BinOp::Add => Some(Opcode::Add),
            BinOp::Sub => Some(Opcode::Sub),
            BinOp::Mul => Some(Opcode::Mul),
            BinOp::Div => Some(Opcode::Div),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// An operand slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Scratch register `R0`..`R6`
    Reg(u8),
    /// Accumulator unit
    Acc,
    /// Loop level `L<n>`
    Level(u8),
    /// Signed 8-bit immediate
    Imm(i8),
    /// Unsigned 8-bit count (`CONFIG` trip count and stride)
    Count(u8),
    /// Memory region, by index into the memory map
    Region { index: u8, name: String },
    /// Access pattern `P<n>`
    Pattern(u8),
}

impl Operand {
    /// Raw 8-bit field value
    pub fn field(&self) -> u8 {
        match self {
            Operand::Reg(r) => *r,
            Operand::Acc => ACC_REGISTER,
            Operand::Level(n) | Operand::Count(n) | Operand::Pattern(n) => *n,
            Operand::Imm(v) => *v as u8,
            Operand::Region { index, .. } => *index,
        }
    }

    /// Register number, for register operands
    pub fn register(&self) -> Option<u8> {
        match self {
            Operand::Reg(r) => Some(*r),
            Operand::Acc => Some(ACC_REGISTER),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "R{}", r),
            Operand::Acc => write!(f, "ACC"),
            Operand::Level(n) => write!(f, "L{}", n),
            Operand::Imm(v) => write!(f, "#{}", v),
            Operand::Count(n) => write!(f, "#{}", n),
            Operand::Region { name, .. } => write!(f, "{}", name),
            Operand::Pattern(n) => write!(f, "P{}", n),
        }
    }
}

/// One abstract instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dest: Option<Operand>,
    pub src1: Option<Operand>,
    pub src2: Option<Operand>,
    pub aux: u8,
}

impl Instruction {
    fn new(
        opcode: Opcode,
        dest: Option<Operand>,
        src1: Option<Operand>,
        src2: Option<Operand>,
        aux: u8,
    ) -> Self {
        Self {
            opcode,
            dest,
            src1,
            src2,
            aux,
        }
    }

    /// `CONFIG L<level>, #trips, #stride` with the stride pre-scaled by `scale`
    pub fn config(level: u8, trips: u8, stride: u8, scale: u8) -> Self {
        Self::new(
            Opcode::Config,
            Some(Operand::Level(level)),
            Some(Operand::Count(trips)),
            Some(Operand::Count(stride)),
            scale,
        )
    }

    /// `LOAD Rd, <region>, P<n>`
    pub fn load(dest: Operand, region: Operand, pattern: u8) -> Self {
        Self::new(Opcode::Load, Some(dest), Some(region), Some(Operand::Pattern(pattern)), 0)
    }

    /// `LOAD Rd, #imm, _`
    pub fn load_immediate(dest: Operand, value: i8) -> Self {
        Self::new(
            Opcode::Load,
            Some(dest),
            Some(Operand::Imm(value)),
            None,
            LOAD_IMMEDIATE,
        )
    }

    /// `STORE <region>, P<n>, Rs`
    pub fn store(region: Operand, pattern: u8, src: Operand) -> Self {
        Self::new(Opcode::Store, Some(region), Some(Operand::Pattern(pattern)), Some(src), 0)
    }

    /// `MOVE Rd, Rs, _`
    pub fn mov(dest: Operand, src: Operand) -> Self {
        Self::new(Opcode::Move, Some(dest), Some(src), None, 0)
    }

    /// `ADD|SUB|MUL|DIV Rd, Ra, Rb`
    pub fn arith(opcode: Opcode, dest: Operand, a: Operand, b: Operand) -> Self {
        Self::new(opcode, Some(dest), Some(a), Some(b), 0)
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, None, None, None, 0)
    }

    pub fn is_nop(&self) -> bool {
        self.opcode == Opcode::Nop
    }
}

/// Fields of an encoded word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fields {
    pub opcode: u32,
    pub dest: u8,
    pub src1: u8,
    pub src2: u8,
    pub aux: u8,
}

impl Fields {
    pub fn unpack(word: u32) -> Self {
        Self {
            opcode: (word >> OPCODE_SHIFT) & OPCODE_MASK,
            dest: ((word >> DEST_SHIFT) & FIELD_MASK) as u8,
            src1: ((word >> SRC1_SHIFT) & FIELD_MASK) as u8,
            src2: ((word >> SRC2_SHIFT) & FIELD_MASK) as u8,
            aux: (word & AUX_MASK) as u8,
        }
    }

    pub fn pack(self) -> u32 {
        ((self.opcode & OPCODE_MASK) << OPCODE_SHIFT)
            | ((self.dest as u32) << DEST_SHIFT)
            | ((self.src1 as u32) << SRC1_SHIFT)
            | ((self.src2 as u32) << SRC2_SHIFT)
            | (self.aux as u32 & AUX_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_numbers_fit_field() {
        for op in Opcode::ALL {
            assert!(op.bits() <= OPCODE_MASK);
            assert_eq!(Opcode::from_bits(op.bits()), Some(op));
        }
        assert_eq!(Opcode::from_bits(9), None);
    }

    #[test]
    fn test_fields_layout() {
        let fields = Fields {
            opcode: Opcode::Config.bits(),
            dest: 2,
            src1: 10,
            src2: 255,
            aux: 3,
        };
        let word = fields.pack();
        assert_eq!(word >> 26, 17);
        assert_eq!(word & 0x3, 3);
        assert_eq!(Fields::unpack(word), fields);
    }

    #[test]
    fn test_operand_fields() {
        assert_eq!(Operand::Acc.field(), 7);
        assert_eq!(Operand::Imm(-1).field(), 0xff);
        assert_eq!(Operand::Acc.to_string(), "ACC");
        assert_eq!(Operand::Imm(-3).to_string(), "#-3");
        assert_eq!(Operand::Pattern(4).to_string(), "P4");
    }

    #[test]
    fn test_operator_opcodes() {
        assert_eq!(Opcode::for_operator(BinOp::Div), Some(Opcode::Div));
        assert_eq!(Opcode::for_operator(BinOp::Rem), None);
    }
}
