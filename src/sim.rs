//! Reference executor
//!
//! `PimMachine` runs an encoded program the way the target does: a nest group
//! is collected from its `CONFIG` words and body, then the body runs once per
//! point of the configured domain with the innermost level fastest. Operands
//! are decoded from the 32-bit words, not from the abstract instructions.
//!
//! `evaluate_kernel` interprets the loop-nest IR directly, in source order,
//! against the same memory layout. Comparing the two checks the generator.

use thiserror::Error;

use crate::ast::{BinOp, UnaryOp};
use crate::encoder::Encoder;
use crate::hardware::PimProgram;
use crate::isa::{Fields, Opcode, ACC_REGISTER, LOAD_IMMEDIATE};
use crate::kernel::{scalar_value, Access, IndexExpr, Kernel, ScalarParam, StoreKind, ValueExpr};
use crate::mapper::{MemoryMap, MemoryRegion};

pub type SimResult<T> = Result<T, SimError>;

/// Execution failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("division by zero at {location}")]
    DivisionByZero { location: String },

    #[error("access to `{region}` at address {address} is outside its region")]
    OutOfRange { region: String, address: i64 },

    #[error("invalid instruction at {pc}: {message}")]
    InvalidInstruction { pc: usize, message: String },

    #[error("instruction at {pc} runs outside any CONFIG group")]
    MissingConfig { pc: usize },

    #[error("unknown region `{region}`")]
    UnknownRegion { region: String },

    #[error("unknown access pattern P{index} at {pc}")]
    UnknownPattern { pc: usize, index: u8 },

    #[error("cannot evaluate `{expr}`")]
    Unsupported { expr: String },
}

/// Byte memory laid out by a memory map
#[derive(Debug, Clone)]
pub struct Memory {
    map: MemoryMap,
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(map: &MemoryMap) -> Self {
        Self {
            map: map.clone(),
            bytes: vec![0; map.regions.iter().filter_map(MemoryRegion::end).max().unwrap_or(0) as usize],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn region(&self, name: &str) -> SimResult<&MemoryRegion> {
        self.map.region(name).ok_or_else(|| SimError::UnknownRegion {
            region: name.to_string(),
        })
    }

    /// Store `values` from the start of an operand's region
    pub fn load_array(&mut self, name: &str, values: &[i64]) -> SimResult<()> {
        let region = self.region(name)?.clone();
        let width = i64::from(region.operand.element_width_bytes);
        for (i, value) in values.iter().enumerate() {
            write(&mut self.bytes, &region, region.base_address as i64 + i as i64 * width, *value)?;
        }
        Ok(())
    }

    /// Every element of an operand's region
    pub fn read_array(&self, name: &str) -> SimResult<Vec<i64>> {
        let region = self.region(name)?;
        let width = u64::from(region.operand.element_width_bytes);
        (0..region.size_bytes / width)
            .map(|i| read(&self.bytes, region, (region.base_address + i * width) as i64))
            .collect()
    }
}

fn check(region: &MemoryRegion, address: i64) -> SimResult<usize> {
    let width = u64::from(region.operand.element_width_bytes);
    if address < 0 || !region.contains(address as u64, width) {
        return Err(SimError::OutOfRange {
            region: region.name().to_string(),
            address,
        });
    }
    Ok(address as usize)
}

/// Little-endian, sign-extended from the element width
fn read(bytes: &[u8], region: &MemoryRegion, address: i64) -> SimResult<i64> {
    let at = check(region, address)?;
    let width = region.operand.element_width_bytes as usize;
    let raw = bytes[at..at + width]
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let shift = 64 - 8 * width as u32;
    Ok(((raw << shift) as i64) >> shift)
}

fn write(bytes: &mut [u8], region: &MemoryRegion, address: i64, value: i64) -> SimResult<()> {
    let at = check(region, address)?;
    let width = region.operand.element_width_bytes as usize;
    bytes[at..at + width].copy_from_slice(&value.to_le_bytes()[..width]);
    Ok(())
}

/// Call `f` for every point of a rectangular domain, innermost level fastest
fn for_each_point(trips: &[u64], mut f: impl FnMut(&[u64]) -> SimResult<()>) -> SimResult<()> {
    if trips.iter().any(|&t| t == 0) {
        return Ok(());
    }
    let mut counters = vec![0u64; trips.len()];
    loop {
        f(&counters)?;
        let mut level = trips.len();
        loop {
            if level == 0 {
                return Ok(());
            }
            level -= 1;
            counters[level] += 1;
            if counters[level] < trips[level] {
                break;
            }
            counters[level] = 0;
        }
    }
}

#[derive(Debug, Default)]
struct Group {
    trips: Vec<u64>,
    body: Vec<(usize, Opcode, Fields)>,
}

/// Executes a compiled program
pub struct PimMachine<'p> {
    program: &'p PimProgram,
    memory: Memory,
    /// R0..R6 and ACC
    registers: [i64; 8],
}

impl<'p> PimMachine<'p> {
    pub fn new(program: &'p PimProgram) -> Self {
        Self {
            program,
            memory: Memory::new(&program.memory_map),
            registers: [0; 8],
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn load_array(&mut self, name: &str, values: &[i64]) -> SimResult<()> {
        self.memory.load_array(name, values)
    }

    pub fn read_array(&self, name: &str) -> SimResult<Vec<i64>> {
        self.memory.read_array(name)
    }

    /// Run the program until `NOP`
    pub fn run(&mut self) -> SimResult<()> {
        let words: Vec<Fields> = self
            .program
            .instructions
            .iter()
            .map(|inst| Fields::unpack(Encoder::encode(inst)))
            .collect();

        let mut group: Option<Group> = None;
        for (pc, fields) in words.into_iter().enumerate() {
            let opcode = Opcode::from_bits(fields.opcode).ok_or_else(|| SimError::InvalidInstruction {
                pc,
                message: format!("reserved opcode {}", fields.opcode),
            })?;

            match opcode {
                Opcode::Config => {
                    if fields.dest == 0 {
                        if let Some(done) = group.take() {
                            self.execute(&done)?;
                        }
                        group = Some(Group::default());
                    }
                    let current = group.as_mut().ok_or(SimError::MissingConfig { pc })?;
                    if !current.body.is_empty() || usize::from(fields.dest) != current.trips.len() {
                        return Err(SimError::InvalidInstruction {
                            pc,
                            message: format!("CONFIG L{} out of order", fields.dest),
                        });
                    }
                    current.trips.push(u64::from(fields.src1));
                }
                Opcode::Nop => {
                    if let Some(done) = group.take() {
                        self.execute(&done)?;
                    }
                    return Ok(());
                }
                _ => group
                    .as_mut()
                    .ok_or(SimError::MissingConfig { pc })?
                    .body
                    .push((pc, opcode, fields)),
            }
        }

        if let Some(done) = group.take() {
            self.execute(&done)?;
        }
        Ok(())
    }

    fn execute(&mut self, group: &Group) -> SimResult<()> {
        log::debug!(
            "executing group of {} instructions over {:?}",
            group.body.len(),
            group.trips
        );
        for_each_point(&group.trips, |counters| {
            for (pc, opcode, fields) in &group.body {
                self.step(*pc, *opcode, fields, counters)?;
            }
            Ok(())
        })
    }

    fn step(&mut self, pc: usize, opcode: Opcode, f: &Fields, counters: &[u64]) -> SimResult<()> {
        match opcode {
            Opcode::Load if f.aux == LOAD_IMMEDIATE => {
                self.set(pc, f.dest, i64::from(f.src1 as i8))?;
            }
            Opcode::Load => {
                let (region, address) = self.address(pc, f.src1, f.src2, counters)?;
                let value = read(&self.memory.bytes, region, address)?;
                self.set(pc, f.dest, value)?;
            }
            Opcode::Store => {
                let value = self.get(pc, f.src2)?;
                let (region, address) = self.address(pc, f.dest, f.src1, counters)?;
                write(&mut self.memory.bytes, region, address, value)?;
            }
            Opcode::Move => {
                let value = self.get(pc, f.src1)?;
                self.set(pc, f.dest, value)?;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let a = self.get(pc, f.src1)?;
                let b = self.get(pc, f.src2)?;
                let value = match opcode {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Sub => a.wrapping_sub(b),
                    Opcode::Mul => a.wrapping_mul(b),
                    _ => {
                        if b == 0 {
                            return Err(SimError::DivisionByZero {
                                location: format!("instruction {}", pc),
                            });
                        }
                        a.wrapping_div(b)
                    }
                };
                self.set(pc, f.dest, value)?;
            }
            Opcode::Config | Opcode::Nop => {
                return Err(SimError::InvalidInstruction {
                    pc,
                    message: format!("{} inside a group body", opcode),
                })
            }
        }
        Ok(())
    }

    /// Region and byte address of a region/pattern operand pair
    fn address(
        &self,
        pc: usize,
        region_field: u8,
        pattern_field: u8,
        counters: &[u64],
    ) -> SimResult<(&'p MemoryRegion, i64)> {
        let program = self.program;
        let pattern = program
            .patterns
            .get(usize::from(pattern_field))
            .ok_or(SimError::UnknownPattern {
                pc,
                index: pattern_field,
            })?;
        let region = program
            .memory_map
            .regions
            .get(usize::from(region_field))
            .ok_or_else(|| SimError::UnknownRegion {
                region: format!("#{}", region_field),
            })?;
        if pattern.region != usize::from(region_field) {
            return Err(SimError::InvalidInstruction {
                pc,
                message: format!("P{} does not address `{}`", pattern_field, region.name()),
            });
        }

        let address = pattern
            .coefficients
            .iter()
            .zip(counters)
            .fold(region.base_address as i64 + pattern.offset, |acc, (c, n)| {
                acc.wrapping_add(c.wrapping_mul(*n as i64))
            });
        Ok((region, address))
    }

    fn get(&self, pc: usize, register: u8) -> SimResult<i64> {
        self.registers
            .get(usize::from(register))
            .copied()
            .ok_or_else(|| bad_register(pc, register))
    }

    fn set(&mut self, pc: usize, register: u8, value: i64) -> SimResult<()> {
        let slot = self
            .registers
            .get_mut(usize::from(register))
            .ok_or_else(|| bad_register(pc, register))?;
        *slot = value;
        Ok(())
    }
}

fn bad_register(pc: usize, register: u8) -> SimError {
    SimError::InvalidInstruction {
        pc,
        message: format!("register {} does not exist (ACC is {})", register, ACC_REGISTER),
    }
}

/// Run the loop nests of `kernel` directly over `memory`
pub fn evaluate_kernel(kernel: &Kernel, memory: &mut Memory) -> SimResult<()> {
    for nest in &kernel.nests {
        let trips: Vec<u64> = nest.levels.iter().map(|l| l.trip_count()).collect();
        for_each_point(&trips, |counters| {
            let env = Env {
                ivs: nest
                    .levels
                    .iter()
                    .zip(counters)
                    .map(|(level, n)| (level.induction_var.as_str(), (n * level.stride) as i64))
                    .collect(),
                scalars: &kernel.scalars,
            };
            for stmt in &nest.body {
                let value = env.value(&stmt.value, memory)?;
                let (region, address) = env.locate(&stmt.target, memory)?;
                let value = match stmt.kind {
                    StoreKind::Assign => value,
                    StoreKind::Accumulate(op) => {
                        let old = read(&memory.bytes, &region, address)?;
                        apply(op, old, value)?
                    }
                };
                write(&mut memory.bytes, &region, address, value)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

struct Env<'a> {
    ivs: Vec<(&'a str, i64)>,
    scalars: &'a [ScalarParam],
}

impl Env<'_> {
    fn name(&self, name: &str) -> SimResult<i64> {
        self.ivs
            .iter()
            .find(|(v, _)| *v == name)
            .map(|(_, n)| *n)
            .or_else(|| scalar_value(self.scalars, name))
            .ok_or_else(|| SimError::Unsupported {
                expr: name.to_string(),
            })
    }

    fn locate(&self, access: &Access, memory: &Memory) -> SimResult<(MemoryRegion, i64)> {
        let region = memory.region(access.operand())?.clone();
        let element = match access {
            Access::Linear { index, .. } => self.index(index, memory)?,
            Access::MultiDim { indices, .. } => {
                let row_length = region.operand.row_length().unwrap_or(0) as i64;
                let mut element = 0i64;
                for (d, index) in indices.iter().enumerate() {
                    let value = self.index(index, memory)?;
                    element = if d == 0 { value } else { element * row_length + value };
                }
                element
            }
        };
        let address = region.base_address as i64 + element * i64::from(region.operand.element_width_bytes);
        Ok((region, address))
    }

    fn index(&self, expr: &IndexExpr, memory: &Memory) -> SimResult<i64> {
        match expr {
            IndexExpr::Const(n) => Ok(*n),
            IndexExpr::Induction(v) | IndexExpr::Param(v) => self.name(v),
            IndexExpr::Read(access) => {
                let (region, address) = self.locate(access, memory)?;
                read(&memory.bytes, &region, address)
            }
            IndexExpr::Binary(op, l, r) => apply(*op, self.index(l, memory)?, self.index(r, memory)?),
            IndexExpr::Neg(e) => Ok(self.index(e, memory)?.wrapping_neg()),
            IndexExpr::Opaque(text) => Err(SimError::Unsupported { expr: text.clone() }),
        }
    }

    fn value(&self, expr: &ValueExpr, memory: &Memory) -> SimResult<i64> {
        match expr {
            ValueExpr::Const(n) => Ok(*n),
            ValueExpr::Induction(v) | ValueExpr::Param(v) => self.name(v),
            ValueExpr::Read(access) => {
                let (region, address) = self.locate(access, memory)?;
                read(&memory.bytes, &region, address)
            }
            ValueExpr::Binary(op, l, r) => apply(*op, self.value(l, memory)?, self.value(r, memory)?),
            ValueExpr::Unary(op, e) => {
                let v = self.value(e, memory)?;
                Ok(match op {
                    UnaryOp::Neg => v.wrapping_neg(),
                    UnaryOp::Not => i64::from(v == 0),
                    UnaryOp::BitNot => !v,
                })
            }
        }
    }
}

/// C integer semantics over i64
fn apply(op: BinOp, a: i64, b: i64) -> SimResult<i64> {
    Ok(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div | BinOp::Rem => {
            if b == 0 {
                return Err(SimError::DivisionByZero {
                    location: format!("`{} {} {}`", a, op, b),
                });
            }
            if op == BinOp::Div {
                a.wrapping_div(b)
            } else {
                a.wrapping_rem(b)
            }
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => a.wrapping_shr(b as u32),
        BinOp::Lt => i64::from(a < b),
        BinOp::Le => i64::from(a <= b),
        BinOp::Gt => i64::from(a > b),
        BinOp::Ge => i64::from(a >= b),
        BinOp::Eq => i64::from(a == b),
        BinOp::Ne => i64::from(a != b),
        BinOp::And => i64::from(a != 0 && b != 0),
        BinOp::Or => i64::from(a != 0 || b != 0),
    })
}
