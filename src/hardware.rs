//! Hardware interface definitions for the PIM accelerator
//!
//! `PimConfig` describes the target (address space, alignment, register file)
//! and `PimProgram` is the compiled artifact: the instruction stream plus the
//! memory map and access-pattern table the instructions refer to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};
use crate::isa::{Instruction, Opcode, MAX_SCRATCH_REGISTERS};
use crate::mapper::MemoryMap;

/// Configuration for the PIM target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PimConfig {
    /// Bytes of PIM-addressable memory
    pub address_space_bytes: u64,
    /// First address handed out by the bump allocator
    pub base_address: u64,
    /// Minimum region alignment; element width applies when larger
    pub region_alignment: u64,
    /// Scratch registers available to the generator (R0..)
    pub scratch_registers: u8,
    /// Deepest loop nest a CONFIG group may describe
    pub max_loop_depth: usize,
    /// Externally supplied base addresses, by operand name
    pub pinned_regions: BTreeMap<String, u64>,
}

impl PimConfig {
    /// 64 banks of 1 KiB
    pub fn default_64k() -> Self {
        Self {
            address_space_bytes: 64 * 1024,
            base_address: 0,
            region_alignment: 1,
            scratch_registers: MAX_SCRATCH_REGISTERS,
            max_loop_depth: 8,
            pinned_regions: BTreeMap::new(),
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> CompileResult<Self> {
        let config: PimConfig = serde_json::from_str(json)
            .map_err(|e| CompileError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.scratch_registers == 0 || self.scratch_registers > MAX_SCRATCH_REGISTERS {
            return Err(CompileError::config(format!(
                "scratch_registers must be between 1 and {}, found {}",
                MAX_SCRATCH_REGISTERS, self.scratch_registers
            )));
        }
        if !self.region_alignment.is_power_of_two() {
            return Err(CompileError::config(format!(
                "region_alignment must be a power of two, found {}",
                self.region_alignment
            )));
        }
        if self.max_loop_depth == 0 || self.max_loop_depth > 256 {
            return Err(CompileError::config(format!(
                "max_loop_depth must be between 1 and 256, found {}",
                self.max_loop_depth
            )));
        }
        if self.base_address >= self.address_space_bytes {
            return Err(CompileError::config(format!(
                "base_address 0x{:x} lies outside the {}-byte address space",
                self.base_address, self.address_space_bytes
            )));
        }
        Ok(())
    }
}

impl Default for PimConfig {
    fn default() -> Self {
        Self::default_64k()
    }
}

/// Entry of the access-pattern table
///
/// Address of an access under counters `c` of the current nest group:
/// `base(region) + offset + Σ coefficients[l] * c[l]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPattern {
    pub region: usize,
    pub offset: i64,
    /// Bytes per iteration of each nest level
    pub coefficients: Vec<i64>,
}

/// A complete PIM program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PimProgram {
    /// Configuration the program was compiled for
    pub config: PimConfig,
    /// Name of the compiled kernel
    pub kernel: String,
    pub memory_map: MemoryMap,
    pub patterns: Vec<AccessPattern>,
    pub instructions: Vec<Instruction>,
    /// Human-readable summary
    pub summary: String,
}

impl PimProgram {
    pub fn new(config: PimConfig, kernel: impl Into<String>, memory_map: MemoryMap) -> Self {
        Self {
            config,
            kernel: kernel.into(),
            memory_map,
            patterns: Vec::new(),
            instructions: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn push(&mut self, instruction: Instruction) {
        log::debug!("emit {:?}", instruction);
        self.instructions.push(instruction);
    }

    /// Index of `pattern` in the table, adding it if new
    pub fn intern_pattern(&mut self, pattern: AccessPattern) -> usize {
        match self.patterns.iter().position(|p| *p == pattern) {
            Some(index) => index,
            None => {
                self.patterns.push(pattern);
                self.patterns.len() - 1
            }
        }
    }

    /// Number of instructions with the given opcode
    pub fn count(&self, opcode: Opcode) -> usize {
        self.instructions.iter().filter(|i| i.opcode == opcode).count()
    }

    /// Number of nest groups (each starts at `CONFIG L0`)
    pub fn nest_groups(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| {
                i.opcode == Opcode::Config
                    && i.dest.as_ref().map_or(false, |d| d.field() == 0)
            })
            .count()
    }

    /// Generate a summary of the program
    pub fn generate_summary(&mut self) {
        let mut per_opcode = String::new();
        for opcode in Opcode::ALL {
            let n = self.count(opcode);
            if n > 0 {
                if !per_opcode.is_empty() {
                    per_opcode.push_str(", ");
                }
                per_opcode.push_str(&format!("{} {}", n, opcode));
            }
        }

        self.summary = format!(
            "PIM Program Summary:\n\
             ====================\n\
             Kernel: {}\n\
             Address space: {} bytes\n\
             Regions: {} ({} bytes mapped)\n\
             Access patterns: {}\n\
             Nest groups: {}\n\
             Instructions: {} ({})\n",
            self.kernel,
            self.config.address_space_bytes,
            self.memory_map.regions.len(),
            self.memory_map.total_bytes(),
            self.patterns.len(),
            self.nest_groups(),
            self.instructions.len(),
            per_opcode
        );
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for PimProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PIM Program: {}", self.kernel)?;
        writeln!(f, "{}", "=".repeat(13 + self.kernel.len()))?;
        for region in &self.memory_map.regions {
            writeln!(f, "{}", region)?;
        }
        writeln!(f)?;

        for (i, p) in self.patterns.iter().enumerate() {
            let coefficients: Vec<String> = p.coefficients.iter().map(i64::to_string).collect();
            writeln!(
                f,
                "P{}: region {} offset {} coefficients [{}]",
                i,
                self.memory_map
                    .regions
                    .get(p.region)
                    .map_or("?", |r| r.name()),
                p.offset,
                coefficients.join(", ")
            )?;
        }
        writeln!(f)?;

        for inst in &self.instructions {
            writeln!(f, "{}", crate::encoder::Encoder::render(inst))?;
        }
        Ok(())
    }
}
