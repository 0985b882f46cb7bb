//! Encoder and emitter
//!
//! The encoder is a pure projection of an [`Instruction`] to its 32-bit word
//! and its text line. The emitter turns a whole [`PimProgram`] into an output
//! artifact and writes it to disk.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::hardware::PimProgram;
use crate::isa::{Fields, Instruction, Operand};

/// Text and binary form of one instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedInstruction {
    pub text: String,
    pub binary: u32,
}

pub struct Encoder;

impl Encoder {
    /// Pack an instruction into its word; absent operands are zero
    pub fn encode(inst: &Instruction) -> u32 {
        let field = |slot: &Option<Operand>| slot.as_ref().map_or(0, Operand::field);
        Fields {
            opcode: inst.opcode.bits(),
            dest: field(&inst.dest),
            src1: field(&inst.src1),
            src2: field(&inst.src2),
            aux: inst.aux,
        }
        .pack()
    }

    /// `MNEMONIC DEST, SRC1, SRC2 ; 0xHHHHHHHH`, or the bare `NOP`
    pub fn render(inst: &Instruction) -> String {
        if inst.is_nop() {
            return inst.opcode.mnemonic().to_string();
        }
        let slot = |slot: &Option<Operand>| {
            slot.as_ref().map_or_else(|| "_".to_string(), ToString::to_string)
        };
        format!(
            "{} {}, {}, {} ; 0x{:08x}",
            inst.opcode,
            slot(&inst.dest),
            slot(&inst.src1),
            slot(&inst.src2),
            Self::encode(inst)
        )
    }

    pub fn project(inst: &Instruction) -> EncodedInstruction {
        EncodedInstruction {
            text: Self::render(inst),
            binary: Self::encode(inst),
        }
    }
}

/// Artifact format written by the emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One instruction per line
    #[default]
    Text,
    /// The whole program, memory map and pattern table included
    Json,
    /// Little-endian 32-bit words
    Bin,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "bin" | "binary" => Ok(OutputFormat::Bin),
            other => Err(format!(
                "unknown output format `{}` (expected text, json or bin)",
                other
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Bin => write!(f, "bin"),
        }
    }
}

/// Writes compiled programs
pub struct Emitter {
    format: OutputFormat,
}

impl Emitter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Artifact bytes for a program
    pub fn render(&self, program: &PimProgram) -> CompileResult<Vec<u8>> {
        match self.format {
            OutputFormat::Text => {
                let mut out = String::new();
                for inst in &program.instructions {
                    out.push_str(&Encoder::render(inst));
                    out.push('\n');
                }
                Ok(out.into_bytes())
            }
            OutputFormat::Json => {
                let mut json = program.to_json().map_err(|e| CompileError::Io {
                    message: format!("cannot serialize program: {}", e),
                })?;
                json.push('\n');
                Ok(json.into_bytes())
            }
            OutputFormat::Bin => Ok(program
                .instructions
                .iter()
                .flat_map(|inst| Encoder::encode(inst).to_le_bytes())
                .collect()),
        }
    }

    /// Write the artifact to `path`
    ///
    /// The bytes go to a hidden sibling file first and are renamed into
    /// place, so `path` never holds a partial artifact.
    pub fn emit(&self, program: &PimProgram, path: &Path) -> CompileResult<()> {
        let bytes = self.render(program)?;
        let temp = temp_path(path);

        if let Err(e) = fs::write(&temp, &bytes).and_then(|_| fs::rename(&temp, path)) {
            let _ = fs::remove_file(&temp);
            return Err(CompileError::Io {
                message: format!("cannot write `{}`: {}", path.display(), e),
            });
        }

        log::info!(
            "wrote {} bytes of {} output to {}",
            bytes.len(),
            self.format,
            path.display()
        );
        Ok(())
    }

    /// Write the artifact to an open stream (stdout)
    pub fn write_to(&self, program: &PimProgram, writer: &mut impl Write) -> CompileResult<()> {
        let bytes = self.render(program)?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "out".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{}.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::PimConfig;
    use crate::isa::Opcode;
    use crate::mapper::MemoryMap;
    use pretty_assertions::assert_eq;

    fn region(index: u8, name: &str) -> Operand {
        Operand::Region {
            index,
            name: name.to_string(),
        }
    }

    fn sample_program() -> PimProgram {
        let mut program = PimProgram::new(PimConfig::default(), "k", MemoryMap::default());
        program.push(Instruction::config(0, 4, 4, 0));
        program.push(Instruction::load(Operand::Reg(0), region(0, "A"), 0));
        program.push(Instruction::store(region(1, "B"), 1, Operand::Reg(0)));
        program.push(Instruction::nop());
        program
    }

    #[test]
    fn test_encode_fields() {
        let word = Encoder::encode(&Instruction::arith(
            Opcode::Mul,
            Operand::Reg(0),
            Operand::Reg(0),
            Operand::Reg(1),
        ));
        assert_eq!(word, (6 << 26) | (1 << 2));

        let word = Encoder::encode(&Instruction::load_immediate(Operand::Reg(2), -1));
        assert_eq!(word, (1 << 26) | (2 << 18) | (0xff << 10) | 1);

        assert_eq!(Encoder::encode(&Instruction::nop()), 0);
    }

    #[test]
    fn test_render_lines() {
        assert_eq!(
            Encoder::render(&Instruction::config(1, 2, 4, 0)),
            "CONFIG L1, #2, #4 ; 0x44040810"
        );
        assert_eq!(
            Encoder::render(&Instruction::mov(Operand::Acc, Operand::Reg(0))),
            "MOVE ACC, R0, _ ; 0x0c1c0000"
        );
        assert_eq!(
            Encoder::render(&Instruction::store(region(2, "C"), 1, Operand::Acc)),
            "STORE C, P1, ACC ; 0x0808041c"
        );
        assert_eq!(Encoder::render(&Instruction::nop()), "NOP");
    }

    #[test]
    fn test_project() {
        let inst = Instruction::load(Operand::Reg(1), region(0, "A"), 3);
        let encoded = Encoder::project(&inst);
        assert_eq!(encoded.binary, Encoder::encode(&inst));
        assert!(encoded.text.ends_with(&format!("0x{:08x}", encoded.binary)));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("BIN".parse::<OutputFormat>(), Ok(OutputFormat::Bin));
        assert!("hex".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Text.to_string(), "text");
    }

    #[test]
    fn test_render_formats() {
        let program = sample_program();

        let text = String::from_utf8(Emitter::new(OutputFormat::Text).render(&program).unwrap()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.lines().last(), Some("NOP"));

        let bin = Emitter::new(OutputFormat::Bin).render(&program).unwrap();
        assert_eq!(bin.len(), 16);
        assert_eq!(
            bin[0..4].to_vec(),
            Encoder::encode(&program.instructions[0]).to_le_bytes().to_vec()
        );

        let json = Emitter::new(OutputFormat::Json).render(&program).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["kernel"], "k");
        assert_eq!(value["instructions"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn test_emit_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pim");
        fs::write(&path, "stale").unwrap();

        Emitter::new(OutputFormat::Text)
            .emit(&sample_program(), &path)
            .unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("CONFIG L0, #4, #4"));
        assert!(!dir.path().join(".out.pim.tmp").exists());
    }

    #[test]
    fn test_emit_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.pim");
        let err = Emitter::new(OutputFormat::Text)
            .emit(&sample_program(), &path)
            .unwrap_err();
        assert_eq!(err.kind(), "IoError");
        assert!(!path.exists());
    }
}
