//! Optimization advisor
//!
//! Looks at a kernel's loop nests and at the instruction mix of its compiled
//! program and suggests changes that suit the PIM target better. Nothing here
//! rewrites code; suggestions are text for the user.

use std::fmt;

use crate::affine::{self, AffineForm};
use crate::hardware::PimProgram;
use crate::isa::Opcode;
use crate::kernel::{Access, Kernel, LoopNest, StoreKind};

/// Loop length above which a reduction nest is worth tiling
pub const BLOCK_SIZE: u64 = 16;

/// What a suggestion is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    LoopOrder,
    MatrixLayout,
    Blocking,
    ReduceMoves,
    ComputeIntensity,
    MulAddPairs,
}

impl Advice {
    pub fn title(self) -> &'static str {
        match self {
            Advice::LoopOrder => "Reorder loops",
            Advice::MatrixLayout => "Matrix layout",
            Advice::Blocking => "Blocking",
            Advice::ReduceMoves => "Reduce MOVE operations",
            Advice::ComputeIntensity => "Improve computation intensity",
            Advice::MulAddPairs => "Parallelize MUL-ADD pairs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub advice: Advice,
    pub detail: String,
}

impl Suggestion {
    fn new(advice: Advice, detail: impl Into<String>) -> Self {
        Self {
            advice,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.advice.title(), self.detail)
    }
}

fn push_unique(out: &mut Vec<Suggestion>, suggestion: Suggestion) {
    if !out.contains(&suggestion) {
        out.push(suggestion);
    }
}

/// Source-level suggestions from the shape of each loop nest
pub fn advise_kernel(kernel: &Kernel) -> Vec<Suggestion> {
    let mut out = Vec::new();
    for nest in &kernel.nests {
        advise_nest(kernel, nest, &mut out);
    }
    log::info!("advisor: {} source suggestion(s) for `{}`", out.len(), kernel.name);
    out
}

fn advise_nest(kernel: &Kernel, nest: &LoopNest, out: &mut Vec<Suggestion>) {
    let Some((innermost, outer)) = nest.levels.split_last() else {
        return;
    };
    // Elements an access advances per iteration of a level
    let step = |form: &AffineForm, var: &str, stride: u64| {
        form.coefficient(var).unsigned_abs().saturating_mul(stride)
    };

    for stmt in &nest.body {
        for access in stmt.accesses() {
            let Ok(form) = affine::flatten(access, &kernel.operands, &kernel.scalars) else {
                continue;
            };
            let jump = step(&form, &innermost.induction_var, innermost.stride);
            if jump <= 1 {
                continue;
            }

            let contiguous = outer
                .iter()
                .rev()
                .find(|level| level.trip_count() > 1 && step(&form, &level.induction_var, level.stride) == 1);
            if let Some(level) = contiguous {
                push_unique(
                    out,
                    Suggestion::new(
                        Advice::LoopOrder,
                        format!(
                            "`{}` jumps {} elements per iteration of the innermost loop `{}`; \
                             making `{}` the innermost loop walks it contiguously",
                            access, jump, innermost.induction_var, level.induction_var
                        ),
                    ),
                );
                continue;
            }

            let row_length = kernel.operand(access.operand()).and_then(|o| o.row_length());
            if matches!(access, Access::MultiDim { .. }) && row_length == Some(jump) {
                push_unique(
                    out,
                    Suggestion::new(
                        Advice::MatrixLayout,
                        format!(
                            "`{}` walks a column of `{}` in loop `{}`; storing `{}` transposed \
                             makes that walk contiguous",
                            access,
                            access.operand(),
                            innermost.induction_var,
                            access.operand()
                        ),
                    ),
                );
            }
        }
    }

    if nest.levels.len() >= 3 && is_reduction(kernel, nest) {
        let long: Vec<&str> = nest
            .levels
            .iter()
            .filter(|l| l.trip_count() > BLOCK_SIZE)
            .map(|l| l.induction_var.as_str())
            .collect();
        if !long.is_empty() {
            let vars: Vec<&str> = nest.levels.iter().map(|l| l.induction_var.as_str()).collect();
            push_unique(
                out,
                Suggestion::new(
                    Advice::Blocking,
                    format!(
                        "loops ({}) run past {} iterations in `{}`; tiling ({}) into blocks of {} \
                         keeps each block's operands close to the compute units",
                        long.join(", "),
                        BLOCK_SIZE,
                        kernel.name,
                        vars.join(", "),
                        BLOCK_SIZE
                    ),
                ),
            );
        }
    }
}

/// An accumulation whose target ignores at least one repeating level
fn is_reduction(kernel: &Kernel, nest: &LoopNest) -> bool {
    nest.body.iter().any(|stmt| {
        let StoreKind::Accumulate(_) = stmt.kind else {
            return false;
        };
        let Ok(form) = affine::flatten(&stmt.target, &kernel.operands, &kernel.scalars) else {
            return false;
        };
        nest.levels
            .iter()
            .any(|l| l.trip_count() > 1 && form.coefficient(&l.induction_var) == 0)
    })
}

/// Instruction-level suggestions from the compiled program's mix
pub fn advise_program(program: &PimProgram) -> Vec<Suggestion> {
    let mut out = Vec::new();
    let total = program.instructions.len();

    let moves = program.count(Opcode::Move);
    if moves * 3 > total {
        out.push(Suggestion::new(
            Advice::ReduceMoves,
            format!(
                "{} of {} instructions are MOVE; reorganizing accesses would cut data movement",
                moves, total
            ),
        ));
    }

    let compute = program.count(Opcode::Add) + program.count(Opcode::Mul);
    let memory = program.count(Opcode::Load) + program.count(Opcode::Store);
    if compute * 2 < memory {
        out.push(Suggestion::new(
            Advice::ComputeIntensity,
            format!(
                "{} compute against {} memory instructions; loop fusion or blocking would raise \
                 the work done per access",
                compute, memory
            ),
        ));
    }

    let pairs = program
        .instructions
        .windows(2)
        .filter(|w| w[0].opcode == Opcode::Mul && w[1].opcode == Opcode::Add)
        .count();
    if pairs > 0 {
        out.push(Suggestion::new(
            Advice::MulAddPairs,
            format!(
                "MUL feeds ADD directly {} time(s); restructuring the loops would let \
                 the PIM units overlap them",
                pairs
            ),
        ));
    }

    log::info!("advisor: {} instruction suggestion(s) for `{}`", out.len(), program.kernel);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::context::CompilationContext;
    use crate::hardware::PimConfig;
    use crate::isa::{Instruction, Operand};
    use crate::mapper::MemoryMap;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn kernel(source: &str) -> Kernel {
        let unit = Parser::new(source).parse_translation_unit().unwrap();
        let mut ctx = CompilationContext::new(PimConfig::default());
        Analyzer::new().analyze(&unit, None, &mut ctx).unwrap()
    }

    fn advice(suggestions: &[Suggestion]) -> Vec<Advice> {
        suggestions.iter().map(|s| s.advice).collect()
    }

    fn matmul(n: u32) -> String {
        format!(
            "void mm(int A[{n}][{n}], int B[{n}][{n}], int C[{n}][{n}]) {{
                for (int i = 0; i < {n}; i++)
                    for (int j = 0; j < {n}; j++)
                        for (int k = 0; k < {n}; k++)
                            C[i][j] += A[i][k] * B[k][j];
            }}"
        )
    }

    #[test]
    fn test_column_walk_in_innermost_loop_suggests_reordering() {
        let suggestions = advise_kernel(&kernel(&matmul(2)));
        assert_eq!(advice(&suggestions), vec![Advice::LoopOrder]);
        assert_eq!(
            suggestions[0].to_string(),
            "Reorder loops: `B[k][j]` jumps 2 elements per iteration of the innermost loop `k`; \
             making `j` the innermost loop walks it contiguously"
        );
    }

    #[test]
    fn test_long_reduction_suggests_blocking() {
        let suggestions = advise_kernel(&kernel(&matmul(32)));
        assert_eq!(advice(&suggestions), vec![Advice::LoopOrder, Advice::Blocking]);
        assert!(suggestions[1].detail.contains("tiling (i, j, k) into blocks of 16"));
    }

    #[test]
    fn test_column_only_access_suggests_transposed_layout() {
        let suggestions = advise_kernel(&kernel(
            "void col(int A[4][4], int B[4]) { for (int i = 0; i < 4; i++) B[i] = A[i][0]; }",
        ));
        assert_eq!(advice(&suggestions), vec![Advice::MatrixLayout]);
        assert!(suggestions[0].detail.contains("storing `A` transposed"));
    }

    #[test]
    fn test_contiguous_kernel_has_no_source_suggestions() {
        let suggestions = advise_kernel(&kernel(
            "void add(int A[8], int B[8]) { for (int i = 0; i < 8; i++) B[i] = A[i] + 1; }",
        ));
        assert_eq!(suggestions, vec![]);
    }

    #[test]
    fn test_program_mix_suggestions() {
        let program = crate::compile(&matmul(2)).unwrap();
        assert_eq!(advice(&advise_program(&program)), vec![Advice::MulAddPairs]);

        let copy = crate::compile(
            "void copy(int A[8], int B[8]) { for (int i = 0; i < 8; i++) B[i] = A[i]; }",
        )
        .unwrap();
        let suggestions = advise_program(&copy);
        assert_eq!(advice(&suggestions), vec![Advice::ComputeIntensity]);
        assert!(suggestions[0].detail.starts_with("0 compute against 2 memory"));
    }

    #[test]
    fn test_move_heavy_program() {
        let mut program = PimProgram::new(PimConfig::default(), "moves", MemoryMap::default());
        program.push(Instruction::config(0, 1, 0, 0));
        program.push(Instruction::mov(Operand::Acc, Operand::Reg(0)));
        program.push(Instruction::mov(Operand::Reg(1), Operand::Acc));
        program.push(Instruction::arith(Opcode::Add, Operand::Reg(1), Operand::Reg(1), Operand::Reg(0)));
        program.push(Instruction::nop());

        let suggestions = advise_program(&program);
        assert_eq!(advice(&suggestions), vec![Advice::ReduceMoves]);
        assert_eq!(
            suggestions[0].detail,
            "2 of 5 instructions are MOVE; reorganizing accesses would cut data movement"
        );
    }
}
