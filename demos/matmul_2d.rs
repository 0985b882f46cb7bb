//! Example: 3x2 by 2x4 Matrix Multiplication
//!
//! Compiles a matmul over fixed 2-D operands, prints the memory mapping and
//! the instruction stream, then runs it on the reference executor.
//!
//! Run with: cargo run --example matmul_2d

use pim_compiler::sim::PimMachine;
use pim_compiler::{compile_kernel, CompilationContext, CompileOptions, PimConfig};

const SOURCE: &str = include_str!("../kernels/matmul_2d.c");

fn main() {
    println!("=== 2-D Matrix Multiplication Example ===\n");

    let mut ctx = CompilationContext::new(PimConfig::default());
    let compilation = compile_kernel(SOURCE, &CompileOptions::default(), &mut ctx).unwrap();

    println!("Loop-nest IR:");
    println!("{}", compilation.kernel);

    println!("Memory layout:");
    for line in ctx.mapping_report() {
        println!("  {}", line);
    }
    println!();

    let program = &compilation.program;
    println!("{}", program);
    println!("{}", program.summary);

    // | 1 2 |   | 1 2 3 4 |   | 11 14 17 20 |
    // | 3 4 | * | 5 6 7 8 | = | 23 30 37 44 |
    // | 5 6 |                 | 35 46 57 68 |
    let mut machine = PimMachine::new(program);
    machine.load_array("A", &[1, 2, 3, 4, 5, 6]).unwrap();
    machine.load_array("B", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    machine.run().unwrap();

    println!("Result C (row-major):");
    for row in machine.read_array("C").unwrap().chunks(4) {
        println!("  {:?}", row);
    }
}
