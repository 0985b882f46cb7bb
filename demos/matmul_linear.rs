//! Example: Matrix Multiplication over Pointer Operands
//!
//! Compiles the linear-index matmul with its bounds bound at compile time and
//! shows that it maps to the same layout and address expressions as the
//! 2-D declared version.
//!
//! Run with: cargo run --example matmul_linear

use pim_compiler::{compile_kernel, CompilationContext, CompileOptions, PimConfig};

const LINEAR: &str = include_str!("../kernels/matmul_linear.c");
const DECLARED: &str = include_str!("../kernels/matmul_2d.c");

fn main() {
    println!("=== Linear-Index Matrix Multiplication Example ===\n");

    let options = CompileOptions {
        kernel: None,
        bindings: vec![
            ("rows".to_string(), 3),
            ("cols".to_string(), 4),
            ("common".to_string(), 2),
        ],
    };
    let mut ctx = CompilationContext::new(PimConfig::default());
    let linear = compile_kernel(LINEAR, &options, &mut ctx).unwrap();

    println!("Bindings: rows=3, cols=4, common=2\n");
    println!("{}", linear.kernel);
    for line in ctx.mapping_report() {
        println!("  {}", line);
    }
    println!();

    let mut ctx = CompilationContext::new(PimConfig::default());
    let declared = compile_kernel(DECLARED, &CompileOptions::default(), &mut ctx).unwrap();

    println!("Address expressions, linear vs. declared 2-D:");
    for (l, d) in linear.mapped.nests.iter().zip(&declared.mapped.nests) {
        for (ls, ds) in l.body.iter().zip(&d.body) {
            let same = ls.target == ds.target;
            println!("  {:<28} {:<28} {}", ls.target.to_string(), ds.target.to_string(), if same { "same" } else { "DIFFERENT" });
        }
    }
    println!();

    let text = |c: &pim_compiler::Compilation| {
        c.program
            .instructions
            .iter()
            .map(pim_compiler::Encoder::render)
            .collect::<Vec<_>>()
    };
    println!(
        "Instruction streams identical: {}",
        text(&linear) == text(&declared)
    );
}
