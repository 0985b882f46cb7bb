//! PIM Kernel Compiler
//!
//! This library compiles loop-nest kernels written in a small C subset into
//! the instruction stream of a Processing-In-Memory accelerator. The memory
//! mapper places every array in PIM address space and resolves each access to
//! an affine address formula; the code generator emits one `CONFIG` per loop
//! level and the loop body once, leaving repetition to the hardware.
//!
//! # Example
//!
//! ```rust
//! use pim_compiler::compile;
//!
//! let program = compile(
//!     "void scale(int A[4], int B[4]) {
//!         for (int i = 0; i < 4; i++) B[i] = A[i] * 3;
//!     }",
//! )
//! .unwrap();
//! println!("{}", program);
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod kernel;
pub mod analyzer;
pub mod affine;
pub mod mapper;
pub mod isa;
pub mod codegen;
pub mod encoder;
pub mod hardware;
pub mod context;
pub mod sim;
pub mod advisor;
pub mod error;

pub use parser::Parser;
pub use analyzer::Analyzer;
pub use kernel::Kernel;
pub use mapper::{MappedKernel, MemoryMap, MemoryMapper};
pub use codegen::CodeGenerator;
pub use encoder::{Emitter, Encoder, OutputFormat};
pub use hardware::{PimConfig, PimProgram};
pub use context::CompilationContext;
pub use advisor::{advise_kernel, advise_program, Suggestion};
pub use error::{CompileError, CompileResult};

/// What to compile out of a translation unit
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Function to compile; the first one when unset
    pub kernel: Option<String>,
    /// Compile-time values of scalar parameters
    pub bindings: Vec<(String, i64)>,
}

/// Every stage's output for one kernel
#[derive(Debug, Clone)]
pub struct Compilation {
    pub kernel: Kernel,
    pub mapped: MappedKernel,
    pub program: PimProgram,
}

/// Run the whole pipeline under `ctx`
pub fn compile_kernel(
    source: &str,
    options: &CompileOptions,
    ctx: &mut CompilationContext,
) -> CompileResult<Compilation> {
    let mut parser = Parser::new(source);
    let unit = parser.parse_translation_unit()?;
    log::info!("parsed {} function(s)", unit.functions.len());

    let mut analyzer = Analyzer::new();
    for (name, value) in &options.bindings {
        analyzer.bind_scalar(name, *value);
    }
    let kernel = analyzer.analyze(&unit, options.kernel.as_deref(), ctx)?;

    // Fresh mapper and generator per compilation
    let mapped = MemoryMapper::new(ctx.config.clone()).map(&kernel, ctx)?;
    let program = CodeGenerator::new(ctx.config.clone()).generate(&mapped)?;

    Ok(Compilation {
        kernel,
        mapped,
        program,
    })
}

/// Compile the first function of `source` with the default configuration
pub fn compile(source: &str) -> CompileResult<PimProgram> {
    compile_with_bindings(source, &[])
}

/// Compile with scalar parameters bound to compile-time values
pub fn compile_with_bindings(source: &str, bindings: &[(&str, i64)]) -> CompileResult<PimProgram> {
    let options = CompileOptions {
        kernel: None,
        bindings: bindings
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect(),
    };
    let mut ctx = CompilationContext::new(PimConfig::default());
    compile_kernel(source, &options, &mut ctx).map(|c| c.program)
}
