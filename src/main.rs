//! PIM kernel compiler CLI
//!
//! Usage:
//!   pimc kernels/matmul_2d.c -o matmul.pim
//!   pimc kernels/matmul_linear.c -D rows=3 -D cols=4 -D common=2 --dump-ir
//!   cat kernel.c | pimc - --format json -o -
//!   pimc kernels/matmul_2d.c --refactor-only

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fmt::Display;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use pim_compiler::{
    advise_kernel, advise_program, Analyzer, CodeGenerator, CompilationContext, CompileError,
    CompileResult, Emitter, MemoryMapper, OutputFormat, Parser, PimConfig, Suggestion,
};

#[derive(ClapParser, Debug)]
#[command(name = "pimc")]
#[command(author = "PIM Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles C loop-nest kernels to PIM instruction streams")]
struct Args {
    /// Kernel source file, `-` for stdin
    #[arg(value_name = "INPUT")]
    input: String,

    /// Output artifact, `-` for stdout
    #[arg(short = 'o', long = "output", default_value = "a.out")]
    output: String,

    /// Verbose output (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the loop-nest IR to stderr
    #[arg(long = "dump-ir")]
    dump_ir: bool,

    /// Function to compile (defaults to the first)
    #[arg(short = 'k', long = "kernel")]
    kernel: Option<String>,

    /// Bind a scalar parameter (e.g., "rows=3")
    #[arg(short = 'D', long = "bind", value_parser = parse_binding)]
    bindings: Vec<(String, i64)>,

    /// Architecture configuration (JSON)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Artifact format: text, json or bin
    #[arg(long = "format", default_value = "text")]
    format: OutputFormat,

    /// PIM address space in bytes
    #[arg(long = "address-space")]
    address_space: Option<u64>,

    /// Print optimization suggestions for the kernel and its instructions
    #[arg(long = "refactor")]
    refactor: bool,

    /// Print source suggestions only; no code is generated
    #[arg(long = "refactor-only")]
    refactor_only: bool,
}

fn parse_binding(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid binding format: {}", s))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing parameter name: {}", s));
    }
    let value = value
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("Invalid value for {}: {}", name, value))?;

    Ok((name.to_string(), value))
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("{} {}", "Error:".red(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> CompileResult<()> {
    // Informational output moves to stderr when the artifact goes to stdout
    let to_file = args.output != "-";
    let info = |line: &dyn Display| {
        if to_file {
            println!("{}", line);
        } else {
            eprintln!("{}", line);
        }
    };

    let source = read_source(&args.input)?;
    let config = load_config(args)?;

    if args.verbose > 0 {
        info(&"PIM Kernel Compiler".bold().blue());
        info(&"=".repeat(35));
        info(&format!("{}: {}", "Input".green(), args.input));
        info(&format!(
            "{}: {} bytes, {} scratch registers",
            "Target".green(),
            config.address_space_bytes,
            config.scratch_registers
        ));
    }

    let mut parser = Parser::new(&source);
    let unit = parser.parse_translation_unit()?;
    eprintln!("Translation unit parsed successfully");

    let mut analyzer = Analyzer::new();
    for (name, value) in &args.bindings {
        analyzer.bind_scalar(name, *value);
    }
    let mut ctx = CompilationContext::new(config.clone());
    let kernel = analyzer.analyze(&unit, args.kernel.as_deref(), &mut ctx)?;

    if args.dump_ir {
        eprint!("{}", kernel);
    }

    if args.refactor || args.refactor_only {
        print_suggestions(&info, "Refactoring suggestions", &advise_kernel(&kernel));
        if args.refactor_only {
            return Ok(());
        }
    }

    let mapped = MemoryMapper::new(config.clone()).map(&kernel, &mut ctx)?;
    for line in ctx.mapping_report() {
        info(&line.cyan());
    }

    let program = CodeGenerator::new(config).generate(&mapped)?;

    let emitter = Emitter::new(args.format);
    if to_file {
        emitter.emit(&program, Path::new(&args.output))?;
    } else {
        emitter.write_to(&program, &mut io::stdout().lock())?;
    }

    info(&"");
    info(&program.summary.trim_end());
    if args.refactor {
        print_suggestions(&info, "Instruction suggestions", &advise_program(&program));
    }
    if to_file {
        info(&format!(
            "{} {} instructions to {} ({})",
            "Wrote".green(),
            program.instructions.len(),
            args.output,
            args.format
        ));
    }
    Ok(())
}

fn print_suggestions(info: &dyn Fn(&dyn Display), heading: &str, suggestions: &[Suggestion]) {
    info(&"");
    info(&format!("=== {} ===", heading).bold());
    if suggestions.is_empty() {
        info(&"No suggestions; the kernel already suits the PIM target");
        return;
    }
    for (i, suggestion) in suggestions.iter().enumerate() {
        info(&format!("{}. {}", i + 1, suggestion));
    }
}

fn read_source(input: &str) -> CompileResult<String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| CompileError::Io {
                message: format!("Failed to read stdin: {}", e),
            })?;
        return Ok(buffer);
    }
    fs::read_to_string(input).map_err(|e| CompileError::Io {
        message: format!("Failed to read file '{}': {}", input, e),
    })
}

fn load_config(args: &Args) -> CompileResult<PimConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path).map_err(|e| CompileError::Io {
                message: format!("Failed to read config '{}': {}", path.display(), e),
            })?;
            PimConfig::from_json(&json)?
        }
        None => PimConfig::default(),
    };

    if let Some(bytes) = args.address_space {
        config.address_space_bytes = bytes;
    }
    config.validate()?;
    Ok(config)
}
