use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Instant,
};

use clap::Parser;
use tessera::{CodeUnit, CompileOptions, TracingDiagnostics, bytecode::check_line_jump, compile_with_diagnostics};
use tracing_subscriber::EnvFilter;

/// Tessera: compile a Python module to bytecode and print its disassembly.
///
/// - `tessera <file>` prints the disassembly of the module and every nested unit
/// - `tessera -c <source>` compiles the given source instead of a file
/// - `tessera <file> --dump out.bin` also writes the serialized code unit
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Python file to compile.
    file: Option<PathBuf>,

    /// Compile a program passed as a string.
    #[arg(short = 'c')]
    command: Option<String>,

    /// Drop `assert` statements.
    #[arg(short = 'O', long)]
    optimize: bool,

    /// Maximum stack items accumulated by a collection literal before flushing (1-31).
    #[arg(long, default_value_t = 31)]
    batch_size: u8,

    /// Maximum syntactic nesting depth.
    #[arg(long, default_value_t = tessera::DEFAULT_MAX_NESTING_DEPTH)]
    max_depth: u16,

    /// Write the serialized code unit to this path.
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Check whether a debugger could jump from the first instruction of the
    /// module to this line.
    #[arg(long)]
    jump_to: Option<u32>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let (source, filename) = match (&cli.command, &cli.file) {
        (Some(command), _) => (command.clone(), "<string>".to_owned()),
        (None, Some(path)) => match read_file(path) {
            Ok(source) => (source, path.display().to_string()),
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        },
        (None, None) => {
            eprintln!("error: expected a file or -c <source>");
            return ExitCode::FAILURE;
        }
    };

    let options = CompileOptions::new()
        .filename(filename)
        .optimize(cli.optimize)
        .collection_batch_size(cli.batch_size)
        .max_nesting_depth(cli.max_depth);
    let start = Instant::now();
    let code = match compile_with_diagnostics(&source, &options, &mut TracingDiagnostics) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error:\n{err}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(elapsed = ?start.elapsed(), "compiled {}", options.get_filename());

    print!("{code}");

    if let Some(line) = cli.jump_to {
        match check_line_jump(&code, 0, line) {
            Ok(bci) => println!("jump to line {line} is allowed (bci {bci})"),
            Err(err) => println!("jump to line {line} is not allowed: {err}"),
        }
    }

    if let Some(path) = &cli.dump
        && let Err(err) = dump(&code, path)
    {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn dump(code: &CodeUnit, path: &Path) -> Result<(), String> {
    let bytes = code.dump().map_err(|err| format!("cannot serialize code unit: {err}"))?;
    fs::write(path, bytes).map_err(|err| format!("cannot write {}: {err}", path.display()))
}

fn read_file(path: &Path) -> Result<String, String> {
    eprintln!("Reading file: {}", path.display());
    match fs::metadata(path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{} is not a file", path.display()));
            }
        }
        Err(err) => {
            return Err(format!("reading {}: {err}", path.display()));
        }
    }
    fs::read_to_string(path).map_err(|err| format!("reading {}: {err}", path.display()))
}
