//! Lumen command-line interface: REPL, file runner, and version.
//!
//! Exit codes follow the conventions of `sysexits.h`: 64 for a bad
//! invocation, 65 for a compile error, 70 for a runtime error, 74 for a
//! file I/O error. Internals return a plain `u8` rather than
//! `std::process::ExitCode`, since `ExitCode` is intentionally opaque (no
//! `Eq`, no way to inspect it) and a poor type to thread through testable
//! helper functions.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use lumen_runtime::{Vm, VmOptions};
use lumenc::CompilerConfig;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

const EX_OK: u8 = 0;
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(ClapParser)]
#[command(name = "lumen")]
#[command(about = "Lumen language REPL and runner", long_about = None)]
struct Cli {
    /// Source file to compile and run. Omit to enter the REPL; pass "ver"
    /// to print the version and exit.
    path: Option<String>,

    /// Print every dispatched instruction to stderr.
    #[arg(long)]
    trace: bool,

    /// Print each function's disassembled chunk to stderr after compiling it.
    #[arg(long)]
    trace_bytecode: bool,

    /// Value stack capacity.
    #[arg(long)]
    stack_size: Option<usize>,
}

fn main() -> ExitCode {
    ExitCode::from(run(std::env::args_os()))
}

/// Parses `args` (argv-shaped, `args[0]` the program name) and dispatches to
/// the REPL, the file runner, or `ver`. An argument shape `clap` doesn't
/// recognize (two positionals, an unknown flag, ...) exits 64 rather than
/// going through `clap`'s own `exit(2)` panic path, so every reachable exit
/// code stays inside this crate's sysexits mapping.
fn run<I, T>(args: I) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            return EX_USAGE;
        }
    };

    let mut options = VmOptions::default();
    options.trace_exec = cli.trace;
    if let Some(size) = cli.stack_size {
        options.stack_size = size;
    }
    let config = CompilerConfig { trace_bytecode: cli.trace_bytecode, ..CompilerConfig::default() };

    match cli.path.as_deref() {
        None => run_repl(options, config),
        Some("ver") => {
            println!("lumen {}", env!("CARGO_PKG_VERSION"));
            EX_OK
        }
        Some(path) => run_file(path, options, config),
    }
}

fn run_file(path: &str, options: VmOptions, config: CompilerConfig) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Can't read file '{path}': {e}");
            return EX_IOERR;
        }
    };

    let mut vm = Vm::new(options);
    let function = match lumenc::compile(&source, &mut vm, &config) {
        Ok(f) => f,
        Err(errors) => {
            for err in errors.errors() {
                eprintln!("{err}");
            }
            return EX_DATAERR;
        }
    };

    match vm.interpret(function) {
        Ok(()) => EX_OK,
        Err(_) => EX_SOFTWARE,
    }
}

/// Each line is compiled and run as its own script, but globals persist
/// across lines since they all share the same [`Vm`].
fn run_repl(options: VmOptions, config: CompilerConfig) -> u8 {
    let mut vm = Vm::new(options);
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Can't start the line editor: {e}");
            return EX_IOERR;
        }
    };

    loop {
        match editor.readline("lumen> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if line.trim().is_empty() {
                    continue;
                }
                run_line(&mut vm, &line, &config);
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }
    EX_OK
}

fn run_line(vm: &mut Vm, line: &str, config: &CompilerConfig) {
    match lumenc::compile(line, vm, config) {
        Ok(function) => {
            let _ = vm.interpret(function);
        }
        Err(errors) => {
            for err in errors.errors() {
                eprintln!("{err}");
            }
        }
    }
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_a_missing_file_is_an_io_error() {
        let code = run_file("/no/such/path.lumen", VmOptions::default(), CompilerConfig::default());
        assert_eq!(code, EX_IOERR);
    }

    #[test]
    fn running_a_file_with_a_compile_error_exits_65() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "let = ;").unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(run_file(path, VmOptions::default(), CompilerConfig::default()), EX_DATAERR);
    }

    #[test]
    fn running_a_file_with_a_runtime_error_exits_70() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "let x = 1 / 0;").unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(run_file(path, VmOptions::default(), CompilerConfig::default()), EX_SOFTWARE);
    }

    #[test]
    fn running_a_well_formed_file_succeeds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "let x = 1 + 2;").unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(run_file(path, VmOptions::default(), CompilerConfig::default()), EX_OK);
    }

    #[test]
    fn unrecognized_argument_shape_exits_64() {
        assert_eq!(run(["lumen", "one.lumen", "two.lumen"]), EX_USAGE);
    }

    #[test]
    fn unknown_flag_exits_64() {
        assert_eq!(run(["lumen", "--not-a-real-flag"]), EX_USAGE);
    }

    #[test]
    fn ver_subcommand_exits_ok() {
        assert_eq!(run(["lumen", "ver"]), EX_OK);
    }
}
