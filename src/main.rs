// File: src/main.rs
//
// Command-line entry point for Smalt.
// Subcommands: run, compile, disassemble, debug, repl. Exit code 0 on
// success, 1 on any parse, compile, load or runtime error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use smalt::bcfile;
use smalt::bytecode::BytecodeUnit;
use smalt::compiler::Compiler;
use smalt::debugger::InteractiveDebugger;
use smalt::disassembler::disassemble;
use smalt::errors::SmaltError;
use smalt::repl::Repl;
use smalt::vm::Vm;

#[derive(ClapParser)]
#[command(
    name = "smalt",
    about = "Smalt: a Smalltalk-flavored scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a source file (.st) or a compiled bytecode file (.stb)
    Run {
        /// Path to the file to execute
        file: PathBuf,
    },

    /// Compile a source file to a bytecode file
    Compile {
        /// Path to the .st source file
        source: PathBuf,

        /// Path for the compiled .stb output
        out: PathBuf,
    },

    /// Print the bytecode listing of a source or compiled file
    Disassemble {
        /// Path to the file to disassemble
        file: PathBuf,
    },

    /// Run a file under the interactive single-stepping debugger
    Debug {
        /// Path to the file to execute
        file: PathBuf,
    },

    /// Launch the interactive Smalt shell
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => match load_unit(&file) {
            Ok(unit) => {
                let mut vm = Vm::new();
                match vm.run(unit) {
                    Ok(_) => ExitCode::SUCCESS,
                    Err(err) => report(err),
                }
            }
            Err(err) => report(err),
        },

        Commands::Compile { source, out } => {
            let code = match fs::read_to_string(&source) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", source.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            match Compiler::new().compile_source(&code) {
                Ok(unit) => match fs::write(&out, bcfile::encode(&unit)) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(e) => {
                        eprintln!("Failed to write {}: {}", out.display(), e);
                        ExitCode::FAILURE
                    }
                },
                Err(err) => report(err),
            }
        }

        Commands::Disassemble { file } => match load_unit(&file) {
            Ok(unit) => {
                print!("{}", disassemble(&unit));
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        },

        Commands::Debug { file } => match load_unit(&file) {
            Ok(unit) => {
                let debugger = match InteractiveDebugger::new() {
                    Ok(debugger) => debugger,
                    Err(e) => {
                        eprintln!("Failed to start debugger: {}", e);
                        return ExitCode::FAILURE;
                    }
                };
                let mut vm = Vm::new();
                vm.set_debugger(Box::new(debugger));
                match vm.run(unit) {
                    Ok(_) => ExitCode::SUCCESS,
                    Err(err) => report(err),
                }
            }
            Err(err) => report(err),
        },

        Commands::Repl => match Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    return ExitCode::FAILURE;
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

/// Load a bytecode unit from either a compiled file (detected by magic)
/// or a source file.
fn load_unit(path: &Path) -> Result<BytecodeUnit, SmaltError> {
    let bytes = fs::read(path)
        .map_err(|e| SmaltError::load_error(format!("Failed to read {}: {}", path.display(), e)))?;

    if bcfile::looks_like_bytecode(&bytes) {
        return bcfile::decode(&bytes);
    }

    let source = String::from_utf8(bytes).map_err(|e| {
        SmaltError::load_error(format!("{} is not UTF-8 source: {}", path.display(), e))
    })?;
    Compiler::new().compile_source(&source)
}

fn report(err: SmaltError) -> ExitCode {
    eprintln!("{}", err);
    ExitCode::FAILURE
}
