//! `via` — run, build, and disassemble via programs (§6.1).

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser)]
#[command(name = "via")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "via language toolchain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a via source file to completion
    Run {
        /// Input source file
        input: PathBuf,

        /// Disable constant folding and other opt_level >= 1 passes
        #[arg(long)]
        no_opt: bool,
    },
    /// Compile a via source file and print its disassembled bytecode
    Disassemble {
        /// Input source file
        input: PathBuf,

        /// Disable constant folding and other opt_level >= 1 passes
        #[arg(long)]
        no_opt: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("via=info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { input, no_opt } => run(&input, no_opt),
        Commands::Disassemble { input, no_opt } => disassemble(&input, no_opt),
    }
}

fn options(no_opt: bool) -> via::CompileOptions {
    via::CompileOptions { opt_level: u8::from(!no_opt) }
}

fn read_source(path: &PathBuf) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(source) => Some(source),
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read source file");
            None
        }
    }
}

fn run(input: &PathBuf, no_opt: bool) -> ExitCode {
    let Some(source) = read_source(input) else { return ExitCode::FAILURE };
    match via::run(&source, Box::new(std::io::stdout()), options(no_opt)) {
        Ok(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn disassemble(input: &PathBuf, no_opt: bool) -> ExitCode {
    let Some(source) = read_source(input) else { return ExitCode::FAILURE };
    match via::disassemble(&source, options(no_opt)) {
        Ok(listing) => {
            print!("{listing}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
