//! CLI entrypoint for the memtrace heap tracer.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use memtrace_harness::{RunOptions, runner, summary, trace_log};
use memtrace_membrane::{LogFormat, TraceMode};

/// Trace heap allocations of a program.
#[derive(Debug, Parser)]
#[command(name = "memtrace")]
#[command(about = "Heap allocation tracer: leaks, invalid and double frees")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Jsonl,
}

impl From<Format> for LogFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Text => Self::Text,
            Format::Jsonl => Self::Jsonl,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program with the tracer preloaded.
    Run {
        /// Trace format.
        #[arg(long, value_enum, default_value = "text")]
        format: Format,
        /// Trace destination (default: the program's stderr).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Path to libmemtrace.so (default: $MEMTRACE_LIB, then next to this binary).
        #[arg(long)]
        lib: Option<PathBuf>,
        /// Preload the tracer but forward every call untouched.
        #[arg(long)]
        off: bool,
        /// Only report anomalies and the final summary.
        #[arg(long)]
        quiet: bool,
        /// Program and arguments.
        #[arg(last = true, required = true)]
        command: Vec<OsString>,
    },
    /// Validate a JSONL trace.
    Check {
        /// Trace file.
        trace: PathBuf,
    },
    /// Summarize a JSONL trace.
    Summarize {
        /// Trace file.
        trace: PathBuf,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            format,
            log,
            lib,
            off,
            quiet,
            command,
        } => {
            let options = RunOptions {
                format: format.into(),
                log,
                library: lib,
                mode: if off { TraceMode::Off } else { TraceMode::Trace },
                log_calls: !quiet,
                command,
            };
            let code = runner::run(&options)?;
            std::process::exit(code);
        }
        Command::Check { trace } => {
            let (lines, errors) = trace_log::validate_trace_file(&trace)?;
            for err in &errors {
                eprintln!("{}: {err}", trace.display());
            }
            if !errors.is_empty() {
                return Err(memtrace_harness::HarnessError::InvalidTrace {
                    count: errors.len(),
                }
                .into());
            }
            println!("{}: {lines} lines OK", trace.display());
        }
        Command::Summarize { trace, json } => {
            let summary = summary::summarize_file(&trace)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render_text());
            }
        }
    }

    Ok(())
}
