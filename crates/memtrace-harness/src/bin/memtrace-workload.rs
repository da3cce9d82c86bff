//! Small allocation workloads for running under `libmemtrace.so`.
//!
//! Every call goes through the C allocator symbols so the preloaded tracer
//! sees it. Deliberate misuse (a double free and a free of a stack address)
//! is only safe because the tracer reports those calls instead of
//! forwarding them; never run `single` without the tracer preloaded.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "memtrace-workload")]
#[command(about = "Allocation workloads for the memtrace tracer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One of each primitive, one leak, one double free, one invalid free.
    Single,
    /// Allocate, grow and free from several threads at once.
    Threads {
        #[arg(default_value_t = 4)]
        threads: usize,
        #[arg(default_value_t = 2000)]
        iterations: usize,
    },
    /// Run `single` twice as child processes sharing the trace.
    Spawn,
    /// Fork; the child frees a block the parent allocated.
    Fork,
}

fn single() {
    // SAFETY: misuse below is caught by the tracer and never forwarded.
    unsafe {
        let a = libc::malloc(64);
        let b = libc::calloc(4, 8);
        let a = libc::realloc(a, 128);
        libc::free(a);
        libc::free(b);

        let leaked = libc::malloc(4242);
        println!("leak {:#x}", leaked as usize);

        let c = libc::malloc(24);
        libc::free(c);
        libc::free(c);

        let mut local = 0u64;
        libc::free((&raw mut local).cast::<c_void>());
    }
}

fn threads(threads: usize, iterations: usize) {
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            std::thread::spawn(move || {
                for i in 0..iterations {
                    // SAFETY: each block is freed exactly once by this thread.
                    unsafe {
                        let p = libc::malloc(16 + ((i + t) % 64) * 8);
                        let q = libc::realloc(p, 256);
                        let r = libc::calloc(2, 24);
                        libc::free(q);
                        libc::free(r);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
}

fn spawn() -> ExitCode {
    let Ok(exe) = std::env::current_exe() else {
        return ExitCode::FAILURE;
    };
    for _ in 0..2 {
        match std::process::Command::new(&exe).arg("single").status() {
            Ok(status) if status.success() => {}
            _ => return ExitCode::FAILURE,
        }
    }
    ExitCode::SUCCESS
}

fn fork() -> ExitCode {
    // SAFETY: single-threaded here; the child only frees and exits.
    unsafe {
        let p = libc::malloc(96);
        println!("block {:#x}", p as usize);
        match libc::fork() {
            -1 => {
                libc::free(p);
                ExitCode::FAILURE
            }
            0 => {
                libc::free(p);
                libc::_exit(0);
            }
            child => {
                let mut status = 0;
                libc::waitpid(child, &mut status, 0);
                libc::free(p);
                if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn main() -> ExitCode {
    match Cli::parse().command {
        Command::Single => {
            single();
            ExitCode::SUCCESS
        }
        Command::Threads {
            threads: n,
            iterations,
        } => {
            threads(n, iterations);
            ExitCode::SUCCESS
        }
        Command::Spawn => spawn(),
        Command::Fork => fork(),
    }
}
