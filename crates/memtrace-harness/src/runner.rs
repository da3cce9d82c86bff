//! Launch a program under the tracer.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use memtrace_membrane::config::{ENV_FORMAT, ENV_LOG, ENV_LOG_CALLS, ENV_MODE};
use memtrace_membrane::{LogFormat, TraceMode};

use crate::error::HarnessError;

pub const LIBRARY_FILE: &str = "libmemtrace.so";
/// Overrides the library search when `--lib` is not given.
pub const ENV_LIB: &str = "MEMTRACE_LIB";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub format: LogFormat,
    pub log: Option<PathBuf>,
    pub library: Option<PathBuf>,
    pub mode: TraceMode,
    pub log_calls: bool,
    /// Program followed by its arguments.
    pub command: Vec<OsString>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            log: None,
            library: None,
            mode: TraceMode::default(),
            log_calls: true,
            command: Vec::new(),
        }
    }
}

/// Places to look for the tracer library, most specific first.
#[must_use]
pub fn library_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut out = Vec::new();
    if let Some(path) = std::env::var_os(ENV_LIB) {
        out.push(PathBuf::from(path));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        out.push(dir.join(LIBRARY_FILE));
        if let Some(parent) = dir.parent() {
            // target/<profile>/deps/.. when run from a test binary
            out.push(parent.join(LIBRARY_FILE));
        }
    }
    out
}

pub fn locate_library(explicit: Option<&Path>) -> Result<PathBuf, HarnessError> {
    let searched = library_candidates(explicit);
    searched
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or(HarnessError::LibraryNotFound { searched })
}

/// `LD_PRELOAD` value with the tracer first, keeping anything already set.
#[must_use]
pub fn preload_value(library: &Path, existing: Option<OsString>) -> OsString {
    let mut value = library.as_os_str().to_os_string();
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

/// Build the child command without starting it.
pub fn build_command(options: &RunOptions, library: &Path) -> Result<Command, HarnessError> {
    let (program, args) = options
        .command
        .split_first()
        .ok_or(HarnessError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env(
        "LD_PRELOAD",
        preload_value(library, std::env::var_os("LD_PRELOAD")),
    );
    cmd.env(
        ENV_MODE,
        if options.mode.tracing_enabled() {
            "trace"
        } else {
            "off"
        },
    );
    cmd.env(ENV_FORMAT, options.format.as_str());
    cmd.env(ENV_LOG_CALLS, if options.log_calls { "1" } else { "0" });
    match &options.log {
        Some(path) => cmd.env(ENV_LOG, path),
        None => cmd.env(ENV_LOG, "stderr"),
    };
    Ok(cmd)
}

/// Run the command under the tracer and return its exit code.
///
/// A child killed by a signal reports `128 + signal`, as shells do.
pub fn run(options: &RunOptions) -> Result<i32, HarnessError> {
    let library = locate_library(options.library.as_deref())?;
    let mut cmd = build_command(options, &library)?;
    let program = options
        .command
        .first()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let status = cmd
        .status()
        .map_err(|source| HarnessError::Spawn { program, source })?;
    Ok(exit_code(status))
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(cmd: &Command, key: &str) -> Option<OsString> {
        cmd.get_envs()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.map(ToOwned::to_owned))
    }

    #[test]
    fn preload_prepends_tracer() {
        let lib = Path::new("/opt/libmemtrace.so");
        assert_eq!(preload_value(lib, None), OsString::from("/opt/libmemtrace.so"));
        assert_eq!(
            preload_value(lib, Some(OsString::new())),
            OsString::from("/opt/libmemtrace.so")
        );
        assert_eq!(
            preload_value(lib, Some(OsString::from("libother.so"))),
            OsString::from("/opt/libmemtrace.so:libother.so")
        );
    }

    #[test]
    fn command_carries_tracer_environment() {
        let options = RunOptions {
            format: LogFormat::Jsonl,
            log: Some(PathBuf::from("/tmp/trace.jsonl")),
            mode: TraceMode::Off,
            log_calls: false,
            command: vec!["ls".into(), "-l".into()],
            ..RunOptions::default()
        };
        let cmd = build_command(&options, Path::new("/opt/libmemtrace.so")).expect("command");
        assert_eq!(cmd.get_program(), "ls");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), ["-l"]);
        assert_eq!(env_of(&cmd, ENV_FORMAT), Some("jsonl".into()));
        assert_eq!(env_of(&cmd, ENV_MODE), Some("off".into()));
        assert_eq!(env_of(&cmd, ENV_LOG_CALLS), Some("0".into()));
        assert_eq!(env_of(&cmd, ENV_LOG), Some("/tmp/trace.jsonl".into()));
        let preload = env_of(&cmd, "LD_PRELOAD").expect("preload");
        assert!(preload.to_string_lossy().starts_with("/opt/libmemtrace.so"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = build_command(&RunOptions::default(), Path::new("/x.so")).expect_err("empty");
        assert!(matches!(err, HarnessError::EmptyCommand));
    }

    #[test]
    fn explicit_library_must_exist() {
        let err = locate_library(Some(Path::new("/nonexistent/libmemtrace.so")))
            .expect_err("missing");
        match err {
            HarnessError::LibraryNotFound { searched } => {
                assert_eq!(searched, [PathBuf::from("/nonexistent/libmemtrace.so")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
