//! JSONL trace contract and validator.
//!
//! Every line written by the tracer in `jsonl` format is one JSON object:
//!
//! ```text
//! {"seq":3,"pid":4107,"level":"info","event":"allocate","size":64,"address":"0x5581c2a0"}
//! ```
//!
//! - `seq`: 1-based, strictly increasing per writing process. An `attach`
//!   record starts a new run, since an exec'd image keeps its pid.
//! - `pid`: optional positive integer naming the writing process. Several
//!   processes may append to one file, interleaving their records.
//! - `level`: `info` | `warn` | `error`, fixed per event kind.
//! - `event`: one of [`memtrace_membrane::EVENT_NAMES`].
//! - payload fields per event kind; addresses are `0x`-prefixed lowercase hex.

use std::collections::HashMap;
use std::path::Path;

use crate::error::HarnessError;

/// `(event, level, payload fields)` for every event kind.
pub const EVENT_SCHEMA: &[(&str, &str, &[&str])] = &[
    ("attach", "info", &["mode"]),
    ("detach", "info", &[]),
    ("allocate", "info", &["size", "address"]),
    ("zero_allocate", "info", &["count", "elem_size", "address"]),
    ("resize", "info", &["old_address", "size", "address"]),
    ("release", "info", &["address", "size"]),
    ("allocation_failed", "warn", &["primitive", "size"]),
    ("invalid_free", "error", &["address"]),
    ("double_free", "error", &["address", "size"]),
    ("resize_of_unknown", "warn", &["old_address", "size"]),
    ("resize_of_released", "warn", &["old_address", "size"]),
    ("tracer_degraded", "error", &["reason"]),
    ("leak_report_start", "warn", &["blocks", "bytes"]),
    ("leak", "warn", &["address", "size", "live_count"]),
    (
        "statistics",
        "info",
        &[
            "bytes_allocated",
            "bytes_freed",
            "average_allocation",
            "allocating_calls",
            "live_bytes",
            "live_blocks",
        ],
    ),
];

const ADDRESS_FIELDS: &[&str] = &["address", "old_address"];

fn schema_for(event: &str) -> Option<(&'static str, &'static [&'static str])> {
    EVENT_SCHEMA
        .iter()
        .find(|(name, _, _)| *name == event)
        .map(|(_, level, fields)| (*level, *fields))
}

/// Validation error for a trace line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for TraceValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

fn is_hex_address(s: &str) -> bool {
    s.strip_prefix("0x").is_some_and(|digits| {
        !digits.is_empty()
            && digits
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    })
}

/// Validate a single JSONL line.
///
/// Returns the parsed object if valid, or every problem found on the line.
pub fn validate_trace_line(
    line: &str,
    line_number: usize,
) -> Result<serde_json::Map<String, serde_json::Value>, Vec<TraceValidationError>> {
    let mut errors = Vec::new();
    let mut push = |field: &str, message: String| {
        errors.push(TraceValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            push("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };
    let serde_json::Value::Object(obj) = value else {
        push("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    match obj.get("seq") {
        None => push("seq", "required field missing".to_string()),
        Some(seq) if seq.as_u64().is_none_or(|n| n == 0) => {
            push("seq", format!("expected positive integer, got {seq}"));
        }
        Some(_) => {}
    }

    if let Some(pid) = obj.get("pid")
        && pid.as_u64().is_none_or(|n| n == 0)
    {
        push("pid", format!("expected positive integer, got {pid}"));
    }

    let level = obj.get("level").and_then(|v| v.as_str());
    if level.is_none() {
        push("level", "required string field missing".to_string());
    }

    match obj.get("event").and_then(|v| v.as_str()) {
        None => push("event", "required string field missing".to_string()),
        Some(event) => match schema_for(event) {
            None => push("event", format!("unknown event: '{event}'")),
            Some((expected_level, fields)) => {
                if let Some(level) = level
                    && level != expected_level
                {
                    push(
                        "level",
                        format!("'{event}' is logged at '{expected_level}', got '{level}'"),
                    );
                }
                for field in fields {
                    if !obj.contains_key(*field) {
                        push(field, format!("required for '{event}'"));
                    }
                }
            }
        },
    }

    for field in ADDRESS_FIELDS {
        if let Some(v) = obj.get(*field)
            && !v.as_str().is_some_and(is_hex_address)
        {
            push(field, format!("expected 0x-prefixed hex string, got {v}"));
        }
    }

    if errors.is_empty() {
        Ok(obj)
    } else {
        Err(errors)
    }
}

/// Validate a whole trace held in memory.
///
/// Returns the number of non-empty lines and every error found, including
/// `seq` values that do not strictly increase within one process's run.
pub fn validate_trace_str(content: &str) -> (usize, Vec<TraceValidationError>) {
    let mut all_errors = Vec::new();
    let mut line_count = 0;
    // Keyed by pid; untagged records share the `None` run.
    let mut last_seq: HashMap<Option<u64>, u64> = HashMap::new();

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        match validate_trace_line(line, i + 1) {
            Ok(obj) => {
                let seq = obj.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
                let pid = obj.get("pid").and_then(|v| v.as_u64());
                let last = last_seq.entry(pid).or_insert(0);
                if obj.get("event").and_then(|v| v.as_str()) == Some("attach") {
                    *last = 0;
                }
                if seq <= *last {
                    all_errors.push(TraceValidationError {
                        line_number: i + 1,
                        field: "seq".to_string(),
                        message: format!("{seq} does not follow {last}"),
                    });
                }
                *last = (*last).max(seq);
            }
            Err(errs) => all_errors.extend(errs),
        }
    }

    (line_count, all_errors)
}

/// Validate an entire JSONL trace file.
pub fn validate_trace_file(path: &Path) -> Result<(usize, Vec<TraceValidationError>), HarnessError> {
    let content = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
    Ok(validate_trace_str(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace_membrane::{Addr, EVENT_NAMES, TraceEvent, jsonl_line};

    #[test]
    fn schema_covers_every_event_name() {
        let names: Vec<&str> = EVENT_SCHEMA.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, EVENT_NAMES);
    }

    #[test]
    fn tracer_output_validates() {
        let line = jsonl_line(
            1,
            &TraceEvent::DoubleFree {
                address: Addr(0xabc0),
                size: 12,
            },
        )
        .expect("serialize");
        let obj = validate_trace_line(&line, 1).expect("valid line");
        assert_eq!(obj["event"], "double_free");
    }

    #[test]
    fn missing_payload_and_bad_address_are_reported() {
        let line = r#"{"seq":1,"level":"info","event":"allocate","address":"4096"}"#;
        let errors = validate_trace_line(line, 7).expect_err("invalid");
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"size"), "{errors:?}");
        assert!(fields.contains(&"address"), "{errors:?}");
        assert!(errors.iter().all(|e| e.line_number == 7));
    }

    #[test]
    fn wrong_level_and_unknown_event() {
        let errors = validate_trace_line(
            r#"{"seq":2,"level":"info","event":"invalid_free","address":"0x10"}"#,
            1,
        )
        .expect_err("level mismatch");
        assert_eq!(errors[0].field, "level");

        let errors = validate_trace_line(r#"{"seq":2,"level":"info","event":"mmap"}"#, 1)
            .expect_err("unknown event");
        assert!(errors[0].message.contains("unknown event"));
    }

    #[test]
    fn non_object_and_garbage_lines() {
        assert_eq!(
            validate_trace_line("[1,2]", 3).expect_err("array")[0].field,
            "<root>"
        );
        assert_eq!(
            validate_trace_line("not json", 4).expect_err("garbage")[0].field,
            "<json>"
        );
        let errors =
            validate_trace_line(r#"{"seq":0,"level":"info","event":"detach"}"#, 5).expect_err("seq");
        assert_eq!(errors[0].field, "seq");
    }

    #[test]
    fn seq_must_increase_across_lines() {
        let trace = concat!(
            r#"{"seq":1,"level":"info","event":"attach","mode":"trace"}"#,
            "\n\n",
            r#"{"seq":1,"level":"info","event":"detach"}"#,
            "\n"
        );
        let (lines, errors) = validate_trace_str(trace);
        assert_eq!(lines, 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 3);
    }

    #[test]
    fn interleaved_processes_keep_their_own_seq() {
        let trace = concat!(
            r#"{"seq":1,"pid":10,"level":"info","event":"attach","mode":"trace"}"#,
            "\n",
            r#"{"seq":1,"pid":11,"level":"info","event":"attach","mode":"trace"}"#,
            "\n",
            r#"{"seq":2,"pid":10,"level":"info","event":"detach"}"#,
            "\n",
            r#"{"seq":2,"pid":11,"level":"info","event":"detach"}"#,
            "\n",
            // pid 10 exec'd a new image
            r#"{"seq":1,"pid":10,"level":"info","event":"attach","mode":"trace"}"#,
            "\n",
            r#"{"seq":2,"pid":10,"level":"info","event":"detach"}"#,
            "\n",
        );
        let (lines, errors) = validate_trace_str(trace);
        assert_eq!(lines, 6);
        assert!(errors.is_empty(), "{errors:?}");

        let broken = concat!(
            r#"{"seq":4,"pid":10,"level":"info","event":"attach","mode":"trace"}"#,
            "\n",
            r#"{"seq":9,"pid":11,"level":"info","event":"attach","mode":"trace"}"#,
            "\n",
            r#"{"seq":3,"pid":10,"level":"info","event":"detach"}"#,
            "\n",
        );
        let (_, errors) = validate_trace_str(broken);
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert_eq!(errors[0].line_number, 3);
    }

    #[test]
    fn pid_must_be_positive_integer() {
        let errors = validate_trace_line(
            r#"{"seq":1,"pid":"init","level":"info","event":"detach"}"#,
            2,
        )
        .expect_err("string pid");
        assert_eq!(errors[0].field, "pid");
        assert!(validate_trace_line(r#"{"seq":1,"pid":0,"level":"info","event":"detach"}"#, 2).is_err());
        assert!(validate_trace_line(r#"{"seq":1,"pid":31,"level":"info","event":"detach"}"#, 2).is_ok());
    }

    #[test]
    fn hex_address_shape() {
        assert!(is_hex_address("0x0"));
        assert!(is_hex_address("0x7ffd1a2b"));
        assert!(!is_hex_address("0x"));
        assert!(!is_hex_address("0X10"));
        assert!(!is_hex_address("0xABC"));
        assert!(!is_hex_address("1234"));
    }
}
