//! Maps executor outcomes onto the response contract.

use serde::Serialize;

use crate::executor::{ExecutionOutcome, JobState, Phase};

/// Uniform result returned to callers for every completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    pub error: String,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Build the response for a terminal outcome.
pub fn normalize(outcome: ExecutionOutcome) -> ExecutionResult {
    let ExecutionOutcome {
        stdout,
        stderr,
        exit_code,
        signal,
        timed_out,
        truncated,
        phase,
        state,
        time_limit,
        output_limit,
    } = outcome;

    let (output, mut error) = if phase == Phase::Compile {
        // Compilers split diagnostics between streams (tsc and javac use
        // stdout), so both belong to `error`; nothing ran, so no output.
        let mut diagnostics = stderr;
        append_note(&mut diagnostics, &stdout);
        (String::new(), diagnostics)
    } else {
        (stdout, stderr)
    };

    match state {
        JobState::TimedOut => {
            let note = match phase {
                Phase::Compile => format!(
                    "compilation exceeded time limit of {} ms",
                    time_limit.as_millis()
                ),
                Phase::Run => format!(
                    "execution exceeded time limit of {} ms",
                    time_limit.as_millis()
                ),
            };
            append_note(&mut error, &note);
        }
        JobState::Cancelled => append_note(&mut error, "execution cancelled"),
        JobState::CompileFailed | JobState::RuntimeFailed if error.trim().is_empty() => {
            let note = match (exit_code, signal) {
                (_, Some(sig)) => format!("process terminated by signal {sig}"),
                (Some(code), None) => format!("{phase} phase exited with code {code}"),
                (None, None) => format!("{phase} phase failed"),
            };
            append_note(&mut error, &note);
        }
        _ => {}
    }

    if truncated {
        append_note(&mut error, &format!("output truncated at {output_limit} bytes"));
    }

    ExecutionResult {
        output,
        error,
        timed_out,
        truncated,
    }
}

/// Append `note` on its own line.
fn append_note(text: &mut String, note: &str) {
    if note.is_empty() {
        return;
    }
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(note);
}

/// Decode captured bytes as UTF-8 without exceeding `cap` bytes.
///
/// A multi-byte sequence cut by the cap is dropped rather than replaced, and
/// the lossy result is clamped to a char boundary within the cap.
pub fn decode_output(bytes: &[u8], cap: usize) -> String {
    let bytes = &bytes[..complete_prefix_len(bytes)];
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { len - back } else { len };
    }
    len
}
