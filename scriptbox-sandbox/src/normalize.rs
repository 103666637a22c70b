//! Raw outcome to caller-facing envelope, with stack remapping

use crate::program::{SandboxProgram, BOOTSTRAP_NAME, PROGRAM_NAME};
use crate::runtime::{RawOutcome, ScriptResult};
use regex::{Captures, Regex};
use scriptbox_common::ExecutionEnvelope;
use std::sync::LazyLock;

static PROGRAM_LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{}:(\d+):(\d+)", regex::escape(PROGRAM_NAME))).unwrap()
});

/// Frames from deno_core's own JavaScript
const INTERNAL_FRAME_MARKER: &str = "ext:";

fn is_internal_frame(line: &str) -> bool {
    line.contains(INTERNAL_FRAME_MARKER) || line.contains(BOOTSTRAP_NAME)
}

fn is_frame(line: &str) -> bool {
    line.trim_start().starts_with("at ")
}

/// Rewrite a stack trace so program coordinates refer to the user's script.
///
/// Lines `line_offset + 1 ..= line_offset + user_lines` of the program are the
/// user's lines `1 ..= user_lines`. Frames located anywhere else in the
/// program are dropped, as are bootstrap and runtime-internal frames. Message
/// lines are kept, with in-script locations rewritten. A stack without any frame or
/// program location is returned unchanged.
pub fn clean_stack(stack: &str, line_offset: usize, user_lines: usize) -> String {
    let has_frames = stack.lines().any(is_frame);
    if !has_frames && !PROGRAM_LOCATION_RE.is_match(stack) {
        return stack.to_string();
    }

    let in_script = |line: usize| line > line_offset && line <= line_offset + user_lines;
    let remap = |text: &str| {
        PROGRAM_LOCATION_RE
            .replace_all(text, |caps: &Captures| match caps[1].parse::<usize>() {
                Ok(line) if in_script(line) => {
                    format!("{}:{}:{}", PROGRAM_NAME, line - line_offset, &caps[2])
                }
                _ => caps[0].to_string(),
            })
            .into_owned()
    };

    let mut cleaned = Vec::new();
    for line in stack.lines() {
        if !is_frame(line) {
            cleaned.push(remap(line));
            continue;
        }
        if is_internal_frame(line) {
            continue;
        }

        let mut locations = PROGRAM_LOCATION_RE.captures_iter(line).peekable();
        if locations.peek().is_none() {
            cleaned.push(line.to_string());
            continue;
        }
        let user_frame = locations.all(|caps| caps[1].parse().map(in_script).unwrap_or(false));
        if user_frame {
            cleaned.push(remap(line));
        }
    }

    cleaned.join("\n")
}

/// Builds envelopes for one assembled program
#[derive(Debug, Clone, Copy)]
pub struct ResultNormalizer {
    line_offset: usize,
    user_lines: usize,
}

impl ResultNormalizer {
    pub fn new(line_offset: usize, user_lines: usize) -> Self {
        Self {
            line_offset,
            user_lines,
        }
    }

    pub fn for_program(program: &SandboxProgram) -> Self {
        Self::new(program.line_offset(), program.user_lines())
    }

    /// Wrap a raw outcome into the canonical envelope
    pub fn envelope(&self, outcome: RawOutcome) -> ExecutionEnvelope {
        match outcome.result {
            ScriptResult::Returned(value) => ExecutionEnvelope::with_output(value, outcome.logs),
            ScriptResult::Failed { stack } => ExecutionEnvelope::with_error(
                clean_stack(&stack, self.line_offset, self.user_lines),
                outcome.logs,
            ),
        }
    }
}
