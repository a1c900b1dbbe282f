// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job script rendering and step markers.
//!
//! A job runs as one POSIX `sh` script with one block per step. Each block
//! prints a start marker, runs the step in a subshell and prints an end
//! marker with the exit status; the script exits at the first failing step.
//!
//! ```text
//! ::forge-step-start::2
//! ... step output ...
//! ::forge-step-end::2::0
//! ```

use std::collections::BTreeMap;
use std::fmt::Write;

use forge_core::models::Step;

const START_PREFIX: &str = "::forge-step-start::";
const END_PREFIX: &str = "::forge-step-end::";

/// Command that runs `uses` steps inside the unit.
pub const ACTION_COMMAND: &str = "forge-action";

/// A parsed step marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Step `n` is starting.
    StepStart(i64),
    /// Step `number` ended with `exit_code`.
    StepEnd {
        /// Step number
        number: i64,
        /// Exit status of the step
        exit_code: i32,
    },
}

/// Start marker line for step `number`.
pub fn start_marker(number: i64) -> String {
    format!("{}{}", START_PREFIX, number)
}

/// End marker line for step `number`.
pub fn end_marker(number: i64, exit_code: i32) -> String {
    format!("{}{}::{}", END_PREFIX, number, exit_code)
}

/// Parse a marker line. Anything else is ordinary output.
pub fn parse_marker(line: &str) -> Option<Marker> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(START_PREFIX) {
        return rest.parse().ok().map(Marker::StepStart);
    }
    let rest = line.strip_prefix(END_PREFIX)?;
    let (number, exit_code) = rest.split_once("::")?;
    Some(Marker::StepEnd {
        number: number.parse().ok()?,
        exit_code: exit_code.parse().ok()?,
    })
}

/// Quote `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `INPUT_<NAME>` variable for an action parameter.
pub fn input_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("INPUT_{}", name)
}

/// Whether `name` can be exported by `sh`.
fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_exports(script: &mut String, env: &BTreeMap<String, String>) {
    for (name, value) in env.iter().filter(|(name, _)| is_valid_env_name(name)) {
        let _ = writeln!(script, "  export {}={}", name, shell_quote(value));
    }
}

/// Render the script for `steps`, which must be in ordinal order.
pub fn render_script(steps: &[Step]) -> String {
    let mut script = String::from("#!/bin/sh\n");

    for step in steps {
        let _ = writeln!(script, "\n# {}", step.name.replace('\n', " "));
        let _ = writeln!(script, "echo {}", shell_quote(&start_marker(step.number)));
        script.push_str("(\n");
        write_exports(&mut script, &step.env);

        match (&step.run, &step.uses) {
            (Some(run), _) => {
                script.push_str("  set -e\n");
                for line in run.lines() {
                    let _ = writeln!(script, "  {}", line);
                }
            }
            (None, Some(uses)) => {
                let inputs: BTreeMap<String, String> = step
                    .params
                    .iter()
                    .map(|(k, v)| (input_var(k), v.clone()))
                    .collect();
                write_exports(&mut script, &inputs);
                let _ = writeln!(script, "  exec {} {}", ACTION_COMMAND, shell_quote(uses));
            }
            (None, None) => script.push_str("  :\n"),
        }

        script.push_str(") 2>&1\n");
        script.push_str("__forge_rc=$?\n");
        let _ = writeln!(
            script,
            "echo \"{}{}::$__forge_rc\"",
            END_PREFIX, step.number
        );
        script.push_str("[ \"$__forge_rc\" -eq 0 ] || exit \"$__forge_rc\"\n");
    }

    script.push_str("exit 0\n");
    script
}
