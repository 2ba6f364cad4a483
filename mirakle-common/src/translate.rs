//! Translation of an [`InvocationDescriptor`] into build tool arguments.
//!
//! The output is deterministic: properties are emitted in key order and every
//! option that takes a value is emitted as two separate tokens, so the same
//! list works as an ssh remote command and as a local argv.

use crate::invocation::{ConsoleOutput, InvocationDescriptor, LogLevel, ShowStacktrace, Toggle};
use std::collections::BTreeSet;

/// Negated toggles: emitted when the descriptor field is `false`.
const NEGATIVE_FLAGS: &[(fn(&InvocationDescriptor) -> bool, &str)] =
    &[(builds_project_dependencies, "--no-rebuild")];

fn builds_project_dependencies(descriptor: &InvocationDescriptor) -> bool {
    descriptor.build_project_dependencies
}

const LOG_LEVEL_FLAGS: &[(LogLevel, &str)] = &[
    (LogLevel::Debug, "--debug"),
    (LogLevel::Info, "--info"),
    (LogLevel::Warn, "--warn"),
    (LogLevel::Quiet, "--quiet"),
];

const STACKTRACE_FLAGS: &[(ShowStacktrace, &str)] = &[
    (ShowStacktrace::Always, "--stacktrace"),
    (ShowStacktrace::AlwaysFull, "--full-stacktrace"),
];

// Auto is the build tool's default and is never passed.
const CONSOLE_FLAGS: &[(ConsoleOutput, &str)] = &[
    (ConsoleOutput::Plain, "plain"),
    (ConsoleOutput::Rich, "rich"),
    (ConsoleOutput::Verbose, "verbose"),
];

/// Convert a descriptor into an argument list for an equivalent build.
pub fn to_args(descriptor: &InvocationDescriptor) -> Vec<String> {
    let mut args: Vec<String> = descriptor.task_names.clone();

    for task in &descriptor.excluded_task_names {
        args.push("--exclude-task".to_string());
        args.push(task.clone());
    }

    if let Some(build_file) = &descriptor.build_file {
        args.push("-b".to_string());
        args.push(build_file.display().to_string());
    }

    args.extend(
        Toggle::ALL
            .iter()
            .filter(|toggle| descriptor.is_set(**toggle))
            .map(|toggle| toggle.flag().to_string()),
    );

    args.extend(
        NEGATIVE_FLAGS
            .iter()
            .filter(|(param, _)| !param(descriptor))
            .map(|(_, flag)| flag.to_string()),
    );

    for (key, value) in &descriptor.project_properties {
        args.push("--project-prop".to_string());
        args.push(format!("{key}={value}"));
    }

    for (key, value) in &descriptor.system_properties {
        args.push("--system-prop".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some((_, flag)) = LOG_LEVEL_FLAGS
        .iter()
        .find(|(level, _)| *level == descriptor.log_level)
    {
        args.push(flag.to_string());
    }

    if let Some((_, flag)) = STACKTRACE_FLAGS
        .iter()
        .find(|(mode, _)| *mode == descriptor.show_stacktrace)
    {
        args.push(flag.to_string());
    }

    if let Some((_, mode)) = CONSOLE_FLAGS
        .iter()
        .find(|(console, _)| *console == descriptor.console_output)
    {
        args.push("--console".to_string());
        args.push(mode.to_string());
    }

    args
}

/// Recover the toggle set and the build-project-dependencies flag from a
/// translated argument list.
pub fn decode_toggles(args: &[String]) -> (BTreeSet<Toggle>, bool) {
    let toggles = args
        .iter()
        .filter_map(|arg| Toggle::from_flag(arg))
        .collect();
    let build_project_dependencies = !args.iter().any(|arg| arg == "--no-rebuild");
    (toggles, build_project_dependencies)
}
