//! Invocation descriptor: an immutable snapshot of a build request.
//!
//! The descriptor is produced once from the build tool's command line and is
//! only read afterwards (translation, activation checks, fallback).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::warn;

/// Project property set on the remote build so it does not re-enter Mirakle.
pub const BUILD_ON_REMOTE: &str = "mirakle.build.on.remote";

/// Project property set on the local fallback build.
pub const FALLBACK: &str = "mirakle.build.fallback";

/// Reserved task name. Excluding it (`-x mirakle`) opts out for one run.
pub const MIRAKLE_TASK: &str = "mirakle";

/// Log verbosity of the build tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Lifecycle,
    Warn,
    Quiet,
}

/// Stack trace display mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowStacktrace {
    #[default]
    InternalExceptions,
    Always,
    AlwaysFull,
}

/// Console output mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleOutput {
    #[default]
    Auto,
    Plain,
    Rich,
    Verbose,
}

impl ConsoleOutput {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "plain" => Some(Self::Plain),
            "rich" => Some(Self::Rich),
            "verbose" => Some(Self::Verbose),
            _ => None,
        }
    }
}

/// Independent boolean switches of an invocation.
///
/// The declaration order is the order in which the flags are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toggle {
    Profile,
    RerunTasks,
    RefreshDependencies,
    ContinueOnFailure,
    Offline,
    Parallel,
    ConfigureOnDemand,
}

impl Toggle {
    /// All toggles in emission order.
    pub const ALL: [Toggle; 7] = [
        Toggle::Profile,
        Toggle::RerunTasks,
        Toggle::RefreshDependencies,
        Toggle::ContinueOnFailure,
        Toggle::Offline,
        Toggle::Parallel,
        Toggle::ConfigureOnDemand,
    ];

    /// The long option passed to the build tool.
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Profile => "--profile",
            Self::RerunTasks => "--rerun-tasks",
            Self::RefreshDependencies => "--refresh-dependencies",
            Self::ContinueOnFailure => "--continue",
            Self::Offline => "--offline",
            Self::Parallel => "--parallel",
            Self::ConfigureOnDemand => "--configure-on-demand",
        }
    }

    /// The short option, for the toggles that have one.
    pub const fn short_flag(self) -> Option<&'static str> {
        match self {
            Self::RefreshDependencies => Some("-U"),
            _ => None,
        }
    }

    /// Reverse lookup of [`Toggle::flag`] and [`Toggle::short_flag`].
    pub fn from_flag(flag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|toggle| toggle.flag() == flag || toggle.short_flag() == Some(flag))
    }
}

/// Snapshot of a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub task_names: Vec<String>,
    pub excluded_task_names: Vec<String>,
    pub build_file: Option<PathBuf>,
    pub project_properties: BTreeMap<String, String>,
    pub system_properties: BTreeMap<String, String>,
    pub log_level: LogLevel,
    pub show_stacktrace: ShowStacktrace,
    pub console_output: ConsoleOutput,
    pub toggles: BTreeSet<Toggle>,
    /// `false` is encoded as `--no-rebuild`.
    pub build_project_dependencies: bool,
    pub dry_run: bool,
    pub continuous: bool,
    pub included_builds: Vec<PathBuf>,
    pub project_dir: Option<PathBuf>,
}

impl Default for InvocationDescriptor {
    fn default() -> Self {
        Self {
            task_names: Vec::new(),
            excluded_task_names: Vec::new(),
            build_file: None,
            project_properties: BTreeMap::new(),
            system_properties: BTreeMap::new(),
            log_level: LogLevel::default(),
            show_stacktrace: ShowStacktrace::default(),
            console_output: ConsoleOutput::default(),
            toggles: BTreeSet::new(),
            build_project_dependencies: true,
            dry_run: false,
            continuous: false,
            included_builds: Vec::new(),
            project_dir: None,
        }
    }
}

impl InvocationDescriptor {
    /// Parse build tool arguments.
    ///
    /// Accepts the long and short option spellings of the build tool,
    /// `--option=value` and attached `-Pkey=value` forms. Options that have
    /// no place in the descriptor are dropped with a warning.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let mut descriptor = Self::default();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            if arg == "--" {
                descriptor.task_names.extend(iter.by_ref());
                break;
            }
            if !arg.starts_with('-') || arg == "-" {
                descriptor.task_names.push(arg);
                continue;
            }

            let (name, inline) = split_inline_value(&arg);

            if let Some(toggle) = Toggle::from_flag(name) {
                descriptor.toggles.insert(toggle);
                continue;
            }

            match name {
                "-x" | "--exclude-task" => {
                    if let Some(value) = take_value(inline, &mut iter, name) {
                        descriptor.excluded_task_names.push(value);
                    }
                }
                "-b" | "--build-file" => {
                    descriptor.build_file = take_value(inline, &mut iter, name).map(PathBuf::from);
                }
                "-p" | "--project-dir" => {
                    descriptor.project_dir = take_value(inline, &mut iter, name).map(PathBuf::from);
                }
                "-P" | "--project-prop" => {
                    if let Some(value) = take_value(inline, &mut iter, name) {
                        insert_property(&mut descriptor.project_properties, &value);
                    }
                }
                "-D" | "--system-prop" => {
                    if let Some(value) = take_value(inline, &mut iter, name) {
                        insert_property(&mut descriptor.system_properties, &value);
                    }
                }
                "-d" | "--debug" => descriptor.log_level = LogLevel::Debug,
                "-i" | "--info" => descriptor.log_level = LogLevel::Info,
                "-w" | "--warn" => descriptor.log_level = LogLevel::Warn,
                "-q" | "--quiet" => descriptor.log_level = LogLevel::Quiet,
                "-s" | "--stacktrace" => descriptor.show_stacktrace = ShowStacktrace::Always,
                "-S" | "--full-stacktrace" => {
                    descriptor.show_stacktrace = ShowStacktrace::AlwaysFull
                }
                "--console" => {
                    if let Some(value) = take_value(inline, &mut iter, name) {
                        match ConsoleOutput::parse(&value) {
                            Some(mode) => descriptor.console_output = mode,
                            None => warn!("Ignoring unknown console mode '{}'", value),
                        }
                    }
                }
                "-a" | "--no-rebuild" => descriptor.build_project_dependencies = false,
                "-m" | "--dry-run" => descriptor.dry_run = true,
                "-t" | "--continuous" => descriptor.continuous = true,
                "--include-build" => {
                    if let Some(value) = take_value(inline, &mut iter, name) {
                        descriptor.included_builds.push(PathBuf::from(value));
                    }
                }
                _ => {
                    if let Some(rest) = arg.strip_prefix("-P").filter(|r| !r.is_empty()) {
                        insert_property(&mut descriptor.project_properties, rest);
                    } else if let Some(rest) = arg.strip_prefix("-D").filter(|r| !r.is_empty()) {
                        insert_property(&mut descriptor.system_properties, rest);
                    } else if let Some(rest) = arg.strip_prefix("-x").filter(|r| !r.is_empty()) {
                        descriptor.excluded_task_names.push(rest.to_string());
                    } else {
                        warn!("Option '{}' is not forwarded to the remote build", arg);
                    }
                }
            }
        }

        descriptor
    }

    /// Whether the named task was excluded with `-x`.
    pub fn excludes(&self, task: &str) -> bool {
        self.excluded_task_names.iter().any(|t| t == task)
    }

    /// Whether the named project property is present.
    pub fn has_project_property(&self, key: &str) -> bool {
        self.project_properties.contains_key(key)
    }

    /// Whether a toggle is switched on.
    pub fn is_set(&self, toggle: Toggle) -> bool {
        self.toggles.contains(&toggle)
    }
}

fn split_inline_value(arg: &str) -> (&str, Option<String>) {
    if arg.starts_with("--") {
        if let Some((name, value)) = arg.split_once('=') {
            return (name, Some(value.to_string()));
        }
    }
    (arg, None)
}

fn take_value(
    inline: Option<String>,
    iter: &mut impl Iterator<Item = String>,
    name: &str,
) -> Option<String> {
    let value = inline.or_else(|| iter.next());
    if value.is_none() {
        warn!("Option '{}' is missing its value", name);
    }
    value
}

fn insert_property(map: &mut BTreeMap<String, String>, raw: &str) {
    match raw.split_once('=') {
        Some((key, value)) => {
            map.insert(key.to_string(), value.to_string());
        }
        None => {
            map.insert(raw.to_string(), String::new());
        }
    }
}

/// Remove the `-x mirakle` opt-out from raw build tool arguments.
///
/// The reserved task does not exist for the build tool, so the opt-out must
/// not reach it when the build runs locally.
pub fn strip_opt_out(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-x" | "--exclude-task" if iter.peek().is_some_and(|v| *v == MIRAKLE_TASK) => {
                iter.next();
            }
            "-xmirakle" | "--exclude-task=mirakle" => {}
            _ => out.push(arg.clone()),
        }
    }
    out
}
